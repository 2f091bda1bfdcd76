//! Output Summarizer: a pure function over an agent's concatenated raw
//! output, extracting a structured [`OutputSummary`] with pre-compiled
//! regex patterns. Spec §4.5.

use std::sync::LazyLock;

use regex::Regex;

use haivemind_state::models::{OutputSummary, TestCounts};

const MAX_FILES_CHANGED: usize = 30;
const MAX_FILES_DELETED: usize = 15;
const MAX_ERRORS: usize = 15;
const MAX_WARNINGS: usize = 8;
const MAX_COMMANDS: usize = 10;
const MAX_TEST_DETAILS: usize = 10;
const CONTEXT_FALLBACK_THRESHOLD: usize = 200;
const RAW_TAIL_BYTES: usize = 1024;

static FILES_CHANGED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"create mode \d+ (?P<path>\S+)").unwrap(),
        Regex::new(r"(?:Created|Modified|Updated|Wrote|Writing) file:\s*(?P<path>\S+)").unwrap(),
        Regex::new(r"diff --git a/(?P<path>\S+) b/\S+").unwrap(),
        Regex::new(r"^>\s*(?P<path>\S+\.\w+)\s*$").unwrap(),
    ]
});

static FILES_DELETED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"delete mode \d+ (?P<path>\S+)").unwrap(),
        Regex::new(r"(?:Deleted|Removed) file:\s*(?P<path>\S+)").unwrap(),
    ]
});

static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^Error:.*$").unwrap(),
        Regex::new(r"^TypeError:.*$").unwrap(),
        Regex::new(r"^ENOENT:.*$").unwrap(),
        Regex::new(r"^error TS\d+:.*$").unwrap(),
        Regex::new(r"^panic:.*$").unwrap(),
        Regex::new(r"^Traceback.*$").unwrap(),
        Regex::new(r"^FAIL .*$").unwrap(),
    ]
});

static WARNING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^Warning:.*$").unwrap(),
        Regex::new(r"^WARN .*$").unwrap(),
        Regex::new(r"^deprecated:.*$").unwrap(),
    ]
});

static COMMAND_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^\$\s*(?P<cmd>.+)$").unwrap(),
        Regex::new(r"^>\s*(?P<cmd>.+)$").unwrap(),
        Regex::new(r"^Running:\s*(?P<cmd>.+)$").unwrap(),
    ]
});

// Test-framework matchers, ordered most-to-least specific so the first
// match wins (spec: "precedence ensuring the most specific match wins").
static JEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tests:\s*(?:(?P<failed>\d+) failed,\s*)?(?:(?P<skipped>\d+) skipped,\s*)?(?P<passed>\d+) passed").unwrap());
static PYTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?P<passed>\d+) passed)?(?:,?\s*(?P<failed>\d+) failed)?(?:,?\s*(?P<skipped>\d+) skipped)?\s+in [\d.]+s").unwrap()
});
static GO_TEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?:ok|FAIL)\s+\S+\s").unwrap());
static GO_TEST_FAIL_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^--- FAIL:\s*(?P<name>.+)$").unwrap());
static JEST_FAIL_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(?:✕|✗|×)\s*(?P<name>.+)$").unwrap());
static PLAYWRIGHT_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<passed>\d+) passed(?:,\s*(?P<failed>\d+) failed)?").unwrap());

fn extract_first_capture<'a>(patterns: &[Regex], line: &'a str, group: &str) -> Option<&'a str> {
    patterns.iter().find_map(|re| re.captures(line).and_then(|c| c.name(group)).map(|m| m.as_str()))
}

fn push_deduped(list: &mut Vec<String>, value: String, cap: usize) {
    if list.len() < cap && !list.contains(&value) {
        list.push(value);
    }
}

/// Summarize a block of concatenated agent output into a structured
/// [`OutputSummary`]. Pure function; deterministic for the same input.
pub fn summarize(raw_output: &str) -> OutputSummary {
    let mut summary = OutputSummary::default();
    let mut tests = TestCounts::default();

    for line in raw_output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(path) = extract_first_capture(&FILES_CHANGED_PATTERNS, trimmed, "path") {
            push_deduped(&mut summary.files_changed, path.to_string(), MAX_FILES_CHANGED);
        }
        if let Some(path) = extract_first_capture(&FILES_DELETED_PATTERNS, trimmed, "path") {
            push_deduped(&mut summary.files_deleted, path.to_string(), MAX_FILES_DELETED);
        }
        if ERROR_PATTERNS.iter().any(|re| re.is_match(trimmed)) {
            push_deduped(&mut summary.errors, trimmed.to_string(), MAX_ERRORS);
        }
        if WARNING_PATTERNS.iter().any(|re| re.is_match(trimmed)) {
            push_deduped(&mut summary.warnings, trimmed.to_string(), MAX_WARNINGS);
        }
        if let Some(cmd) = extract_first_capture(&COMMAND_PATTERNS, trimmed, "cmd") {
            push_deduped(&mut summary.commands, cmd.to_string(), MAX_COMMANDS);
        }

        apply_test_matchers(trimmed, &mut tests);
    }

    summary.tests = tests;
    summary.digest = build_digest(&summary);
    summary
}

/// Apply test-framework matchers in most-to-least-specific order. The
/// first matcher whose pattern fires for this line wins; later matchers
/// are skipped for that line.
fn apply_test_matchers(line: &str, tests: &mut TestCounts) {
    if let Some(caps) = JEST_SUMMARY.captures(line) {
        apply_counts(caps, tests);
    } else if let Some(caps) = PLAYWRIGHT_SUMMARY.captures(line) {
        apply_counts(caps, tests);
    } else if GO_TEST_SUMMARY.is_match(line) {
        if line.starts_with("FAIL") {
            tests.failed += 1;
        } else {
            tests.passed += 1;
        }
    } else if let Some(caps) = PYTEST_SUMMARY.captures(line) {
        apply_counts(caps, tests);
    }

    if let Some(caps) = GO_TEST_FAIL_LINE.captures(line) {
        push_detail(tests, caps.name("name").map(|m| m.as_str()).unwrap_or(line));
    } else if let Some(caps) = JEST_FAIL_LINE.captures(line) {
        push_detail(tests, caps.name("name").map(|m| m.as_str()).unwrap_or(line));
    }
}

fn apply_counts(caps: regex::Captures<'_>, tests: &mut TestCounts) {
    if let Some(p) = caps.name("passed").and_then(|m| m.as_str().parse::<u32>().ok()) {
        tests.passed += p;
    }
    if let Some(f) = caps.name("failed").and_then(|m| m.as_str().parse::<u32>().ok()) {
        tests.failed += f;
    }
    if let Some(s) = caps.name("skipped").and_then(|m| m.as_str().parse::<u32>().ok()) {
        tests.skipped += s;
    }
}

fn push_detail(tests: &mut TestCounts, detail: &str) {
    if tests.details.len() < MAX_TEST_DETAILS && !tests.details.iter().any(|d| d == detail) {
        tests.details.push(detail.to_string());
    }
}

fn build_digest(summary: &OutputSummary) -> String {
    let mut parts = Vec::new();
    if !summary.files_changed.is_empty() {
        parts.push(format!("{} file(s) changed", summary.files_changed.len()));
    }
    if !summary.files_deleted.is_empty() {
        parts.push(format!("{} file(s) deleted", summary.files_deleted.len()));
    }
    if !summary.errors.is_empty() {
        parts.push(format!("{} error(s)", summary.errors.len()));
    }
    if !summary.warnings.is_empty() {
        parts.push(format!("{} warning(s)", summary.warnings.len()));
    }
    if summary.tests.passed + summary.tests.failed + summary.tests.skipped > 0 {
        parts.push(format!(
            "tests: {} passed, {} failed, {} skipped",
            summary.tests.passed, summary.tests.failed, summary.tests.skipped
        ));
    }
    if parts.is_empty() {
        "no significant output detected".to_string()
    } else {
        parts.join("; ")
    }
}

/// Render a Markdown "Previous Attempt Summary" block for injection into a
/// retry prompt, falling back to the raw output tail if the rendered
/// summary is too thin to be useful.
pub fn summary_to_context(summary: &OutputSummary, raw_tail: Option<&str>) -> String {
    let mut out = String::from("## Previous Attempt Summary\n\n");
    out.push_str(&format!("{}\n", summary.digest));

    let mut section = |title: &str, items: &[String]| {
        if !items.is_empty() {
            out.push_str(&format!("\n**{title}**:\n"));
            for item in items {
                out.push_str(&format!("- {item}\n"));
            }
        }
    };
    section("Files changed", &summary.files_changed);
    section("Files deleted", &summary.files_deleted);
    section("Errors", &summary.errors);
    section("Warnings", &summary.warnings);
    if !summary.tests.details.is_empty() {
        section("Failing tests", &summary.tests.details);
    }

    if out.trim().len() < CONTEXT_FALLBACK_THRESHOLD {
        if let Some(tail) = raw_tail {
            let tail_start = tail.len().saturating_sub(RAW_TAIL_BYTES);
            let mut start = tail_start;
            while start < tail.len() && !tail.is_char_boundary(start) {
                start += 1;
            }
            out.push_str("\n**Raw output tail**:\n```\n");
            out.push_str(&tail[start..]);
            out.push_str("\n```\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_files_changed_from_git_style_output() {
        let raw = "diff --git a/src/main.rs b/src/main.rs\n create mode 100644 src/lib.rs\n";
        let summary = summarize(raw);
        assert!(summary.files_changed.contains(&"src/main.rs".to_string()));
        assert!(summary.files_changed.contains(&"src/lib.rs".to_string()));
    }

    #[test]
    fn extracts_errors_and_warnings() {
        let raw = "Error: something broke\nWarning: deprecated API\n";
        let summary = summarize(raw);
        assert_eq!(summary.errors, vec!["Error: something broke".to_string()]);
        assert_eq!(summary.warnings, vec!["Warning: deprecated API".to_string()]);
    }

    #[test]
    fn extracts_jest_test_summary() {
        let raw = "Tests:       2 failed, 1 skipped, 10 passed, 13 total\n";
        let summary = summarize(raw);
        assert_eq!(summary.tests.passed, 10);
        assert_eq!(summary.tests.failed, 2);
        assert_eq!(summary.tests.skipped, 1);
    }

    #[test]
    fn extracts_go_test_failure_detail() {
        let raw = "--- FAIL: TestFoo (0.01s)\nFAIL github.com/example/pkg 0.012s\n";
        let summary = summarize(raw);
        assert!(summary.tests.details.iter().any(|d| d.starts_with("TestFoo")));
        assert_eq!(summary.tests.failed, 1);
    }

    #[test]
    fn extracts_commands() {
        let raw = "$ cargo test\nRunning: cargo build --release\n";
        let summary = summarize(raw);
        assert!(summary.commands.contains(&"cargo test".to_string()));
        assert!(summary.commands.contains(&"cargo build --release".to_string()));
    }

    #[test]
    fn lists_are_capped_and_deduplicated() {
        let mut raw = String::new();
        for i in 0..20 {
            raw.push_str(&format!("Error: duplicate issue\nWarning: distinct warning {i}\n"));
        }
        let summary = summarize(&raw);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.warnings.len(), MAX_WARNINGS);
    }

    #[test]
    fn digest_reflects_counts() {
        let raw = "Error: boom\n";
        let summary = summarize(raw);
        assert!(summary.digest.contains("1 error"));
    }

    #[test]
    fn digest_for_empty_output() {
        let summary = summarize("");
        assert_eq!(summary.digest, "no significant output detected");
    }

    #[test]
    fn context_falls_back_to_raw_tail_when_thin() {
        let summary = OutputSummary::default();
        let raw_tail = "x".repeat(2000);
        let context = summary_to_context(&summary, Some(&raw_tail));
        assert!(context.contains("Raw output tail"));
        assert_eq!(context.matches('x').count(), RAW_TAIL_BYTES);
    }

    #[test]
    fn context_omits_raw_tail_when_rich_enough() {
        let summary = OutputSummary {
            files_changed: (0..MAX_FILES_CHANGED)
                .map(|i| format!("src/module_{i}/very_long_descriptive_file_name.rs"))
                .collect(),
            errors: (0..MAX_ERRORS).map(|i| format!("Error: detailed failure description number {i}")).collect(),
            digest: "10 file(s) changed; 15 error(s)".to_string(),
            ..Default::default()
        };
        let context = summary_to_context(&summary, Some("should not appear"));
        assert!(!context.contains("should not appear"));
    }
}
