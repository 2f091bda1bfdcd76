//! Environment-based configuration (spec §6 "Configuration").
//!
//! Resolution chain: env var (plus an optional `.env` loaded via
//! `dotenvy`) falling back to the default named in spec §6, same idiom as
//! the teacher's `GatorConfig::resolve`.

use haivemind_core::runner::RunnerConfig;
use haivemind_state::models::ProjectSettings;

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub agent_timeout_ms: u64,
    pub orchestrator_timeout_ms: u64,
    pub session_retention_ms: u64,
    pub max_agent_output_bytes: usize,
    pub stall_threshold_ms: u64,
    pub stall_check_interval_ms: u64,
    pub default_backend: String,
    pub swarm_enabled: bool,
    pub plugins_dir: Option<String>,
    pub plugins_autoload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl EngineConfig {
    /// Load `.env` (if present) then resolve every variable named in spec
    /// §6, falling back to defaults when unset.
    pub fn resolve() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: env_parse("PORT", 8787),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: match std::env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            max_concurrency: env_parse("HAIVEMIND_MAX_CONCURRENCY", ProjectSettings::default().max_concurrency),
            max_retries: env_parse("HAIVEMIND_MAX_RETRIES", ProjectSettings::default().max_retries_total),
            agent_timeout_ms: env_parse("HAIVEMIND_AGENT_TIMEOUT_MS", 15 * 60 * 1000),
            orchestrator_timeout_ms: env_parse("HAIVEMIND_ORCHESTRATOR_TIMEOUT_MS", 3_000),
            session_retention_ms: env_parse("HAIVEMIND_SESSION_RETENTION_MS", 7 * 24 * 60 * 60 * 1000),
            max_agent_output_bytes: env_parse("HAIVEMIND_MAX_AGENT_OUTPUT_BYTES", 256 * 1024),
            stall_threshold_ms: env_parse("HAIVEMIND_STALL_THRESHOLD_MS", RunnerConfig::default().stall_threshold_ms),
            stall_check_interval_ms: env_parse(
                "HAIVEMIND_STALL_CHECK_INTERVAL_MS",
                RunnerConfig::default().stall_check_interval_ms,
            ),
            default_backend: std::env::var("HAIVEMIND_DEFAULT_BACKEND").unwrap_or_else(|_| "claude-code".to_string()),
            swarm_enabled: env_parse("HAIVEMIND_SWARM_ENABLED", true),
            plugins_dir: std::env::var("HAIVEMIND_PLUGINS_DIR").ok(),
            plugins_autoload: env_parse("HAIVEMIND_PLUGINS_AUTOLOAD", false),
        }
    }

    /// Project-wide task-runner tunables derived from this config.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            stall_threshold_ms: self.stall_threshold_ms,
            stall_check_interval_ms: self.stall_check_interval_ms,
            ..RunnerConfig::default()
        }
    }

    /// Default project settings seeded from this config, before any
    /// project-specific `settings.json` override is applied.
    pub fn default_project_settings(&self) -> ProjectSettings {
        ProjectSettings {
            max_concurrency: self.max_concurrency,
            max_retries_total: self.max_retries,
            ..ProjectSettings::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        let _lock = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("HAIVEMIND_TEST_KEY") };
        assert_eq!(env_parse("HAIVEMIND_TEST_KEY", 42u32), 42);
    }

    #[test]
    fn env_parse_reads_a_valid_value() {
        let _lock = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("HAIVEMIND_TEST_KEY", "99") };
        assert_eq!(env_parse("HAIVEMIND_TEST_KEY", 42u32), 99);
        unsafe { std::env::remove_var("HAIVEMIND_TEST_KEY") };
    }

    #[test]
    fn log_format_defaults_to_pretty() {
        let _lock = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("LOG_FORMAT") };
        let cfg = EngineConfig::resolve();
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }
}
