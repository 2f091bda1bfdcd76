//! Startup recovery: move checkpoints orphaned by a crash/restart into the
//! interrupted inbox so the control plane can surface them for resume or
//! rollback (spec §4.6 "Recovery").

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use crate::snapshot::migrate_orphaned_checkpoints;

/// Run once at process startup, before accepting any new sessions. Scans
/// every known project directory for `running`-status checkpoints left
/// behind by a prior process and migrates them into `base_dir`'s
/// interrupted inbox.
pub fn recover_orphaned_sessions(base_dir: &Path, project_dirs: &[PathBuf]) -> Result<Vec<Uuid>> {
    let migrated = migrate_orphaned_checkpoints(base_dir, project_dirs)?;
    if migrated.is_empty() {
        info!("no orphaned sessions found on startup");
    } else {
        warn!(count = migrated.len(), "migrated orphaned sessions to interrupted inbox");
    }
    Ok(migrated)
}
