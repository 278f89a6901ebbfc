//! Daily file-retention sweeper.
//!
//! Wakes hourly; when the local hour matches the configured check hour and
//! the sweep has not run today, deletes aged top-level files from the
//! telegram-files and output directories. Subdirectories are never touched
//! and per-file errors never abort the pass.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{NaiveDate, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cron::clock::resolve_timezone;
use crate::paths::WorkspacePaths;

pub struct CleanupSweeper {
    config: Arc<Config>,
    paths: Arc<WorkspacePaths>,
}

impl CleanupSweeper {
    pub fn new(config: Arc<Config>, paths: Arc<WorkspacePaths>) -> Self {
        Self { config, paths }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(check_hour = self.config.cleanup.check_hour, "cleanup sweeper started");
        let mut done_for: Option<NaiveDate> = None;

        loop {
            let tz = resolve_timezone(None, self.config.timezone.as_deref());
            let local = Utc::now().with_timezone(&tz);
            if local.hour() as u8 == self.config.cleanup.check_hour
                && done_for != Some(local.date_naive())
            {
                self.sweep_all();
                done_for = Some(local.date_naive());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cleanup sweeper stopped");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            }
        }
    }

    fn sweep_all(&self) {
        sweep_dir(
            &self.paths.telegram_files_dir,
            self.config.cleanup.telegram_files_retention_days,
        );
        sweep_dir(
            &self.paths.output_dir,
            self.config.cleanup.output_retention_days,
        );
    }
}

/// Unlink top-level files older than `retention_days`. Directories and
/// anything unreadable are skipped.
fn sweep_dir(dir: &Path, retention_days: u64) {
    let max_age = Duration::from_secs(retention_days * 24 * 3600);
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "sweep target unreadable");
            return;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > max_age {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %path.display(), error = %e, "failed to delete aged file"),
            }
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "retention sweep complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sweep_removes_only_top_level_files() {
        let dir = tempfile::tempdir().unwrap();
        let old_file = dir.path().join("old.txt");
        fs::write(&old_file, "x").unwrap();
        let sub = dir.path().join("2026-07-01");
        fs::create_dir(&sub).unwrap();
        let nested = sub.join("keep.txt");
        fs::write(&nested, "y").unwrap();

        // Zero retention treats every top-level file as aged.
        std::thread::sleep(Duration::from_millis(20));
        sweep_dir(dir.path(), 0);

        assert!(!old_file.exists(), "top-level file should be swept");
        assert!(sub.exists(), "subdirectory must remain");
        assert!(nested.exists(), "nested file must remain");
    }

    #[test]
    fn test_sweep_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.txt");
        fs::write(&fresh, "x").unwrap();

        sweep_dir(dir.path(), 14);
        assert!(fresh.exists());
    }

    #[test]
    fn test_sweep_missing_dir_is_quiet() {
        sweep_dir(Path::new("/nonexistent/relaybot-test"), 7);
    }
}
