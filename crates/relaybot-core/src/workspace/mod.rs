//! Workspace initialization and file synchronization.
//!
//! `init` is idempotent: it migrates the legacy tasks directory, seeds the
//! embedded templates by zone, guarantees the required directory set, pairs
//! the two rule-file conventions, removes orphan symlinks, and runs a skill
//! sync pass. Two light watchers keep rule pairing and skill sync fresh
//! while the bot runs.

pub mod skills;
pub mod templates;

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paths::WorkspacePaths;
use crate::CoreError;
use templates::{Zone, RULE_FILE_A, RULE_FILE_B, TEMPLATES};

const RULE_PAIR_INTERVAL: Duration = Duration::from_secs(10);
const SKILL_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Directory names skipped by every workspace walk.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".cache",
    "target",
];

/// Markers delimiting the injected runtime-environment section in the
/// workspace-root rule files.
const RUNTIME_ENV_BEGIN: &str = "<!-- relaybot:runtime-env -->";
const RUNTIME_ENV_END: &str = "<!-- /relaybot:runtime-env -->";

/// Materialize the on-disk layout. Safe to call on every start.
pub fn init(paths: &WorkspacePaths) -> Result<(), CoreError> {
    migrate_legacy_tasks(paths);

    for dir in paths.required_dirs() {
        std::fs::create_dir_all(dir)
            .map_err(|e| CoreError::infra(format!("create {}", dir.display()), e))?;
    }

    seed_templates(paths)?;
    pair_rule_files(&paths.workspace_dir);
    remove_orphan_symlinks(&paths.workspace_dir);
    skills::sync_once(&skills::sync_dirs(paths));
    info!(root = %paths.root.display(), "workspace initialized");
    Ok(())
}

/// One-time rename of the legacy `tasks` directory.
fn migrate_legacy_tasks(paths: &WorkspacePaths) {
    if paths.legacy_tasks_dir.is_dir() && !paths.cron_tasks_dir.exists() {
        match std::fs::rename(&paths.legacy_tasks_dir, &paths.cron_tasks_dir) {
            Ok(()) => info!("migrated legacy tasks directory to cron_tasks"),
            Err(e) => warn!(error = %e, "legacy tasks migration failed"),
        }
    }
}

/// Seed embedded templates. Zone-always targets are overwritten; zone-once
/// targets only created. Symlinked targets are always left alone.
fn seed_templates(paths: &WorkspacePaths) -> Result<(), CoreError> {
    for template in TEMPLATES {
        let target = paths.workspace_dir.join(template.rel_path);
        if is_symlink(&target) {
            continue;
        }
        let write = match template.zone {
            Zone::Always => {
                // Avoid mtime churn when the content already matches.
                std::fs::read_to_string(&target)
                    .map(|current| current != template.content)
                    .unwrap_or(true)
            }
            Zone::Once => !target.exists(),
        };
        if !write {
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::infra(format!("create {}", parent.display()), e))?;
        }
        std::fs::write(&target, template.content)
            .map_err(|e| CoreError::infra(format!("seed {}", target.display()), e))?;
        #[cfg(unix)]
        if template.rel_path.ends_with(".sh") {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755));
        }
    }
    Ok(())
}

/// For every directory holding exactly one of the two rule-file names,
/// create the missing one as a copy; when both exist and differ, the newer
/// file overwrites the older.
pub fn pair_rule_files(root: &Path) {
    walk_dirs(root, &mut |dir| {
        let a = dir.join(RULE_FILE_A);
        let b = dir.join(RULE_FILE_B);
        match (a.is_file(), b.is_file()) {
            (true, false) => copy_rule(&a, &b),
            (false, true) => copy_rule(&b, &a),
            (true, true) => {
                let Ok(content_a) = std::fs::read_to_string(&a) else {
                    return;
                };
                let Ok(content_b) = std::fs::read_to_string(&b) else {
                    return;
                };
                if content_a == content_b {
                    return;
                }
                let mtime_a = crate::store::file_mtime(&a);
                let mtime_b = crate::store::file_mtime(&b);
                if mtime_a >= mtime_b {
                    copy_rule(&a, &b);
                } else {
                    copy_rule(&b, &a);
                }
            }
            (false, false) => {}
        }
    });
}

fn copy_rule(from: &Path, to: &Path) {
    if let Err(e) = std::fs::copy(from, to) {
        warn!(from = %from.display(), to = %to.display(), error = %e, "rule pairing failed");
    } else {
        debug!(from = %from.display(), to = %to.display(), "paired rule file");
    }
}

/// Depth-first walk over real directories, skipping ignored and hidden
/// names and never following symlinks.
fn walk_dirs(root: &Path, visit: &mut dyn FnMut(&Path)) {
    if !root.is_dir() || is_symlink(root) {
        return;
    }
    visit(root);
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || is_symlink(&path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_str()) {
            continue;
        }
        walk_dirs(&path, visit);
    }
}

/// Remove top-level symlinks in the workspace root whose target is gone.
fn remove_orphan_symlinks(root: &Path) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if is_symlink(&path) && std::fs::metadata(&path).is_err() {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(link = %path.display(), "removed orphan symlink"),
                Err(e) => warn!(link = %path.display(), error = %e, "orphan removal failed"),
            }
        }
    }
}

/// Append (or refresh) the marked runtime-environment section in both
/// workspace-root rule files.
pub fn inject_runtime_env(paths: &WorkspacePaths, sandboxed: bool) {
    let mode = if sandboxed {
        "Execution is sandboxed: commands run inside a container; host paths \
         outside the workspace are not reachable."
    } else {
        "Execution is direct on the host: commands run with the bot user's \
         permissions. Be deliberate with destructive operations."
    };
    let section = format!("{RUNTIME_ENV_BEGIN}\n## Runtime environment\n\n{mode}\n{RUNTIME_ENV_END}");

    for name in [RULE_FILE_A, RULE_FILE_B] {
        let path = paths.workspace_dir.join(name);
        let Ok(current) = std::fs::read_to_string(&path) else {
            continue;
        };
        let updated = match (current.find(RUNTIME_ENV_BEGIN), current.find(RUNTIME_ENV_END)) {
            (Some(start), Some(end)) => {
                let tail_start = end + RUNTIME_ENV_END.len();
                format!("{}{}{}", &current[..start], section, &current[tail_start..])
            }
            _ => format!("{}\n\n{}\n", current.trim_end(), section),
        };
        if updated != current {
            if let Err(e) = std::fs::write(&path, updated) {
                warn!(file = %path.display(), error = %e, "runtime env injection failed");
            }
        }
    }
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

// ── Watchers ────────────────────────────────────────────────────────

/// Re-pair rule files every few seconds so files the agent writes get
/// their twin promptly.
pub async fn rule_pair_watcher(paths: std::sync::Arc<WorkspacePaths>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RULE_PAIR_INTERVAL) => {
                let root = paths.workspace_dir.clone();
                let result = tokio::task::spawn_blocking(move || pair_rule_files(&root)).await;
                if result.is_err() {
                    warn!("rule pairing pass panicked");
                }
            }
        }
    }
}

/// Periodic skill synchronization.
pub async fn skill_sync_watcher(paths: std::sync::Arc<WorkspacePaths>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SKILL_SYNC_INTERVAL) => {
                let dirs = skills::sync_dirs(&paths);
                let result = tokio::task::spawn_blocking(move || skills::sync_once(&dirs)).await;
                if result.is_err() {
                    warn!("skill sync pass panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_root() -> (tempfile::TempDir, WorkspacePaths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::with_root(tmp.path());
        init(&paths).unwrap();
        (tmp, paths)
    }

    #[test]
    fn test_init_creates_layout() {
        let (_tmp, paths) = init_root();
        assert!(paths.cron_tasks_dir.is_dir());
        assert!(paths.skills_dir.is_dir());
        assert!(paths.output_dir.is_dir());
        assert!(paths.workspace_dir.join(RULE_FILE_A).is_file());
        assert!(paths.workspace_dir.join(RULE_FILE_B).is_file());
        assert!(paths.memory_file.is_file());
    }

    #[test]
    fn test_zone_once_preserved_zone_always_restored() {
        let (_tmp, paths) = init_root();

        // User edits a zone-once file and a zone-always file.
        fs::write(&paths.memory_file, "my notes").unwrap();
        let tool = paths.workspace_dir.join("tools/cron_tools/cron_list.sh");
        fs::write(&tool, "tampered").unwrap();

        init(&paths).unwrap();

        assert_eq!(fs::read_to_string(&paths.memory_file).unwrap(), "my notes");
        assert_ne!(fs::read_to_string(&tool).unwrap(), "tampered");
    }

    #[test]
    fn test_second_init_does_not_touch_zone_once_mtime() {
        let (_tmp, paths) = init_root();
        let before = crate::store::file_mtime(&paths.memory_file).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        init(&paths).unwrap();
        let after = crate::store::file_mtime(&paths.memory_file).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_legacy_tasks_migration() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::with_root(tmp.path());
        fs::create_dir_all(paths.legacy_tasks_dir.join("old-task")).unwrap();

        init(&paths).unwrap();

        assert!(paths.cron_tasks_dir.join("old-task").is_dir());
        assert!(!paths.legacy_tasks_dir.exists());
    }

    #[test]
    fn test_rule_pairing_single_and_both() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("task");
        fs::create_dir_all(&dir).unwrap();

        // Only one convention present: the twin appears.
        fs::write(dir.join(RULE_FILE_A), "rules v1").unwrap();
        pair_rule_files(tmp.path());
        assert_eq!(fs::read_to_string(dir.join(RULE_FILE_B)).unwrap(), "rules v1");

        // Newer file wins when both exist.
        std::thread::sleep(std::time::Duration::from_millis(30));
        fs::write(dir.join(RULE_FILE_B), "rules v2").unwrap();
        pair_rule_files(tmp.path());
        assert_eq!(fs::read_to_string(dir.join(RULE_FILE_A)).unwrap(), "rules v2");
    }

    #[cfg(unix)]
    #[test]
    fn test_orphan_symlink_removed() {
        let (_tmp, paths) = init_root();
        let orphan = paths.workspace_dir.join("dangling");
        std::os::unix::fs::symlink(paths.workspace_dir.join("missing-target"), &orphan).unwrap();

        init(&paths).unwrap();
        assert!(orphan.symlink_metadata().is_err());
    }

    #[test]
    fn test_runtime_env_injection_idempotent() {
        let (_tmp, paths) = init_root();
        inject_runtime_env(&paths, false);
        let first = fs::read_to_string(paths.workspace_dir.join(RULE_FILE_A)).unwrap();
        assert!(first.contains("direct on the host"));

        // Re-injection replaces the section instead of appending again.
        inject_runtime_env(&paths, true);
        let second = fs::read_to_string(paths.workspace_dir.join(RULE_FILE_A)).unwrap();
        assert!(second.contains("sandboxed"));
        assert!(!second.contains("direct on the host"));
        assert_eq!(second.matches(RUNTIME_ENV_BEGIN).count(), 1);
    }

    #[test]
    fn test_walk_skips_ignored_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(".git/sub")).unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        fs::create_dir_all(tmp.path().join("real")).unwrap();

        let mut visited = Vec::new();
        walk_dirs(tmp.path(), &mut |dir| {
            visited.push(dir.to_path_buf());
        });

        assert!(visited.iter().any(|p| p.ends_with("real")));
        assert!(!visited.iter().any(|p| p.to_string_lossy().contains(".git")));
        assert!(!visited.iter().any(|p| p.to_string_lossy().contains("node_modules")));
    }
}
