//! Three-way skill-directory synchronization.
//!
//! Makes every skill visible in the workspace skills directory and both
//! agent homes (`~/.claude/skills`, `~/.codex/skills`) without duplicating
//! content: one canonical real directory, symlinks everywhere else.
//! Canonical priority is workspace > claude > codex. Real directories are
//! never overwritten and symlinks pointing outside the sync set are never
//! touched.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::paths::WorkspacePaths;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub removed: usize,
}

/// The three sync roots in canonical priority order. Directories whose
/// parent agent home is absent are dropped.
pub fn sync_dirs(paths: &WorkspacePaths) -> Vec<PathBuf> {
    let mut dirs = vec![paths.skills_dir.clone()];
    for home in [
        WorkspacePaths::claude_home(),
        WorkspacePaths::codex_home(),
    ] {
        if home.is_dir() {
            dirs.push(home.join("skills"));
        }
    }
    dirs
}

/// One synchronization pass. Idempotent: with no external changes a second
/// pass creates and removes nothing.
pub fn sync_once(dirs: &[PathBuf]) -> SyncReport {
    let mut report = SyncReport::default();
    if dirs.is_empty() {
        return report;
    }

    for dir in dirs {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "cannot ensure skills dir");
        }
    }

    // Clean broken links we own first so a removed canonical directory
    // frees its name this pass.
    for dir in dirs {
        report.removed += remove_broken_owned_links(dir, dirs);
    }

    let mut names = BTreeSet::new();
    for dir in dirs {
        for name in list_skills(dir) {
            names.insert(name);
        }
    }

    for name in &names {
        let Some(canonical) = canonical_source(dirs, name) else {
            debug!(skill = name.as_str(), "no resolvable source, skipping");
            continue;
        };
        for dir in dirs {
            let target = dir.join(name);
            // Anything already present (real dir or any symlink) stays.
            if target.symlink_metadata().is_ok() {
                continue;
            }
            match make_dir_link(&canonical, &target) {
                Ok(()) => {
                    info!(skill = name.as_str(), into = %dir.display(), "linked skill");
                    report.created += 1;
                }
                Err(e) => {
                    warn!(skill = name.as_str(), error = %e, "failed to link skill");
                }
            }
        }
    }

    report
}

/// Immediate subdirectory names, ignoring dot-prefixed entries and broken
/// symlinks (valid symlinks count).
fn list_skills(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            let path = entry.path();
            // `is_dir` follows links, so broken links drop out here.
            if path.is_dir() {
                Some(name)
            } else {
                None
            }
        })
        .collect()
}

/// First real directory in priority order; if every copy is a symlink,
/// the first valid link's resolved target.
fn canonical_source(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.is_dir() && !is_symlink(&candidate) {
            return Some(candidate);
        }
    }
    for dir in dirs {
        let candidate = dir.join(name);
        if is_symlink(&candidate) {
            if let Ok(resolved) = std::fs::canonicalize(&candidate) {
                if resolved.is_dir() {
                    return Some(resolved);
                }
            }
        }
    }
    None
}

/// Remove broken symlinks whose recorded target lies inside the sync set.
/// External user links are preserved even when broken.
fn remove_broken_owned_links(dir: &Path, sync_set: &[PathBuf]) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_symlink(&path) || path.is_dir() {
            continue; // not a link, or a link that still resolves
        }
        let Ok(target) = std::fs::read_link(&path) else {
            continue;
        };
        let target = if target.is_absolute() {
            target
        } else {
            dir.join(target)
        };
        if sync_set.iter().any(|root| target.starts_with(root)) {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(link = %path.display(), "removed broken skill link");
                    removed += 1;
                }
                Err(e) => warn!(link = %path.display(), error = %e, "failed to remove broken link"),
            }
        }
    }
    removed
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

#[cfg(unix)]
fn make_dir_link(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

/// Windows directory symlinks need a privilege most users lack; fall back
/// to a junction, which does not.
#[cfg(windows)]
fn make_dir_link(source: &Path, target: &Path) -> std::io::Result<()> {
    match std::os::windows::fs::symlink_dir(source, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            let status = std::process::Command::new("cmd")
                .args(["/C", "mklink", "/J"])
                .arg(target)
                .arg(source)
                .status()?;
            if status.success() {
                Ok(())
            } else {
                Err(std::io::Error::other("junction creation failed"))
            }
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn make_dir_link(_source: &Path, _target: &Path) -> std::io::Result<()> {
    Err(std::io::Error::other("symlinks unsupported on this host"))
}

/// On shutdown, unlink only those symlinks in the agent homes that resolve
/// into the workspace skills directory. Real directories and external user
/// links stay.
pub fn shutdown_cleanup(paths: &WorkspacePaths) {
    let workspace_skills = &paths.skills_dir;
    for home in [
        WorkspacePaths::claude_home(),
        WorkspacePaths::codex_home(),
    ] {
        let dir = home.join("skills");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_symlink(&path) {
                continue;
            }
            let Ok(target) = std::fs::read_link(&path) else {
                continue;
            };
            let target = if target.is_absolute() {
                target
            } else {
                dir.join(target)
            };
            if target.starts_with(workspace_skills) {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(link = %path.display(), error = %e, "shutdown cleanup failed");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, Vec<PathBuf>) {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = vec![
            tmp.path().join("workspace_skills"),
            tmp.path().join("claude_skills"),
            tmp.path().join("codex_skills"),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir).unwrap();
        }
        (tmp, dirs)
    }

    #[test]
    fn test_real_dir_becomes_canonical_and_links_spread() {
        let (_tmp, dirs) = setup();
        fs::create_dir(dirs[0].join("s")).unwrap();
        fs::write(dirs[0].join("s/SKILL.md"), "skill").unwrap();

        let report = sync_once(&dirs);
        assert_eq!(report.created, 2);

        for dir in &dirs[1..] {
            let link = dir.join("s");
            assert!(is_symlink(&link));
            assert_eq!(fs::canonicalize(&link).unwrap(), fs::canonicalize(dirs[0].join("s")).unwrap());
        }
    }

    #[test]
    fn test_priority_prefers_workspace_over_agents() {
        let (_tmp, dirs) = setup();
        fs::create_dir(dirs[0].join("s")).unwrap();
        fs::create_dir(dirs[1].join("s")).unwrap();

        sync_once(&dirs);
        // codex got a link to the workspace copy, not the claude copy.
        let resolved = fs::canonicalize(dirs[2].join("s")).unwrap();
        assert_eq!(resolved, fs::canonicalize(dirs[0].join("s")).unwrap());
        // Both real dirs untouched.
        assert!(!is_symlink(&dirs[0].join("s")));
        assert!(!is_symlink(&dirs[1].join("s")));
    }

    #[test]
    fn test_idempotent_second_pass() {
        let (_tmp, dirs) = setup();
        fs::create_dir(dirs[0].join("a")).unwrap();
        fs::create_dir(dirs[1].join("b")).unwrap();

        let first = sync_once(&dirs);
        assert!(first.created > 0);

        let second = sync_once(&dirs);
        assert_eq!(second, SyncReport::default());
    }

    #[test]
    fn test_existing_external_symlink_preserved() {
        let (tmp, dirs) = setup();
        let external = tmp.path().join("external_skill");
        fs::create_dir(&external).unwrap();
        std::os::unix::fs::symlink(&external, dirs[1].join("s")).unwrap();

        sync_once(&dirs);

        // The external link is untouched and became the canonical source
        // for the other two directories.
        assert_eq!(fs::read_link(dirs[1].join("s")).unwrap(), external);
        assert!(is_symlink(&dirs[0].join("s")));
        assert!(is_symlink(&dirs[2].join("s")));
    }

    #[test]
    fn test_broken_owned_links_removed_external_kept() {
        let (tmp, dirs) = setup();
        // Owned link: points into the sync set but the target is gone.
        std::os::unix::fs::symlink(dirs[0].join("gone"), dirs[2].join("gone")).unwrap();
        // External broken link.
        std::os::unix::fs::symlink(tmp.path().join("elsewhere"), dirs[2].join("ext")).unwrap();

        let report = sync_once(&dirs);
        assert_eq!(report.removed, 1);
        assert!(dirs[2].join("gone").symlink_metadata().is_err());
        assert!(dirs[2].join("ext").symlink_metadata().is_ok());
    }

    #[test]
    fn test_dot_dirs_ignored() {
        let (_tmp, dirs) = setup();
        fs::create_dir(dirs[0].join(".hidden")).unwrap();

        let report = sync_once(&dirs);
        assert_eq!(report.created, 0);
        assert!(dirs[1].join(".hidden").symlink_metadata().is_err());
    }
}
