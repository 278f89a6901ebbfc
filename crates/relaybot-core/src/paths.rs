//! The single workspace-paths record.
//!
//! Every filesystem location the core touches is derived from one root
//! (default `~/.relaybot`, overridable with `RELAYBOT_HOME`). No other
//! module hardcodes a path.

use std::path::{Path, PathBuf};

/// Environment variable that overrides the root directory.
pub const ROOT_ENV: &str = "RELAYBOT_HOME";

/// Environment variable that relocates the codex agent home.
pub const CODEX_HOME_ENV: &str = "CODEX_HOME";

/// Immutable record of every absolute path the runtime uses.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub sessions_file: PathBuf,
    pub cron_jobs_file: PathBuf,
    pub webhooks_file: PathBuf,
    pub logs_dir: PathBuf,
    pub pid_file: PathBuf,
    pub restart_sentinel: PathBuf,
    pub upgrade_sentinel: PathBuf,
    pub restart_requested: PathBuf,
    pub workspace_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub memory_file: PathBuf,
    pub cron_tasks_dir: PathBuf,
    pub legacy_tasks_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub telegram_files_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl WorkspacePaths {
    /// Resolve the record from `RELAYBOT_HOME` or `~/.relaybot`.
    pub fn resolve() -> Self {
        let root = std::env::var_os(ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".relaybot")
            });
        Self::with_root(root)
    }

    /// Build the record from an explicit root. Used by tests and by the
    /// `--root` CLI flag.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let workspace_dir = root.join("workspace");
        let memory_dir = workspace_dir.join("memory_system");
        Self {
            config_dir: root.join("config"),
            config_file: root.join("config").join("config.json"),
            sessions_file: root.join("sessions.json"),
            cron_jobs_file: root.join("cron_jobs.json"),
            webhooks_file: root.join("webhooks.json"),
            logs_dir: root.join("logs"),
            pid_file: root.join("bot.pid"),
            restart_sentinel: root.join("restart-sentinel.json"),
            upgrade_sentinel: root.join("upgrade-sentinel.json"),
            restart_requested: root.join("restart-requested"),
            memory_file: memory_dir.join("MAINMEMORY.md"),
            memory_dir,
            cron_tasks_dir: workspace_dir.join("cron_tasks"),
            legacy_tasks_dir: workspace_dir.join("tasks"),
            skills_dir: workspace_dir.join("skills"),
            tools_dir: workspace_dir.join("tools"),
            telegram_files_dir: workspace_dir.join("telegram_files"),
            output_dir: workspace_dir.join("output_to_user"),
            workspace_dir,
            root,
        }
    }

    /// Folder for a named cron/webhook task.
    pub fn task_folder(&self, name: &str) -> PathBuf {
        self.cron_tasks_dir.join(name)
    }

    /// Per-task memory file inside a task folder.
    pub fn task_memory_file(&self, name: &str) -> PathBuf {
        self.task_folder(name).join(format!("{name}_MEMORY.md"))
    }

    /// The claude agent home (credentials, skills).
    pub fn claude_home() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
    }

    /// The codex agent home, honoring `CODEX_HOME`.
    pub fn codex_home() -> PathBuf {
        std::env::var_os(CODEX_HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".codex")
            })
    }

    /// The fixed set of directories `workspace::init` guarantees to exist.
    pub fn required_dirs(&self) -> Vec<&Path> {
        vec![
            &self.config_dir,
            &self.logs_dir,
            &self.workspace_dir,
            &self.memory_dir,
            &self.cron_tasks_dir,
            &self.skills_dir,
            &self.tools_dir,
            &self.telegram_files_dir,
            &self.output_dir,
        ]
    }
}

/// Reject task names that could escape the workspace.
///
/// Returns the sanitized name: lowercase, spaces to hyphens. Path
/// separators, parent references, and control characters are an error.
pub fn sanitize_task_name(name: &str) -> Result<String, crate::CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(crate::CoreError::Security("empty task name".into()));
    }
    if trimmed.contains(['/', '\\']) || trimmed.contains("..") {
        return Err(crate::CoreError::Security(format!(
            "path separator in task name: {trimmed:?}"
        )));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(crate::CoreError::Security(
            "control character in task name".into(),
        ));
    }
    Ok(trimmed.to_lowercase().replace([' ', '_'], "-"))
}
