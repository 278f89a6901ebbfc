//! Shared task execution for cron fires and webhook task-mode dispatches.
//!
//! Both observers resolve execution config the same way (entry overrides
//! win whole-field over global defaults, no merging of argument arrays),
//! honour quiet hours, serialize on dependency keys, and spawn the provider
//! in the task's folder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cli::{known_models, CliRequest, CliService};
use crate::config::Config;
use crate::cron::clock::{local_hour, resolve_timezone, QuietHours};
use crate::paths::WorkspacePaths;
use crate::CoreError;

/// Per-entry execution overrides. A set field replaces the global value
/// entirely; extra args are never concatenated with global args.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub extra_args: Option<Vec<String>>,
}

/// Map of dependency key → FIFO mutex. tokio mutexes queue waiters in
/// arrival order, which gives the serialization guarantee directly.
#[derive(Default)]
pub struct DependencyLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DependencyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.inner
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default(),
        )
    }
}

/// Everything the runner needs to execute one task occurrence.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub task_folder: String,
    pub instruction: String,
    pub overrides: ExecOverrides,
    pub quiet_hours: Option<QuietHours>,
    pub dependency_key: Option<String>,
    pub timezone: Option<String>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    QuietSkipped,
    FolderMissing,
    CliNotFound(String),
    Timeout,
    Exit(i32),
}

impl TaskStatus {
    /// The persisted status code.
    pub fn code(&self) -> String {
        match self {
            Self::Success => "success".into(),
            Self::QuietSkipped => "quiet_skipped".into(),
            Self::FolderMissing => "folder_missing".into(),
            Self::CliNotFound(provider) => format!("cli_not_found_{provider}"),
            Self::Timeout => "timeout".into(),
            Self::Exit(code) => format!("exit_{code}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub text: String,
    pub session_id: Option<String>,
    pub cost_usd: f64,
}

/// Report handed to the optional result listener (title, text, status).
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub title: String,
    pub text: String,
    pub status: String,
}

pub struct TaskRunner {
    cli: Arc<CliService>,
    config: Arc<Config>,
    paths: Arc<WorkspacePaths>,
    deps: Arc<DependencyLocks>,
}

impl TaskRunner {
    pub fn new(
        cli: Arc<CliService>,
        config: Arc<Config>,
        paths: Arc<WorkspacePaths>,
        deps: Arc<DependencyLocks>,
    ) -> Self {
        Self {
            cli,
            config,
            paths,
            deps,
        }
    }

    pub async fn run(&self, spec: &TaskSpec) -> TaskOutcome {
        let folder = self.paths.task_folder(&spec.task_folder);
        if !folder.is_dir() {
            warn!(task = spec.title, folder = %folder.display(), "task folder missing");
            return outcome(TaskStatus::FolderMissing, String::new());
        }

        // Entries sharing a key run strictly one at a time, FIFO.
        let _dep_guard = match &spec.dependency_key {
            Some(key) => Some(self.deps.lock_for(key).lock_owned().await),
            None => None,
        };

        let quiet = spec.quiet_hours.or_else(|| self.global_quiet_window());
        if let Some(window) = quiet {
            let tz = resolve_timezone(spec.timezone.as_deref(), self.config.timezone.as_deref());
            let hour = local_hour(tz);
            if window.contains(hour) {
                info!(task = spec.title, hour, "inside quiet window, skipping occurrence");
                return outcome(TaskStatus::QuietSkipped, String::new());
            }
        }

        let request = match self.build_request(spec, &folder) {
            Ok(request) => request,
            Err(e) => return outcome(TaskStatus::Exit(-1), e.to_string()),
        };

        info!(task = spec.title, provider = request.provider, "running task");
        match self.cli.execute(&request).await {
            Ok(response) => {
                let status = if response.is_error {
                    TaskStatus::Exit(1)
                } else {
                    TaskStatus::Success
                };
                TaskOutcome {
                    status,
                    text: response.text,
                    session_id: response.session_id,
                    cost_usd: response.cost_usd,
                }
            }
            Err(CoreError::CliNotFound { provider }) => {
                outcome(TaskStatus::CliNotFound(provider), String::new())
            }
            Err(CoreError::CliTimeout(_)) => outcome(TaskStatus::Timeout, String::new()),
            Err(CoreError::CliExit { code }) => outcome(TaskStatus::Exit(code), String::new()),
            Err(e) => {
                warn!(task = spec.title, error = %e, "task execution failed");
                outcome(TaskStatus::Exit(-1), e.to_string())
            }
        }
    }

    fn global_quiet_window(&self) -> Option<QuietHours> {
        match (
            self.config.heartbeat.quiet_start_hour,
            self.config.heartbeat.quiet_end_hour,
        ) {
            (Some(start_hour), Some(end_hour)) => Some(QuietHours {
                start_hour,
                end_hour,
            }),
            _ => None,
        }
    }

    fn build_request(
        &self,
        spec: &TaskSpec,
        folder: &std::path::Path,
    ) -> Result<CliRequest, CoreError> {
        let defaults = &self.config.defaults;
        let provider = spec
            .overrides
            .provider
            .clone()
            .unwrap_or_else(|| defaults.provider.clone());
        let model = spec
            .overrides
            .model
            .clone()
            .unwrap_or_else(|| defaults.model.clone());

        if !known_models(&provider).contains(&model.as_str()) {
            return Err(CoreError::Scheduler(format!(
                "model {model:?} is not valid for provider {provider:?}"
            )));
        }

        let memory_file = self.paths.task_memory_file(&spec.task_folder);
        let instruction = format!(
            "{}\n\nYour working directory is this task's folder. Read and update \
             your task memory file at {} as you work.",
            spec.instruction,
            memory_file.display()
        );

        Ok(CliRequest {
            chat_id: 0,
            provider,
            model,
            prompt: instruction,
            reasoning_effort: spec
                .overrides
                .reasoning_effort
                .clone()
                .or_else(|| defaults.reasoning_effort.clone()),
            max_turns: defaults.max_turns,
            max_budget_usd: defaults.max_budget_usd,
            permission_mode: defaults.permission_mode.clone(),
            extra_args: spec
                .overrides
                .extra_args
                .clone()
                .unwrap_or_else(|| defaults.extra_args.clone()),
            working_dir: Some(folder.to_path_buf()),
            label: spec.label.clone(),
            ..Default::default()
        })
    }
}

fn outcome(status: TaskStatus, text: String) -> TaskOutcome {
    TaskOutcome {
        status,
        text,
        session_id: None,
        cost_usd: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TaskStatus::Success.code(), "success");
        assert_eq!(TaskStatus::FolderMissing.code(), "folder_missing");
        assert_eq!(
            TaskStatus::CliNotFound("claude".into()).code(),
            "cli_not_found_claude"
        );
        assert_eq!(TaskStatus::Timeout.code(), "timeout");
        assert_eq!(TaskStatus::Exit(3).code(), "exit_3");
    }

    #[test]
    fn test_overrides_win_whole_field() {
        let overrides = ExecOverrides {
            provider: Some("codex".into()),
            extra_args: Some(vec!["--flag".into()]),
            ..Default::default()
        };
        // Whole-field: the override list is used as-is, never merged.
        assert_eq!(overrides.extra_args.as_deref(), Some(&["--flag".to_string()][..]));
        assert_eq!(overrides.provider.as_deref(), Some("codex"));
        assert!(overrides.model.is_none());
    }

    #[tokio::test]
    async fn test_dependency_locks_serialize_fifo() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let deps = Arc::new(DependencyLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let deps = Arc::clone(&deps);
            let order = Arc::clone(&order);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                // Stagger arrivals so queue order is deterministic.
                tokio::time::sleep(std::time::Duration::from_millis(i as u64 * 20)).await;
                let lock = deps.lock_for("k");
                let _guard = lock.lock().await;
                // No temporal overlap while holding the key.
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                order.lock().unwrap().push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let deps = DependencyLocks::new();
        let a = deps.lock_for("a");
        let b = deps.lock_for("b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &deps.lock_for("a")));
    }
}
