//! Cron scheduler for recurring agent tasks.
//!
//! Entries live in `cron_jobs.json` and are edited out-of-band by the
//! workspace helper tools; the scheduler polls the file's mtime and
//! reschedules everything when it changes. Each enabled entry gets its own
//! task that sleeps until the next fire instant in the entry's resolved
//! timezone, honours quiet hours, serializes on its dependency key, and
//! records the run status back into the file.

pub mod clock;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::runner::{ExecOverrides, TaskReport, TaskRunner, TaskSpec, TaskStatus};
use crate::store;
use crate::CoreError;
use clock::{next_fire, resolve_timezone, QuietHours};

/// How often the entries file is polled for out-of-band edits.
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

fn default_true() -> bool {
    true
}

/// One scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    /// 5-field cron expression.
    pub schedule: String,
    pub task_folder: String,
    pub instruction: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub timezone: Option<String>,
    pub quiet_hours: Option<QuietHours>,
    pub dependency_key: Option<String>,
    pub overrides: ExecOverrides,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

impl Default for CronEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            schedule: String::new(),
            task_folder: String::new(),
            instruction: String::new(),
            enabled: true,
            timezone: None,
            quiet_hours: None,
            dependency_key: None,
            overrides: ExecOverrides::default(),
            last_run: None,
            last_status: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CronFile {
    jobs: Vec<CronEntry>,
}

/// Persistent store for cron entries. Writes are atomic; the scheduler's
/// own status writes are remembered so the mtime watcher does not treat
/// them as external edits.
pub struct CronStore {
    path: PathBuf,
    last_self_write: Mutex<Option<SystemTime>>,
}

impl CronStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_self_write: Mutex::new(None),
        }
    }

    pub fn load(&self) -> Result<Vec<CronEntry>, CoreError> {
        let file: Option<CronFile> = store::load_json(&self.path)?;
        Ok(file.unwrap_or_default().jobs)
    }

    pub fn save(&self, jobs: &[CronEntry]) -> Result<(), CoreError> {
        store::save_json_atomic(
            &self.path,
            &CronFile {
                jobs: jobs.to_vec(),
            },
        )?;
        *self.last_self_write.lock().unwrap() = store::file_mtime(&self.path);
        Ok(())
    }

    /// Add a job, sanitizing its id. Returns the stored id.
    pub fn add(&self, mut entry: CronEntry) -> Result<String, CoreError> {
        entry.id = crate::paths::sanitize_task_name(&entry.id)?;
        clock::parse_expression(&entry.schedule)?;
        let mut jobs = self.load()?;
        if jobs.iter().any(|j| j.id == entry.id) {
            return Err(CoreError::Scheduler(format!(
                "cron job {:?} already exists",
                entry.id
            )));
        }
        let id = entry.id.clone();
        jobs.push(entry);
        self.save(&jobs)?;
        Ok(id)
    }

    pub fn remove(&self, id: &str) -> Result<bool, CoreError> {
        let mut jobs = self.load()?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() < before;
        if removed {
            self.save(&jobs)?;
        }
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, CoreError> {
        let mut jobs = self.load()?;
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(false);
        };
        job.enabled = enabled;
        self.save(&jobs)?;
        Ok(true)
    }

    fn record_run(&self, id: &str, status: &str) {
        let result = self.load().and_then(|mut jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                job.last_run = Some(Utc::now());
                job.last_status = Some(status.to_string());
                self.save(&jobs)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            error!(id, error = %e, "failed to record cron run status");
        }
    }

    /// Current mtime, unless the last change was our own write.
    fn external_mtime(&self) -> Option<SystemTime> {
        let mtime = store::file_mtime(&self.path)?;
        if *self.last_self_write.lock().unwrap() == Some(mtime) {
            None
        } else {
            Some(mtime)
        }
    }
}

/// The scheduler observer. `run` lives until the token is cancelled.
pub struct CronScheduler {
    store: Arc<CronStore>,
    runner: Arc<TaskRunner>,
    config: Arc<Config>,
    reports: Option<mpsc::Sender<TaskReport>>,
}

impl CronScheduler {
    pub fn new(
        store: Arc<CronStore>,
        runner: Arc<TaskRunner>,
        config: Arc<Config>,
        reports: Option<mpsc::Sender<TaskReport>>,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            reports,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut seen_mtime = store::file_mtime(&self.store.path);
        info!("cron scheduler started");

        loop {
            let entries = match self.store.load() {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "cron entries unreadable, retrying on next change");
                    Vec::new()
                }
            };

            let generation = cancel.child_token();
            let mut tasks = Vec::new();
            for entry in entries.into_iter().filter(|e| e.enabled) {
                let task = EntryTask {
                    entry,
                    store: Arc::clone(&self.store),
                    runner: Arc::clone(&self.runner),
                    config: Arc::clone(&self.config),
                    reports: self.reports.clone(),
                };
                tasks.push(tokio::spawn(task.run(generation.clone())));
            }

            // Wait for an external edit or shutdown, then reschedule.
            let shutdown = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break true,
                    _ = tokio::time::sleep(WATCH_INTERVAL) => {
                        if let Some(mtime) = self.store.external_mtime() {
                            if seen_mtime != Some(mtime) {
                                seen_mtime = Some(mtime);
                                break false;
                            }
                        }
                    }
                }
            };

            generation.cancel();
            for task in tasks {
                let _ = task.await;
            }
            if shutdown {
                info!("cron scheduler stopped");
                return;
            }
            info!("cron entries changed, rescheduling");
        }
    }
}

struct EntryTask {
    entry: CronEntry,
    store: Arc<CronStore>,
    runner: Arc<TaskRunner>,
    config: Arc<Config>,
    reports: Option<mpsc::Sender<TaskReport>>,
}

impl EntryTask {
    async fn run(self, cancel: CancellationToken) {
        loop {
            let tz = resolve_timezone(
                self.entry.timezone.as_deref(),
                self.config.timezone.as_deref(),
            );
            let next = match next_fire(&self.entry.schedule, tz, Utc::now()) {
                Ok(next) => next,
                Err(e) => {
                    warn!(id = self.entry.id, error = %e, "unschedulable cron entry");
                    self.store.record_run(&self.entry.id, "bad_schedule");
                    return;
                }
            };
            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!(id = self.entry.id, fire_at = %next, "cron entry scheduled");

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            self.fire().await;
        }
    }

    /// One occurrence. Failures are contained here so the entry keeps its
    /// schedule.
    async fn fire(&self) {
        let spec = TaskSpec {
            title: self.entry.title.clone(),
            task_folder: self.entry.task_folder.clone(),
            instruction: self.entry.instruction.clone(),
            overrides: self.entry.overrides.clone(),
            quiet_hours: self.entry.quiet_hours,
            dependency_key: self.entry.dependency_key.clone(),
            timezone: self.entry.timezone.clone(),
            label: format!("cron:{}", self.entry.id),
        };

        let outcome = self.runner.run(&spec).await;
        if outcome.status == TaskStatus::QuietSkipped {
            return;
        }

        let code = outcome.status.code();
        info!(id = self.entry.id, status = code, "cron entry fired");
        self.store.record_run(&self.entry.id, &code);

        if let Some(reports) = &self.reports {
            let _ = reports
                .send(TaskReport {
                    title: self.entry.title.clone(),
                    text: outcome.text,
                    status: code,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(id: &str) -> CronEntry {
        CronEntry {
            id: id.into(),
            title: "Sample".into(),
            schedule: "0 9 * * *".into(),
            task_folder: "sample".into(),
            instruction: "do the thing".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron_jobs.json"));

        let id = store.add(sample_entry("Daily Report")).unwrap();
        assert_eq!(id, "daily-report");

        let jobs = store.load().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].enabled);

        assert!(store.set_enabled(&id, false).unwrap());
        assert!(!store.load().unwrap()[0].enabled);

        assert!(store.remove(&id).unwrap());
        assert!(store.load().unwrap().is_empty());
        assert!(!store.remove("missing").unwrap());
    }

    #[test]
    fn test_add_rejects_bad_schedule_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron_jobs.json"));

        let mut bad = sample_entry("x");
        bad.schedule = "whenever".into();
        assert!(store.add(bad).is_err());

        store.add(sample_entry("x")).unwrap();
        assert!(store.add(sample_entry("x")).is_err());
    }

    #[test]
    fn test_record_run_does_not_look_external() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron_jobs.json"));
        store.add(sample_entry("job")).unwrap();

        store.record_run("job", "success");
        // Our own write must not register as an external edit.
        assert!(store.external_mtime().is_none());

        // An out-of-band write does.
        let jobs = store.load().unwrap();
        store::save_json_atomic(&store.path, &CronFile { jobs }).unwrap();
        assert!(store.external_mtime().is_some());
    }

    #[test]
    fn test_entry_deserializes_with_defaults() {
        let json = r#"{
            "id": "mail-sweep",
            "title": "Mail sweep",
            "schedule": "*/15 * * * *",
            "taskFolder": "mail-sweep",
            "instruction": "check the inbox",
            "quietHours": {"startHour": 22, "endHour": 7},
            "dependencyKey": "mail"
        }"#;
        let entry: CronEntry = serde_json::from_str(json).unwrap();
        assert!(entry.enabled);
        assert_eq!(entry.quiet_hours.unwrap().start_hour, 22);
        assert_eq!(entry.dependency_key.as_deref(), Some("mail"));
        assert!(entry.overrides.provider.is_none());
    }
}
