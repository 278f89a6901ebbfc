//! Subprocess registry.
//!
//! Every spawned provider child is registered here with its chat id, a
//! label, and its wall-clock registration time. The registry owns the kill
//! paths: graceful terminate, a grace period, then hard kill and reap. A
//! per-chat aborted flag is set on any kill so in-flight stream readers can
//! bail out on their next event; the flag is cleared at the next message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::process::Child;
use tracing::{debug, info, warn};

/// How long a child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

type SharedChild = Arc<tokio::sync::Mutex<Option<Child>>>;

struct ProcEntry {
    id: u64,
    chat_id: i64,
    label: String,
    pid: Option<u32>,
    registered_at: SystemTime,
    child: SharedChild,
}

/// Handle returned at registration. The spawn site keeps it to wait for the
/// child and to unregister on normal exit.
pub struct ProcHandle {
    pub id: u64,
    pid: Option<u32>,
    child: SharedChild,
}

impl ProcHandle {
    /// Kill this child directly. Used by the per-call timeout path.
    pub async fn kill(&self) {
        kill_child(self.pid, Arc::clone(&self.child)).await;
    }

    /// Poll the child to completion without holding the lock across the
    /// whole wait, so a concurrent kill path can always take the handle.
    pub async fn wait(&self) -> Option<std::process::ExitStatus> {
        loop {
            {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            *guard = None;
                            return Some(status);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "try_wait failed");
                            *guard = None;
                            return None;
                        }
                    },
                    // Taken by a kill path.
                    None => return None,
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// One mutex-guarded map of live children plus the per-chat aborted flags.
/// Injected wherever spawning or killing happens; never a global.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<Vec<ProcEntry>>,
    aborted: Mutex<HashMap<i64, Arc<AtomicBool>>>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned child. The caller should `take()` stdout
    /// before registering; the registry owns the handle for killing.
    pub fn register(&self, chat_id: i64, label: &str, child: Child) -> ProcHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let shared: SharedChild = Arc::new(tokio::sync::Mutex::new(Some(child)));

        debug!(chat_id, label, pid, "registered subprocess");
        self.entries.lock().unwrap().push(ProcEntry {
            id,
            chat_id,
            label: label.to_string(),
            pid,
            registered_at: SystemTime::now(),
            child: Arc::clone(&shared),
        });

        ProcHandle {
            id,
            pid,
            child: shared,
        }
    }

    /// Remove an entry after a normal exit.
    pub fn unregister(&self, id: u64) {
        self.entries.lock().unwrap().retain(|e| e.id != id);
    }

    /// The per-chat aborted flag, created on first use.
    pub fn aborted_flag(&self, chat_id: i64) -> Arc<AtomicBool> {
        Arc::clone(
            self.aborted
                .lock()
                .unwrap()
                .entry(chat_id)
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    pub fn is_aborted(&self, chat_id: i64) -> bool {
        self.aborted_flag(chat_id).load(Ordering::SeqCst)
    }

    /// Cleared at the start of each new message for the chat.
    pub fn clear_aborted(&self, chat_id: i64) {
        self.aborted_flag(chat_id).store(false, Ordering::SeqCst);
    }

    /// Kill every registered child of one chat and set its aborted flag.
    pub async fn kill_all(&self, chat_id: i64) -> usize {
        self.aborted_flag(chat_id).store(true, Ordering::SeqCst);

        let victims: Vec<(u64, String, Option<u32>, SharedChild)> = {
            let mut entries = self.entries.lock().unwrap();
            let mut out = Vec::new();
            entries.retain(|e| {
                if e.chat_id == chat_id {
                    out.push((e.id, e.label.clone(), e.pid, Arc::clone(&e.child)));
                    false
                } else {
                    true
                }
            });
            out
        };

        let count = victims.len();
        for (id, label, pid, child) in victims {
            info!(chat_id, id, label, "killing subprocess");
            kill_child(pid, child).await;
        }
        count
    }

    /// Kill children older than `max_age` in wall-clock time. Wall clock
    /// (not monotonic) so processes surviving a host suspend get reaped.
    pub async fn kill_stale(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let victims: Vec<(i64, String, Option<u32>, SharedChild)> = {
            let mut entries = self.entries.lock().unwrap();
            let mut out = Vec::new();
            entries.retain(|e| {
                let age = now
                    .duration_since(e.registered_at)
                    .unwrap_or(Duration::ZERO);
                if age > max_age {
                    out.push((e.chat_id, e.label.clone(), e.pid, Arc::clone(&e.child)));
                    false
                } else {
                    true
                }
            });
            out
        };

        let count = victims.len();
        for (chat_id, label, pid, child) in victims {
            warn!(chat_id, label, "killing stale subprocess");
            self.aborted_flag(chat_id).store(true, Ordering::SeqCst);
            kill_child(pid, child).await;
        }
        count
    }

    /// Kill everything. Used on shutdown.
    pub async fn kill_everything(&self) {
        let victims: Vec<(Option<u32>, SharedChild)> = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .drain(..)
                .map(|e| (e.pid, e.child))
                .collect()
        };
        for (pid, child) in victims {
            kill_child(pid, child).await;
        }
    }

    /// Number of live children for a chat.
    pub fn count_for_chat(&self, chat_id: i64) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.chat_id == chat_id)
            .count()
    }
}

/// Terminate, wait the grace period, escalate to kill, reap.
async fn kill_child(pid: Option<u32>, shared: SharedChild) {
    let mut guard = shared.lock().await;
    let Some(mut child) = guard.take() else {
        return;
    };
    drop(guard);

    terminate(pid);

    let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
    match graceful {
        Ok(Ok(status)) => {
            debug!(?status, "subprocess exited after terminate");
        }
        _ => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "kill failed");
            }
            let _ = child.wait().await;
        }
    }
}

/// Ask the child to exit. Unix sends SIGTERM to give the provider a chance
/// to flush; elsewhere this is a no-op and the SIGKILL escalation applies.
#[cfg(unix)]
fn terminate(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sleeper() -> Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep")
    }

    #[tokio::test]
    async fn test_kill_all_sets_aborted_and_clears_entries() {
        let reg = ProcessRegistry::new();
        let _handle = reg.register(100, "test", spawn_sleeper());
        assert_eq!(reg.count_for_chat(100), 1);
        assert!(!reg.is_aborted(100));

        let killed = reg.kill_all(100).await;
        assert_eq!(killed, 1);
        assert_eq!(reg.count_for_chat(100), 0);
        assert!(reg.is_aborted(100));

        reg.clear_aborted(100);
        assert!(!reg.is_aborted(100));
    }

    #[tokio::test]
    async fn test_kill_all_is_per_chat() {
        let reg = ProcessRegistry::new();
        let _a = reg.register(1, "a", spawn_sleeper());
        let _b = reg.register(2, "b", spawn_sleeper());

        reg.kill_all(1).await;
        assert_eq!(reg.count_for_chat(1), 0);
        assert_eq!(reg.count_for_chat(2), 1);
        assert!(!reg.is_aborted(2));

        reg.kill_all(2).await;
    }

    #[tokio::test]
    async fn test_kill_stale_by_wall_clock() {
        let reg = ProcessRegistry::new();
        let _h = reg.register(5, "old", spawn_sleeper());

        // Nothing is older than an hour yet.
        assert_eq!(reg.kill_stale(Duration::from_secs(3600)).await, 0);
        // Everything is older than zero.
        assert_eq!(reg.kill_stale(Duration::ZERO).await, 1);
        assert_eq!(reg.count_for_chat(5), 0);
    }

    #[tokio::test]
    async fn test_wait_observes_kill() {
        let reg = ProcessRegistry::new();
        let handle = reg.register(9, "w", spawn_sleeper());

        let waiter = tokio::spawn(async move { handle.wait().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        reg.kill_all(9).await;

        // The waiter must not hang once the kill path took the child.
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter hung")
            .unwrap();
        assert!(result.is_none());
    }
}
