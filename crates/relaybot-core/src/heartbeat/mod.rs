//! Periodic background prompter.
//!
//! Every interval, each allowed chat's session gets a fixed check-in prompt
//! through the orchestrator's heartbeat flow. Before each tick the stale
//! process sweep runs, and the wall-clock gap between ticks is checked so a
//! host suspend/resume shows up in the logs instead of silently drifting.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::Orchestrator;
use crate::config::Config;
use crate::cron::clock::{local_hour, resolve_timezone, QuietHours};
use crate::gateway::{ChatOutbox, ChatRef};
use crate::process::ProcessRegistry;

pub struct HeartbeatService {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<ProcessRegistry>,
    outbox: Arc<dyn ChatOutbox>,
    cli_timeout: Duration,
}

impl HeartbeatService {
    pub fn new(
        config: Arc<Config>,
        orchestrator: Arc<Orchestrator>,
        registry: Arc<ProcessRegistry>,
        outbox: Arc<dyn ChatOutbox>,
        cli_timeout: Duration,
    ) -> Self {
        Self {
            config,
            orchestrator,
            registry,
            outbox,
            cli_timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.heartbeat.interval_minutes.max(1) * 60);
        info!(interval_secs = interval.as_secs(), "heartbeat started");
        let mut last_tick = SystemTime::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("heartbeat stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            // Wall-clock gap detection: a sleep that took far longer than
            // the interval means the host was suspended.
            let now = SystemTime::now();
            if let Ok(gap) = now.duration_since(last_tick) {
                if gap > interval * 2 {
                    warn!(
                        gap_secs = gap.as_secs(),
                        interval_secs = interval.as_secs(),
                        "heartbeat gap exceeds 2x interval, host was likely suspended"
                    );
                }
            }
            last_tick = now;

            // Stale children survive suspend with their wall-clock age
            // intact; reap anything past twice the call timeout.
            let reaped = self.registry.kill_stale(self.cli_timeout * 2).await;
            if reaped > 0 {
                warn!(reaped, "stale subprocesses killed before heartbeat tick");
            }

            if self.in_quiet_window() {
                continue;
            }

            self.tick().await;
        }
    }

    fn in_quiet_window(&self) -> bool {
        let window = match (
            self.config.heartbeat.quiet_start_hour,
            self.config.heartbeat.quiet_end_hour,
        ) {
            (Some(start_hour), Some(end_hour)) => QuietHours {
                start_hour,
                end_hour,
            },
            _ => return false,
        };
        let tz = resolve_timezone(None, self.config.timezone.as_deref());
        window.contains(local_hour(tz))
    }

    /// One pass over the allowed chats. Single-chat failures are logged and
    /// never kill the loop.
    async fn tick(&self) {
        for user_id in &self.config.telegram.allowed_user_ids {
            // Private chats share the user's id.
            let chat_id = *user_id as i64;
            match self.orchestrator.handle_heartbeat(chat_id).await {
                Ok(Some(text)) => {
                    let chat = ChatRef::new(chat_id);
                    if let Err(e) = self.outbox.send(&chat, &text).await {
                        warn!(chat_id, error = %e, "failed to deliver heartbeat reply");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(chat_id, kind = e.kind(), error = %e, "heartbeat tick failed");
                }
            }
        }
    }
}
