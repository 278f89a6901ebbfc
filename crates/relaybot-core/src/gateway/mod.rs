//! Ingress pipeline: the path from a chat update to the orchestrator.
//!
//! Enforces the user allowlist, handles the abort command, lets quick
//! read-only commands bypass the per-chat lane, deduplicates retried
//! updates, serializes everything else FIFO per chat with a visible
//! cancellable queue, and assembles the streamed reply by editing one chat
//! message in place.
//!
//! Everything here is transport-agnostic: the Telegram transport translates
//! updates into [`ChatUpdate`]/[`CallbackUpdate`] and implements
//! [`ChatOutbox`].

pub mod dedupe;
pub mod lanes;
#[cfg(feature = "telegram")]
pub mod telegram;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::{Orchestrator, Reply};
use crate::cli::StreamEvent;
use crate::config::Config;
use crate::process::ProcessRegistry;
use crate::webhook::WakeSink;
use dedupe::DedupeCache;
use lanes::{Acquire, ChatLanes, QueueEntry};

/// Longest message the chat platform accepts.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Terminal indicator strings. Cancel paths edit, never silently delete.
pub const CANCELLED_TEXT: &str = "[Message cancelled.]";
pub const DISCARDED_TEXT: &str = "[Message discarded.]";
const QUEUED_TEXT: &str = "⏳ Queued — the agent is busy with an earlier message.";
const BUSY_HINT: &str = "⏳ The agent is busy. Wait for the current work to finish, or send /stop.";
const INTERNAL_ERROR_TEXT: &str = "⚠️ Internal error. Details are in the logs.";

/// Callback-data prefix for queue-cancel buttons. Whitelisted: handled
/// without the lane so a cancel always lands immediately.
pub const CANCEL_CALLBACK_PREFIX: &str = "q_cancel:";

const DEDUPE_TTL: Duration = Duration::from_secs(8);
const DEDUPE_CAPACITY: usize = 512;
const EDIT_INTERVAL: Duration = Duration::from_millis(1500);

/// A chat destination, including the forum topic when the message came from
/// one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatRef {
    pub chat_id: i64,
    pub thread_id: Option<i32>,
}

impl ChatRef {
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            thread_id: None,
        }
    }
}

/// One inbound text message.
#[derive(Debug, Clone)]
pub struct ChatUpdate {
    pub chat: ChatRef,
    pub message_id: i32,
    pub user_id: u64,
    pub text: String,
}

/// One inline-button press.
#[derive(Debug, Clone)]
pub struct CallbackUpdate {
    pub chat: ChatRef,
    pub user_id: u64,
    /// Message the button was attached to.
    pub message_id: Option<i32>,
    pub data: String,
}

/// Outbound operations the core needs from the transport. Indicator edit
/// failures are the transport's to report; the pipeline logs and proceeds.
#[async_trait]
pub trait ChatOutbox: Send + Sync {
    async fn send(&self, chat: &ChatRef, text: &str) -> Result<i32, crate::CoreError>;
    async fn send_with_buttons(
        &self,
        chat: &ChatRef,
        text: &str,
        buttons: &[Vec<(String, String)>],
    ) -> Result<i32, crate::CoreError>;
    /// Post a queue indicator as a reply to the origin message, carrying a
    /// cancel button bound to the entry id. `reply_to == 0` means no origin.
    async fn send_queue_indicator(
        &self,
        chat: &ChatRef,
        reply_to: i32,
        text: &str,
        entry_id: &str,
    ) -> Result<i32, crate::CoreError>;
    async fn edit(&self, chat: &ChatRef, message_id: i32, text: &str)
        -> Result<(), crate::CoreError>;
    async fn delete(&self, chat: &ChatRef, message_id: i32) -> Result<(), crate::CoreError>;
    async fn send_document(
        &self,
        chat: &ChatRef,
        path: &std::path::Path,
    ) -> Result<(), crate::CoreError>;
}

/// The per-chat serialized message pipeline.
pub struct MessagePipeline {
    config: Arc<Config>,
    outbox: Arc<dyn ChatOutbox>,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<ProcessRegistry>,
    lanes: Arc<ChatLanes>,
    dedupe: DedupeCache,
}

impl MessagePipeline {
    pub fn new(
        config: Arc<Config>,
        outbox: Arc<dyn ChatOutbox>,
        orchestrator: Arc<Orchestrator>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            config,
            outbox,
            orchestrator,
            registry,
            lanes: Arc::new(ChatLanes::new()),
            dedupe: DedupeCache::new(DEDUPE_TTL, DEDUPE_CAPACITY),
        }
    }

    pub fn lanes(&self) -> Arc<ChatLanes> {
        Arc::clone(&self.lanes)
    }

    fn is_allowed(&self, user_id: u64) -> bool {
        self.config.telegram.allowed_user_ids.contains(&user_id)
    }

    fn is_abort(&self, text: &str) -> bool {
        if text == "/stop" {
            return true;
        }
        // Bare abort keywords are exact single-word matches only.
        if text.split_whitespace().count() != 1 {
            return false;
        }
        let lowered = text.to_lowercase();
        self.config
            .telegram
            .abort_keywords
            .iter()
            .any(|k| k.to_lowercase() == lowered)
    }

    /// Entry point for inbound text updates.
    pub async fn handle_update(&self, update: ChatUpdate) {
        if !self.is_allowed(update.user_id) {
            debug!(user_id = update.user_id, "dropping update from unlisted user");
            return;
        }

        let chat_id = update.chat.chat_id;
        let text = update.text.trim().to_string();
        if text.is_empty() {
            return;
        }

        if self.is_abort(&text) {
            self.abort_chat(&update.chat).await;
            return;
        }

        if crate::agent::commands::is_quick_command(&text) {
            self.handle_quick(&update, &text).await;
            return;
        }

        if self.dedupe.seen(chat_id, update.message_id) {
            debug!(chat_id, message_id = update.message_id, "duplicate update dropped");
            return;
        }

        // A fresh message clears the abort latch from any earlier kill.
        self.registry.clear_aborted(chat_id);

        let entry = QueueEntry::new(update.message_id);
        let entry_id = entry.id.clone();
        match self.lanes.acquire(chat_id, entry) {
            Acquire::Immediate => {}
            Acquire::Queued(proceed) => {
                let indicator = match self
                    .outbox
                    .send_queue_indicator(&update.chat, update.message_id, QUEUED_TEXT, &entry_id)
                    .await
                {
                    Ok(message_id) => {
                        self.lanes.set_indicator(chat_id, &entry_id, message_id);
                        Some(message_id)
                    }
                    Err(e) => {
                        warn!(chat_id, error = %e, "failed to post queue indicator");
                        None
                    }
                };

                if proceed.await.is_err() {
                    // Cancelled or drained; the canceller edited the indicator.
                    return;
                }
                if let Some(message_id) = indicator {
                    if let Err(e) = self.outbox.delete(&update.chat, message_id).await {
                        debug!(chat_id, error = %e, "failed to delete queue indicator");
                    }
                }
            }
        }

        self.process_holding_lane(&update.chat, &text).await;
        self.lanes.release(chat_id);
    }

    /// Entry point for inline-button presses.
    pub async fn handle_callback(&self, callback: CallbackUpdate) {
        if !self.is_allowed(callback.user_id) {
            return;
        }
        let chat_id = callback.chat.chat_id;

        // Queue-cancel buttons are whitelisted: no lane, immediate effect.
        if let Some(entry_id) = callback.data.strip_prefix(CANCEL_CALLBACK_PREFIX) {
            let entry = self.lanes.cancel(chat_id, entry_id);
            let indicator = entry
                .as_ref()
                .and_then(|e| e.indicator_message_id)
                .or(callback.message_id);
            if let Some(message_id) = indicator {
                if let Err(e) = self.outbox.edit(&callback.chat, message_id, CANCELLED_TEXT).await {
                    warn!(chat_id, error = %e, "failed to edit cancelled indicator");
                }
            }
            return;
        }

        // Everything else acquires the lane first to preserve per-chat FIFO.
        let entry = QueueEntry::new(callback.message_id.unwrap_or(0));
        match self.lanes.acquire(chat_id, entry) {
            Acquire::Immediate => {}
            Acquire::Queued(proceed) => {
                if proceed.await.is_err() {
                    return;
                }
            }
        }

        let result = self.orchestrator.handle_callback(chat_id, &callback.data).await;
        match result {
            Ok(reply) => self.deliver_reply(&callback.chat, None, reply).await,
            Err(e) => {
                error!(chat_id, kind = e.kind(), error = %e, "callback handling failed");
                let _ = self.outbox.send(&callback.chat, INTERNAL_ERROR_TEXT).await;
            }
        }
        self.lanes.release(chat_id);
    }

    /// Kill everything for the chat, drain the queue, and confirm.
    async fn abort_chat(&self, chat: &ChatRef) {
        let chat_id = chat.chat_id;
        info!(chat_id, "abort requested");
        let killed = self.registry.kill_all(chat_id).await;
        let drained = self.lanes.drain(chat_id);
        for entry in &drained {
            if let Some(message_id) = entry.indicator_message_id {
                if let Err(e) = self.outbox.edit(chat, message_id, DISCARDED_TEXT).await {
                    warn!(chat_id, error = %e, "failed to edit discarded indicator");
                }
            }
        }
        let summary = format!(
            "⏹ Stopped. Killed {killed} running process(es), discarded {} queued message(s).",
            drained.len()
        );
        if let Err(e) = self.outbox.send(chat, &summary).await {
            warn!(chat_id, error = %e, "failed to send abort confirmation");
        }
    }

    /// Quick read-only commands bypass the lane entirely. The model wizard
    /// additionally refuses to open while the lane is busy.
    async fn handle_quick(&self, update: &ChatUpdate, text: &str) {
        let chat_id = update.chat.chat_id;
        if text == "/model"
            && (self.lanes.is_busy(chat_id) || self.lanes.queue_len(chat_id) > 0)
        {
            let _ = self.outbox.send(&update.chat, BUSY_HINT).await;
            return;
        }
        match self.orchestrator.handle_message(chat_id, text).await {
            Ok(reply) => self.deliver_reply(&update.chat, None, reply).await,
            Err(e) => {
                error!(chat_id, kind = e.kind(), error = %e, "quick command failed");
                let _ = self.outbox.send(&update.chat, INTERNAL_ERROR_TEXT).await;
            }
        }
    }

    /// Run the orchestrator while holding the lane, streaming the reply
    /// into an edited-in-place chat message.
    async fn process_holding_lane(&self, chat: &ChatRef, text: &str) {
        let (events_tx, events_rx) = mpsc::channel::<StreamEvent>(64);
        let editor = ReplyEditor::new(Arc::clone(&self.outbox), chat.clone());
        let editor_task = tokio::spawn(editor.run(events_rx));

        let result = self
            .orchestrator
            .handle_message_streaming(chat.chat_id, text, events_tx)
            .await;

        let placeholder = editor_task.await.unwrap_or(None);

        match result {
            Ok(reply) => self.deliver_reply(chat, placeholder, reply).await,
            Err(e) => {
                error!(
                    chat_id = chat.chat_id,
                    kind = e.kind(),
                    error = %e,
                    "message handling failed"
                );
                match placeholder {
                    Some(message_id) => {
                        let _ = self.outbox.edit(chat, message_id, INTERNAL_ERROR_TEXT).await;
                    }
                    None => {
                        let _ = self.outbox.send(chat, INTERNAL_ERROR_TEXT).await;
                    }
                }
            }
        }
    }

    /// Turn a finished [`Reply`] into chat messages, reusing the streaming
    /// placeholder when possible.
    async fn deliver_reply(&self, chat: &ChatRef, placeholder: Option<i32>, reply: Reply) {
        let chat_id = chat.chat_id;

        if reply.text.is_empty() {
            // Aborted or suppressed: clean up the placeholder quietly.
            if let Some(message_id) = placeholder {
                let _ = self.outbox.delete(chat, message_id).await;
            }
        } else if !reply.buttons.is_empty() {
            if let Some(message_id) = placeholder {
                let _ = self.outbox.delete(chat, message_id).await;
            }
            if let Err(e) = self
                .outbox
                .send_with_buttons(chat, &reply.text, &reply.buttons)
                .await
            {
                warn!(chat_id, error = %e, "failed to send reply with controls");
            }
        } else {
            let chunks = chunk_message(&reply.text, MAX_MESSAGE_LEN);
            let mut chunks = chunks.into_iter();
            if let Some(first) = chunks.next() {
                match placeholder {
                    Some(message_id) => {
                        if let Err(e) = self.outbox.edit(chat, message_id, &first).await {
                            debug!(chat_id, error = %e, "final edit failed, sending fresh");
                            let _ = self.outbox.send(chat, &first).await;
                        }
                    }
                    None => {
                        let _ = self.outbox.send(chat, &first).await;
                    }
                }
            }
            for chunk in chunks {
                if let Err(e) = self.outbox.send(chat, &chunk).await {
                    warn!(chat_id, error = %e, "failed to send reply chunk");
                }
            }
        }

        for path in &reply.files {
            if let Err(e) = self.outbox.send_document(chat, path).await {
                warn!(chat_id, file = %path.display(), error = %e, "failed to send file");
            }
        }
    }
}

/// Wake-mode webhooks deliver through the same lane as typed messages.
#[async_trait]
impl WakeSink for MessagePipeline {
    async fn deliver(&self, chat_id: i64, text: String) {
        let chat = ChatRef::new(chat_id);
        let entry = QueueEntry::new(0);
        let entry_id = entry.id.clone();
        match self.lanes.acquire(chat_id, entry) {
            Acquire::Immediate => {}
            Acquire::Queued(proceed) => {
                let indicator = match self
                    .outbox
                    .send_queue_indicator(&chat, 0, QUEUED_TEXT, &entry_id)
                    .await
                {
                    Ok(message_id) => {
                        self.lanes.set_indicator(chat_id, &entry_id, message_id);
                        Some(message_id)
                    }
                    Err(_) => None,
                };
                if proceed.await.is_err() {
                    return;
                }
                if let Some(message_id) = indicator {
                    let _ = self.outbox.delete(&chat, message_id).await;
                }
            }
        }

        match self.orchestrator.handle_message(chat_id, &text).await {
            Ok(reply) => self.deliver_reply(&chat, None, reply).await,
            Err(e) => {
                error!(chat_id, kind = e.kind(), error = %e, "wake delivery failed");
            }
        }
        self.lanes.release(chat_id);
    }
}

// ── Streamed reply assembly ─────────────────────────────────────────

/// Consumes normalized stream events and keeps one chat message updated in
/// place: accumulated text plus a transient status line for tool use and
/// system states.
struct ReplyEditor {
    outbox: Arc<dyn ChatOutbox>,
    chat: ChatRef,
    message_id: Option<i32>,
    buffer: String,
    status: Option<String>,
    last_flush: Instant,
}

impl ReplyEditor {
    fn new(outbox: Arc<dyn ChatOutbox>, chat: ChatRef) -> Self {
        Self {
            outbox,
            chat,
            message_id: None,
            buffer: String::new(),
            status: None,
            last_flush: Instant::now()
                .checked_sub(EDIT_INTERVAL)
                .unwrap_or_else(Instant::now),
        }
    }

    /// Returns the id of the in-progress message, if one was posted, so the
    /// pipeline can finalize it.
    async fn run(mut self, mut events: mpsc::Receiver<StreamEvent>) -> Option<i32> {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::TextDelta(chunk) => {
                    self.buffer.push_str(&chunk);
                    self.status = None;
                }
                StreamEvent::ToolUse(name) => {
                    self.status = Some(format!("⚙️ {name}…"));
                }
                StreamEvent::SystemStatus(label) => {
                    self.status = Some(format!("💭 {label}…"));
                }
                StreamEvent::CompactBoundary { pre_tokens, .. } => {
                    self.status = Some(format!("♻️ compacting ({pre_tokens} tokens)…"));
                }
                StreamEvent::SystemInit { .. } | StreamEvent::Result { .. } => {}
            }
            self.flush_if_due().await;
        }
        self.message_id
    }

    async fn flush_if_due(&mut self) {
        if self.last_flush.elapsed() < EDIT_INTERVAL {
            return;
        }
        let mut display = self.buffer.clone();
        if let Some(status) = &self.status {
            if !display.is_empty() {
                display.push_str("\n\n");
            }
            display.push_str(status);
        }
        if display.is_empty() {
            return;
        }
        let display = tail_clamp(&display, MAX_MESSAGE_LEN - 96);

        match self.message_id {
            None => match self.outbox.send(&self.chat, &display).await {
                Ok(message_id) => {
                    self.message_id = Some(message_id);
                    self.last_flush = Instant::now();
                }
                Err(e) => debug!(error = %e, "failed to post streaming message"),
            },
            Some(message_id) => {
                if let Err(e) = self.outbox.edit(&self.chat, message_id, &display).await {
                    debug!(error = %e, "failed to edit streaming message");
                }
                self.last_flush = Instant::now();
            }
        }
    }
}

/// Keep the tail of an over-long in-progress display.
fn tail_clamp(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &text[start..])
}

/// Split a message into chunks the platform accepts, preferring newline
/// boundaries.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > max_len {
            // A single over-long line is split hard on char boundaries.
            let mut rest = line;
            while rest.len() > max_len {
                let mut cut = max_len;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
