//! The orchestrator: classifies input, drives the normal and heartbeat
//! flows, and owns cross-cutting state (active provider/model, hooks).
//!
//! Typed core errors from downstream are surfaced to the caller; the
//! pipeline converts them to a generic internal-error reply. The one
//! automatic retry in the system lives here: a call that supplied a resume
//! id and failed is retried exactly once as a fresh session.

pub mod commands;
pub mod directives;
pub mod hooks;
pub mod scan;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::{
    equivalent_model, known_models, provider_for_model, CliRequest, CliResponse,
    ProviderExecutor, StreamEvent, PROVIDERS,
};
use crate::config::Config;
use crate::cron::CronStore;
use crate::paths::WorkspacePaths;
use crate::process::ProcessRegistry;
use crate::session::SessionStore;
use crate::CoreError;
use commands::Command;
use hooks::{HookContext, MemoryReminderHook, PromptHook};
use scan::InjectionScanner;

const SESSION_RESET_TEXT: &str =
    "⚠️ The call failed and your session was reset. Send your message again to start fresh.";
const DIRECTIVE_ONLY_TEXT: &str =
    "ℹ️ Model directives prefix a message, e.g. `@opus review the diff`. \
     Use /model to switch the session's model permanently.";
const NEW_SESSION_FOOTER: &str = "💡 This session has been going a while — consider /new.";

/// Reply returned to the pipeline: text plus optional inline controls and
/// file references.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub text: String,
    /// Rows of `(label, callback data)` buttons.
    pub buttons: Vec<Vec<(String, String)>>,
    pub files: Vec<PathBuf>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    paths: Arc<WorkspacePaths>,
    sessions: Arc<SessionStore>,
    cli: Arc<dyn ProviderExecutor>,
    registry: Arc<ProcessRegistry>,
    cron_store: Arc<CronStore>,
    scanner: InjectionScanner,
    hooks: Vec<Box<dyn PromptHook>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        paths: Arc<WorkspacePaths>,
        sessions: Arc<SessionStore>,
        cli: Arc<dyn ProviderExecutor>,
        registry: Arc<ProcessRegistry>,
        cron_store: Arc<CronStore>,
    ) -> Self {
        Self {
            config,
            paths,
            sessions,
            cli,
            registry,
            cron_store,
            scanner: InjectionScanner::new(),
            hooks: vec![Box::new(MemoryReminderHook)],
        }
    }

    /// Non-streaming entry point.
    pub async fn handle_message(&self, chat_id: i64, text: &str) -> Result<Reply, CoreError> {
        self.handle_inner(chat_id, text, None).await
    }

    /// Streaming entry point: normalized events arrive on `events` in
    /// order, always before this returns.
    pub async fn handle_message_streaming(
        &self,
        chat_id: i64,
        text: &str,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<Reply, CoreError> {
        self.handle_inner(chat_id, text, Some(events)).await
    }

    async fn handle_inner(
        &self,
        chat_id: i64,
        text: &str,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<Reply, CoreError> {
        self.scanner.scan_and_log(chat_id, text);

        if let Some(command) = commands::dispatch(text) {
            return self.run_command(chat_id, command).await;
        }

        let parsed = directives::parse(text);
        if parsed.body.is_empty() {
            if parsed.model.is_some() {
                return Ok(Reply::text(DIRECTIVE_ONLY_TEXT));
            }
            return Ok(Reply::default());
        }

        self.normal_flow(chat_id, parsed, events).await
    }

    /// Inline-control responses. Model-wizard selections arrive as
    /// `model:<name>`.
    pub async fn handle_callback(&self, chat_id: i64, data: &str) -> Result<Reply, CoreError> {
        if let Some(model) = data.strip_prefix("model:") {
            return self.switch_model(chat_id, model).await;
        }
        warn!(chat_id, data, "unknown callback data");
        Ok(Reply::default())
    }

    // ── Normal flow ─────────────────────────────────────────────────

    async fn normal_flow(
        &self,
        chat_id: i64,
        parsed: directives::Directives,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<Reply, CoreError> {
        let envelope = self.sessions.get(chat_id).await.unwrap_or_default();

        // Target resolution: directive > per-chat override > configured
        // default, then fall back across providers by authentication.
        let from_directive = parsed.model.is_some();
        let (mut provider, mut model) = match &parsed.model {
            Some((provider, model)) => (provider.to_string(), model.clone()),
            None if !envelope.active_provider.is_empty() => (
                envelope.active_provider.clone(),
                envelope.active_model.clone(),
            ),
            None => (
                self.config.defaults.provider.clone(),
                self.config.defaults.model.clone(),
            ),
        };

        let authenticated = self.cli.authenticated_providers();
        if !authenticated.contains(&provider) {
            if let Some(fallback) = PROVIDERS.iter().find(|p| authenticated.contains(**p)) {
                info!(chat_id, from = provider, to = fallback, "provider fallback");
                model = equivalent_model(&model, fallback).to_string();
                provider = fallback.to_string();
            }
            // No provider authenticated: proceed and let the spawn produce
            // the real error for the logs.
        }

        let bucket = envelope.bucket(&provider).cloned().unwrap_or_default();
        let resume_id = bucket.session_id.clone();
        let is_new = resume_id.is_none();

        if !from_directive {
            let provider_for_update = provider.clone();
            let model_for_update = model.clone();
            self.sessions
                .update(chat_id, move |envelope| {
                    envelope.active_provider = provider_for_update;
                    envelope.active_model = model_for_update;
                })
                .await?;
        }

        let append_system = self.build_appended_system(chat_id, is_new, bucket.message_count + 1);

        let request = CliRequest {
            chat_id,
            provider: provider.clone(),
            model,
            prompt: parsed.body,
            append_system_prompt: append_system,
            resume_session_id: resume_id.clone(),
            reasoning_effort: self.config.defaults.reasoning_effort.clone(),
            max_turns: self.config.defaults.max_turns,
            max_budget_usd: self.config.defaults.max_budget_usd,
            permission_mode: self.config.defaults.permission_mode.clone(),
            extra_args: self.config.defaults.extra_args.clone(),
            working_dir: Some(self.paths.workspace_dir.clone()),
            label: "chat".into(),
            ..Default::default()
        };

        let response = match self.execute(&request, &events).await {
            Ok(response) if !response.is_error => response,
            failed => {
                // Retry-on-resume-only: a failed resume gets exactly one
                // fresh attempt. Anything else resets the session.
                if let Err(e) = &failed {
                    warn!(chat_id, provider, error = %e, "provider call failed");
                }
                if resume_id.is_some() {
                    info!(chat_id, provider, "resume failed, retrying as fresh session");
                    self.sessions.clear_bucket(chat_id, &provider).await?;
                    let mut retry = request.clone();
                    retry.resume_session_id = None;
                    retry.append_system_prompt =
                        self.build_appended_system(chat_id, true, 1);
                    match self.execute(&retry, &events).await {
                        Ok(response) if !response.is_error => response,
                        _ => {
                            self.reset_session(chat_id, &provider).await?;
                            return Ok(Reply::text(SESSION_RESET_TEXT));
                        }
                    }
                } else {
                    self.reset_session(chat_id, &provider).await?;
                    return Ok(Reply::text(SESSION_RESET_TEXT));
                }
            }
        };

        // An aborted call yields an empty response; nothing to record.
        if self.registry.is_aborted(chat_id) && response.text.is_empty() {
            return Ok(Reply::default());
        }

        let bucket_after = self
            .sessions
            .record_usage(
                chat_id,
                &provider,
                response.session_id.clone(),
                response.cost_usd,
                response.tokens,
            )
            .await?;

        let mut text = response.text;
        if self.session_is_aged(chat_id).await && bucket_after.message_count % 10 == 0 {
            text.push_str("\n\n");
            text.push_str(NEW_SESSION_FOOTER);
        }
        Ok(Reply::text(text))
    }

    async fn execute(
        &self,
        request: &CliRequest,
        events: &Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<CliResponse, CoreError> {
        match events {
            Some(events) => self.cli.execute_streaming(request, events.clone()).await,
            None => self.cli.execute(request).await,
        }
    }

    fn build_appended_system(
        &self,
        chat_id: i64,
        is_new: bool,
        message_number: u64,
    ) -> Option<String> {
        let mut sections: Vec<String> = Vec::new();

        if is_new {
            match std::fs::read_to_string(&self.paths.memory_file) {
                Ok(memory) if !memory.trim().is_empty() => {
                    sections.push(format!("## Long-term memory\n\n{memory}"));
                }
                _ => {}
            }
        }

        let ctx = HookContext {
            chat_id,
            message_number,
            is_new_session: is_new,
        };
        for hook in &self.hooks {
            if let Some(text) = hook.before_send(&ctx) {
                sections.push(text);
            }
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    /// Kill this chat's processes and clear the provider bucket. The caller
    /// emits the explicit session-reset message.
    async fn reset_session(&self, chat_id: i64, provider: &str) -> Result<(), CoreError> {
        self.registry.kill_all(chat_id).await;
        self.sessions.clear_bucket(chat_id, provider).await
    }

    async fn session_is_aged(&self, chat_id: i64) -> bool {
        let Some(envelope) = self.sessions.get(chat_id).await else {
            return false;
        };
        let age_limit = ChronoDuration::hours(self.config.cli.session_age_hint_hours as i64);
        Utc::now() - envelope.created_at > age_limit
    }

    // ── Heartbeat flow ──────────────────────────────────────────────

    /// Periodic check-in against the chat's resumed session. Returns text
    /// to deliver, or `None` when skipped or acknowledged.
    pub async fn handle_heartbeat(&self, chat_id: i64) -> Result<Option<String>, CoreError> {
        let Some(envelope) = self.sessions.get(chat_id).await else {
            return Ok(None);
        };

        let provider = self.config.defaults.provider.clone();
        if envelope.active_provider != provider {
            return Ok(None);
        }
        let Some(session_id) = envelope.bucket(&provider).and_then(|b| b.session_id.clone())
        else {
            return Ok(None);
        };

        let cooldown = ChronoDuration::minutes(self.config.heartbeat.cooldown_minutes as i64);
        if Utc::now() - envelope.last_active < cooldown {
            return Ok(None);
        }

        let request = CliRequest {
            chat_id,
            provider: provider.clone(),
            model: envelope.active_model.clone(),
            prompt: self.config.heartbeat.prompt.clone(),
            resume_session_id: Some(session_id),
            permission_mode: self.config.defaults.permission_mode.clone(),
            working_dir: Some(self.paths.workspace_dir.clone()),
            label: "heartbeat".into(),
            ..Default::default()
        };

        let response = self.cli.execute(&request).await?;
        let trimmed = response.text.trim();
        let ack = &self.config.heartbeat.ack_token;
        if trimmed == ack || trimmed.starts_with(ack.as_str()) {
            // Acknowledged: suppress entirely, no metric updates.
            return Ok(None);
        }

        self.sessions
            .record_usage(
                chat_id,
                &provider,
                response.session_id,
                response.cost_usd,
                response.tokens,
            )
            .await?;
        Ok(Some(response.text))
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn run_command(&self, chat_id: i64, command: Command) -> Result<Reply, CoreError> {
        match command {
            Command::Help => Ok(Reply::text(help_text())),
            Command::Status => self.cmd_status(chat_id).await,
            Command::New => self.cmd_new(chat_id).await,
            Command::Model(None) => Ok(self.model_wizard()),
            Command::Model(Some(model)) => self.switch_model(chat_id, &model).await,
            Command::Memory => self.cmd_memory(),
            Command::CronList => self.cmd_cron_list(),
            Command::Diagnose => self.cmd_diagnose(chat_id).await,
            Command::Files(name) => self.cmd_files(name),
        }
    }

    async fn cmd_status(&self, chat_id: i64) -> Result<Reply, CoreError> {
        let envelope = self.sessions.get(chat_id).await;
        let body = match &envelope {
            Some(envelope) => {
                let mut lines = vec![
                    format!("Provider: {}", display_or(&envelope.active_provider, "(default)")),
                    format!("Model: {}", display_or(&envelope.active_model, "(default)")),
                    format!("Last active: {}", envelope.last_active.format("%Y-%m-%d %H:%M UTC")),
                ];
                for (provider, bucket) in &envelope.providers {
                    lines.push(format!(
                        "{provider}: {} messages, {} tokens, ${:.2}{}",
                        bucket.message_count,
                        bucket.total_tokens,
                        bucket.total_cost_usd,
                        if bucket.session_id.is_some() { " (resumable)" } else { "" },
                    ));
                }
                lines.join("\n")
            }
            None => "No session yet. Send a message to start one.".into(),
        };
        Ok(Reply::text(framed("Status", &body)))
    }

    async fn cmd_new(&self, chat_id: i64) -> Result<Reply, CoreError> {
        let envelope = self.sessions.get(chat_id).await.unwrap_or_default();
        let provider = if envelope.active_provider.is_empty() {
            self.config.defaults.provider.clone()
        } else {
            envelope.active_provider
        };
        self.registry.kill_all(chat_id).await;
        self.sessions.clear_bucket(chat_id, &provider).await?;
        Ok(Reply::text(format!(
            "🆕 Fresh session for {provider}. Your next message starts a new conversation."
        )))
    }

    fn model_wizard(&self) -> Reply {
        let mut buttons = Vec::new();
        for provider in PROVIDERS {
            let row = known_models(provider)
                .iter()
                .map(|m| (format!("{provider}: {m}"), format!("model:{m}")))
                .collect();
            buttons.push(row);
        }
        Reply {
            text: framed("Model", "Pick the model for this chat:"),
            buttons,
            files: Vec::new(),
        }
    }

    async fn switch_model(&self, chat_id: i64, model: &str) -> Result<Reply, CoreError> {
        let Some(provider) = provider_for_model(model) else {
            let known: Vec<&str> = PROVIDERS.iter().flat_map(|p| known_models(p)).copied().collect();
            return Ok(Reply::text(format!(
                "Unknown model {model:?}. Known models: {}",
                known.join(", ")
            )));
        };
        let model_owned = model.to_string();
        self.sessions
            .update(chat_id, move |envelope| {
                envelope.active_provider = provider.to_string();
                envelope.active_model = model_owned;
            })
            .await?;
        Ok(Reply::text(format!("✅ Switched to {provider} / {model}.")))
    }

    fn cmd_memory(&self) -> Result<Reply, CoreError> {
        let body = match std::fs::read_to_string(&self.paths.memory_file) {
            Ok(content) if !content.trim().is_empty() => content,
            _ => "Memory file is empty.".into(),
        };
        Ok(Reply::text(framed("Memory", &body)))
    }

    fn cmd_cron_list(&self) -> Result<Reply, CoreError> {
        let entries = self.cron_store.load()?;
        let body = if entries.is_empty() {
            "No cron jobs configured.".to_string()
        } else {
            entries
                .iter()
                .map(|entry| {
                    format!(
                        "{} {} [{}]\n   {} · {}",
                        if entry.enabled { "✅" } else { "⏸" },
                        entry.title,
                        entry.id,
                        entry.schedule,
                        entry
                            .last_status
                            .as_deref()
                            .map(|s| format!("last: {s}"))
                            .unwrap_or_else(|| "never run".into()),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(Reply::text(framed("Cron jobs", &body)))
    }

    async fn cmd_diagnose(&self, chat_id: i64) -> Result<Reply, CoreError> {
        let mut lines = Vec::new();
        for provider in PROVIDERS {
            let mark = if self.cli.authenticated_providers().contains(*provider) {
                "✅ authenticated"
            } else {
                "❌ not authenticated"
            };
            lines.push(format!("{provider}: {mark}"));
        }
        lines.push(format!(
            "Workspace: {} ({})",
            self.paths.workspace_dir.display(),
            if self.paths.workspace_dir.is_dir() { "ok" } else { "missing" },
        ));
        lines.push(format!(
            "Running processes for this chat: {}",
            self.registry.count_for_chat(chat_id)
        ));
        lines.push(format!(
            "Sessions on disk: {}",
            self.sessions.chat_ids().await.len()
        ));
        Ok(Reply::text(framed("Diagnose", &lines.join("\n"))))
    }

    fn cmd_files(&self, name: Option<String>) -> Result<Reply, CoreError> {
        let dir = &self.paths.output_dir;
        match name {
            Some(name) => {
                if name.contains(['/', '\\']) || name.contains("..") {
                    return Err(CoreError::Security(format!("bad file name: {name:?}")));
                }
                let path = dir.join(&name);
                if !path.is_file() {
                    return Ok(Reply::text(format!("No such file: {name}")));
                }
                Ok(Reply {
                    text: format!("📎 {name}"),
                    buttons: Vec::new(),
                    files: vec![path],
                })
            }
            None => {
                let mut names: Vec<String> = std::fs::read_dir(dir)
                    .map(|entries| {
                        entries
                            .flatten()
                            .filter(|e| e.path().is_file())
                            .map(|e| e.file_name().to_string_lossy().into_owned())
                            .collect()
                    })
                    .unwrap_or_default();
                names.sort();
                let body = if names.is_empty() {
                    "No output files.".to_string()
                } else {
                    format!(
                        "{}\n\nFetch one with /files <name>.",
                        names.join("\n")
                    )
                };
                Ok(Reply::text(framed("Output files", &body)))
            }
        }
    }
}

/// Consistent title/separator/body layout for command responses.
fn framed(title: &str, body: &str) -> String {
    format!("{title}\n─────────────────\n{body}")
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn help_text() -> String {
    framed(
        "relaybot",
        "/status — session and usage\n\
         /new — start a fresh session\n\
         /model — switch model (wizard or /model <name>)\n\
         /memory — show the long-term memory file\n\
         /cron — list scheduled jobs\n\
         /files — browse output files\n\
         /diagnose — provider and workspace health\n\
         /stop — abort running work and clear the queue\n\n\
         Prefix a message with @<model> to use it once, e.g. `@opus review this`.",
    )
}
