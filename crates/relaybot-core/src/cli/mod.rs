//! Provider subprocess layer.
//!
//! Spawns an agent CLI (claude or codex) with a composed command line,
//! feeds it the prompt, parses normalized events from its stdout, and
//! returns a final [`CliResponse`]. Forced termination goes through the
//! injected [`ProcessRegistry`].

pub mod claude;
pub mod codex;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CliConfig;
use crate::process::ProcessRegistry;
use crate::CoreError;

/// One provider call.
#[derive(Debug, Clone, Default)]
pub struct CliRequest {
    pub chat_id: i64,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub resume_session_id: Option<String>,
    /// Continue the most recent conversation without an explicit id.
    pub continue_last: bool,
    pub reasoning_effort: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub permission_mode: String,
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub label: String,
}

/// Final result of a provider call.
#[derive(Debug, Clone, Default)]
pub struct CliResponse {
    pub text: String,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub tokens: u64,
    pub is_error: bool,
    /// Streaming failed and the text came from the accumulated buffer or a
    /// non-streaming retry. Internal telemetry only.
    pub stream_fallback: bool,
}

/// Normalized stream events, provider-independent.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolUse(String),
    SystemInit {
        session_id: String,
    },
    /// label ∈ {thinking, compacting, …}
    SystemStatus(String),
    CompactBoundary {
        trigger: String,
        pre_tokens: u64,
    },
    Result {
        session_id: Option<String>,
        cost_usd: f64,
        tokens: u64,
        is_error: bool,
        text: Option<String>,
    },
}

/// Authentication status of a provider, discovered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Authenticated,
    Installed,
    NotFound,
}

pub const PROVIDERS: &[&str] = &["claude", "codex"];

/// Model ids each provider accepts. Used for directive detection and for
/// validating cron/webhook override models.
pub fn known_models(provider: &str) -> &'static [&'static str] {
    match provider {
        "claude" => &["sonnet", "opus", "haiku"],
        "codex" => &["gpt-5-codex", "gpt-5", "gpt-5-mini"],
        _ => &[],
    }
}

/// Which provider owns a model id.
pub fn provider_for_model(model: &str) -> Option<&'static str> {
    PROVIDERS
        .iter()
        .copied()
        .find(|p| known_models(p).contains(&model))
}

/// Closest equivalents between the two providers, used when falling back
/// from an unauthenticated provider.
const EQUIVALENT_MODELS: &[(&str, &str)] = &[
    ("sonnet", "gpt-5-codex"),
    ("opus", "gpt-5"),
    ("haiku", "gpt-5-mini"),
];

/// Map a model onto the other provider's closest equivalent.
pub fn equivalent_model(model: &str, target_provider: &str) -> &'static str {
    for (claude_model, codex_model) in EQUIVALENT_MODELS {
        if target_provider == "codex" && model == *claude_model {
            return codex_model;
        }
        if target_provider == "claude" && model == *codex_model {
            return claude_model;
        }
    }
    // Unknown model: the target provider's default.
    known_models(target_provider).first().copied().unwrap_or("sonnet")
}

/// Check for a provider's credentials file in its home directory, falling
/// back to a PATH probe for the binary.
pub fn discover_provider(provider: &str, binary: &str) -> ProviderStatus {
    let creds = match provider {
        "claude" => crate::paths::WorkspacePaths::claude_home().join(".credentials.json"),
        "codex" => crate::paths::WorkspacePaths::codex_home().join("auth.json"),
        _ => return ProviderStatus::NotFound,
    };
    if creds.exists() {
        return ProviderStatus::Authenticated;
    }
    if binary_on_path(binary) {
        return ProviderStatus::Installed;
    }
    ProviderStatus::NotFound
}

fn binary_on_path(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

// ── Service ─────────────────────────────────────────────────────────

/// The seam the orchestrator calls providers through. [`CliService`] is
/// the real implementation; tests substitute a scripted stub.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    async fn execute(&self, req: &CliRequest) -> Result<CliResponse, CoreError>;
    async fn execute_streaming(
        &self,
        req: &CliRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<CliResponse, CoreError>;
    /// Providers with credentials present at startup.
    fn authenticated_providers(&self) -> &HashSet<String>;
}

#[async_trait]
impl ProviderExecutor for CliService {
    async fn execute(&self, req: &CliRequest) -> Result<CliResponse, CoreError> {
        CliService::execute(self, req).await
    }

    async fn execute_streaming(
        &self,
        req: &CliRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<CliResponse, CoreError> {
        CliService::execute_streaming(self, req, events).await
    }

    fn authenticated_providers(&self) -> &HashSet<String> {
        CliService::authenticated_providers(self)
    }
}

/// The provider subprocess service. One instance for the whole process.
pub struct CliService {
    registry: Arc<ProcessRegistry>,
    timeout: Duration,
    claude_binary: String,
    codex_binary: String,
    authenticated: HashSet<String>,
}

/// Composed invocation: the command plus an optional stdin payload used on
/// hosts where the prompt must not travel on the command line.
pub(crate) struct Invocation {
    pub command: tokio::process::Command,
    pub stdin_payload: Option<String>,
}

impl CliService {
    pub fn new(registry: Arc<ProcessRegistry>, config: &CliConfig) -> Self {
        let mut authenticated = HashSet::new();
        for provider in PROVIDERS {
            let binary = match *provider {
                "claude" => config.claude_binary.as_str(),
                _ => config.codex_binary.as_str(),
            };
            let status = discover_provider(provider, binary);
            info!(provider, ?status, "provider discovery");
            if status == ProviderStatus::Authenticated {
                authenticated.insert(provider.to_string());
            }
        }

        Self {
            registry,
            timeout: Duration::from_secs(config.timeout_seconds),
            claude_binary: config.claude_binary.clone(),
            codex_binary: config.codex_binary.clone(),
            authenticated,
        }
    }

    /// Providers with credentials present at startup.
    pub fn authenticated_providers(&self) -> &HashSet<String> {
        &self.authenticated
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn binary_for(&self, provider: &str) -> &str {
        match provider {
            "claude" => &self.claude_binary,
            _ => &self.codex_binary,
        }
    }

    /// Non-streaming call: run to completion, parse the final output.
    pub async fn execute(&self, req: &CliRequest) -> Result<CliResponse, CoreError> {
        let invocation = self.compose(req, false)?;
        let output = self.run_to_completion(req, invocation).await?;
        match req.provider.as_str() {
            "claude" => claude::parse_result_json(&output),
            "codex" => codex::parse_transcript(&output),
            other => Err(CoreError::cli(format!("unknown provider: {other}"))),
        }
    }

    /// Streaming call: normalized events are delivered in arrival order on
    /// `events`, always before the returned result.
    pub async fn execute_streaming(
        &self,
        req: &CliRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<CliResponse, CoreError> {
        let invocation = self.compose(req, true)?;
        match self.run_streaming(req, invocation, &events).await {
            Ok(response) => Ok(response),
            Err(StreamOutcome::Aborted) => Ok(CliResponse::default()),
            Err(StreamOutcome::NeedsFallback(reason)) => {
                warn!(chat_id = req.chat_id, reason, "stream fallback: retrying non-streaming");
                let mut response = self.execute(req).await?;
                response.stream_fallback = true;
                Ok(response)
            }
            Err(StreamOutcome::Failed(e)) => Err(e),
        }
    }

    fn compose(&self, req: &CliRequest, streaming: bool) -> Result<Invocation, CoreError> {
        match req.provider.as_str() {
            "claude" => Ok(claude::compose(self.binary_for("claude"), req, streaming)),
            "codex" => Ok(codex::compose(self.binary_for("codex"), req)),
            other => Err(CoreError::cli(format!("unknown provider: {other}"))),
        }
    }

    async fn spawn(
        &self,
        req: &CliRequest,
        mut invocation: Invocation,
    ) -> Result<(crate::process::ProcHandle, tokio::process::ChildStdout), CoreError> {
        invocation
            .command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        if invocation.stdin_payload.is_some() {
            invocation.command.stdin(std::process::Stdio::piped());
        } else {
            invocation.command.stdin(std::process::Stdio::null());
        }
        if let Some(dir) = &req.working_dir {
            invocation.command.current_dir(dir);
        }

        let mut child = invocation.command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::CliNotFound {
                    provider: req.provider.clone(),
                }
            } else {
                CoreError::cli_io(format!("spawn {} failed", req.provider), e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Stream("child stdout not captured".into()))?;

        if let Some(payload) = invocation.stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(payload.as_bytes())
                    .await
                    .map_err(|e| CoreError::cli_io("write prompt to stdin", e))?;
                // Close stdin so the provider starts working.
                drop(stdin);
            }
        }

        let handle = self.registry.register(req.chat_id, &req.label, child);
        Ok((handle, stdout))
    }

    async fn run_to_completion(
        &self,
        req: &CliRequest,
        invocation: Invocation,
    ) -> Result<String, CoreError> {
        let (handle, mut stdout) = self.spawn(req, invocation).await?;

        let collected = tokio::time::timeout(self.timeout, async {
            let mut buf = String::new();
            stdout
                .read_to_string(&mut buf)
                .await
                .map_err(|e| CoreError::cli_io("read stdout", e))?;
            let status = handle.wait().await;
            Ok::<_, CoreError>((buf, status))
        })
        .await;

        match collected {
            Ok(Ok((buf, status))) => {
                self.registry.unregister(handle.id);
                if let Some(status) = status {
                    if !status.success() && buf.trim().is_empty() {
                        return Err(CoreError::CliExit {
                            code: status.code().unwrap_or(-1),
                        });
                    }
                }
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.registry.unregister(handle.id);
                Err(e)
            }
            Err(_) => {
                handle.kill().await;
                self.registry.unregister(handle.id);
                Err(CoreError::CliTimeout(self.timeout))
            }
        }
    }

    async fn run_streaming(
        &self,
        req: &CliRequest,
        invocation: Invocation,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<CliResponse, StreamOutcome> {
        let (handle, stdout) = self
            .spawn(req, invocation)
            .await
            .map_err(StreamOutcome::Failed)?;
        let aborted = self.registry.aborted_flag(req.chat_id);

        let mut lines = BufReader::new(stdout).lines();
        let mut accumulated = String::new();
        let mut init_session_id: Option<String> = None;
        let mut final_result: Option<CliResponse> = None;
        let mut stream_error = false;
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let next = tokio::time::timeout_at(deadline, lines.next_line()).await;
            let line = match next {
                Err(_) => {
                    handle.kill().await;
                    self.registry.unregister(handle.id);
                    return Err(StreamOutcome::Failed(CoreError::CliTimeout(self.timeout)));
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "stream read error");
                    stream_error = true;
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let event = match req.provider.as_str() {
                "claude" => claude::parse_stream_line(&line),
                _ => codex::parse_stream_line(&line),
            };
            let Some(event) = event else {
                // Malformed event lines are non-fatal: skip.
                debug!(line = %truncate(&line, 120), "unparsed stream line");
                continue;
            };

            match &event {
                StreamEvent::TextDelta(chunk) => accumulated.push_str(chunk),
                StreamEvent::SystemInit { session_id } => {
                    init_session_id = Some(session_id.clone());
                }
                StreamEvent::Result {
                    session_id,
                    cost_usd,
                    tokens,
                    is_error,
                    text,
                } => {
                    let text = match text {
                        Some(t) if !t.is_empty() => t.clone(),
                        _ => accumulated.clone(),
                    };
                    final_result = Some(CliResponse {
                        text,
                        session_id: session_id.clone().or_else(|| init_session_id.clone()),
                        cost_usd: *cost_usd,
                        tokens: *tokens,
                        is_error: *is_error,
                        stream_fallback: false,
                    });
                }
                _ => {}
            }

            let is_final = final_result.is_some();
            let _ = events.send(event).await;

            // An independent path has already signalled the child; stop
            // reading without waiting for it to exit.
            if aborted.load(Ordering::SeqCst) {
                self.registry.unregister(handle.id);
                return Err(StreamOutcome::Aborted);
            }

            if is_final {
                break;
            }
        }

        // The provider exits right after its final event; don't let a
        // misbehaving child hold the lane open forever.
        if tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .is_err()
        {
            handle.kill().await;
        }
        self.registry.unregister(handle.id);

        if let Some(response) = final_result {
            return Ok(response);
        }
        if aborted.load(Ordering::SeqCst) {
            return Err(StreamOutcome::Aborted);
        }
        if !accumulated.is_empty() && !stream_error {
            // The stream died after producing text: synthesize a result so
            // no content is lost.
            return Ok(CliResponse {
                text: accumulated,
                session_id: init_session_id,
                cost_usd: 0.0,
                tokens: 0,
                is_error: false,
                stream_fallback: true,
            });
        }
        Err(StreamOutcome::NeedsFallback(if stream_error {
            "read error before result"
        } else {
            "stream ended without result event"
        }))
    }
}

/// Internal streaming outcome, separated from `CoreError` so the caller can
/// distinguish abort and fallback from hard failures.
enum StreamOutcome {
    Aborted,
    NeedsFallback(&'static str),
    Failed(CoreError),
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_for_model() {
        assert_eq!(provider_for_model("sonnet"), Some("claude"));
        assert_eq!(provider_for_model("gpt-5-codex"), Some("codex"));
        assert_eq!(provider_for_model("unknown-model"), None);
    }

    #[test]
    fn test_equivalence_map_both_directions() {
        assert_eq!(equivalent_model("sonnet", "codex"), "gpt-5-codex");
        assert_eq!(equivalent_model("gpt-5", "claude"), "opus");
        // Unknown models land on the target's default.
        assert_eq!(equivalent_model("mystery", "claude"), "sonnet");
    }
}
