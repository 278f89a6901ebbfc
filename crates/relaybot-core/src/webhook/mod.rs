//! Inbound HTTP webhook server.
//!
//! Two routes: `GET /health` and `POST /hooks/{id}`. Requests run through a
//! strict validation chain (rate limit, content type, JSON-object body,
//! hook lookup, enabled flag, per-hook auth); the first failure returns
//! its status with no dispatch. Accepted events are dispatched
//! fire-and-forget and answered with 202 immediately.
//!
//! The server knows nothing about the chat transport: wake-mode dispatch
//! goes through an injected [`WakeSink`] that delivers the rendered text as
//! if the user had typed it.

pub mod auth;
pub mod template;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cron::clock::QuietHours;
use crate::runner::{ExecOverrides, TaskRunner, TaskSpec, TaskStatus};
use crate::store;
use crate::CoreError;
use auth::HookAuth;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    Wake,
    Task,
}

/// One registered webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    pub mode: HookMode,
    /// Prompt template with `{{field}}` placeholders.
    pub template: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Required for task mode.
    pub task_folder: Option<String>,
    pub auth: HookAuth,
    pub overrides: ExecOverrides,
    pub quiet_hours: Option<QuietHours>,
    pub dependency_key: Option<String>,
    pub trigger_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for WebhookEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            mode: HookMode::Wake,
            template: String::new(),
            enabled: true,
            task_folder: None,
            auth: HookAuth::default(),
            overrides: ExecOverrides::default(),
            quiet_hours: None,
            dependency_key: None,
            trigger_count: 0,
            last_triggered: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WebhookFile {
    hooks: Vec<WebhookEntry>,
}

/// Store for webhook entries with an mtime-checked cache so out-of-band
/// edits by the helper tools are visible on the next request.
pub struct WebhookStore {
    path: PathBuf,
    cache: Mutex<(Option<SystemTime>, Vec<WebhookEntry>)>,
}

impl WebhookStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new((None, Vec::new())),
        }
    }

    pub fn entries(&self) -> Vec<WebhookEntry> {
        let mut cache = self.cache.lock().unwrap();
        let mtime = store::file_mtime(&self.path);
        if cache.0 != mtime {
            match store::load_json::<WebhookFile>(&self.path) {
                Ok(file) => {
                    cache.0 = mtime;
                    cache.1 = file.unwrap_or_default().hooks;
                }
                Err(e) => {
                    error!(error = %e, "webhooks.json unreadable, keeping previous entries");
                }
            }
        }
        cache.1.clone()
    }

    pub fn find(&self, id: &str) -> Option<WebhookEntry> {
        self.entries().into_iter().find(|h| h.id == id)
    }

    /// Update trigger bookkeeping after a dispatch attempt.
    pub fn record_trigger(&self, id: &str, error: Option<String>) {
        let result: Result<(), CoreError> = (|| {
            let file: Option<WebhookFile> = store::load_json(&self.path)?;
            let mut file = file.unwrap_or_default();
            if let Some(hook) = file.hooks.iter_mut().find(|h| h.id == id) {
                hook.trigger_count += 1;
                hook.last_triggered = Some(Utc::now());
                hook.last_error = error;
            }
            store::save_json_atomic(&self.path, &file)
        })();
        if let Err(e) = result {
            error!(id, error = %e, "failed to record webhook trigger");
        }
    }
}

// ── Rate limiting ───────────────────────────────────────────────────

/// Per-source sliding-window limiter.
pub struct RateLimiter {
    window: Duration,
    limit: u32,
    buckets: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            window: Duration::from_secs(60),
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, source: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let hits = buckets.entry(source).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);
        if hits.len() >= self.limit as usize {
            return false;
        }
        hits.push(now);
        true
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

/// Injected hook that delivers wake-mode text into a chat's main session
/// as if the user had typed it, under the chat's own lock.
#[async_trait]
pub trait WakeSink: Send + Sync {
    async fn deliver(&self, chat_id: i64, text: String);
}

pub struct HookDispatcher {
    store: Arc<WebhookStore>,
    runner: Arc<TaskRunner>,
    wake: Arc<dyn WakeSink>,
    /// Chats that receive wake-mode deliveries, in order.
    wake_chats: Vec<i64>,
}

impl HookDispatcher {
    pub fn new(
        store: Arc<WebhookStore>,
        runner: Arc<TaskRunner>,
        wake: Arc<dyn WakeSink>,
        wake_chats: Vec<i64>,
    ) -> Self {
        Self {
            store,
            runner,
            wake,
            wake_chats,
        }
    }

    pub async fn dispatch(&self, hook: WebhookEntry, payload: Map<String, Value>) {
        let error = match hook.mode {
            HookMode::Wake => self.dispatch_wake(&hook, &payload).await,
            HookMode::Task => self.dispatch_task(&hook).await,
        };
        if let Some(reason) = &error {
            warn!(hook = hook.id, reason, "webhook dispatch failed");
        }
        self.store.record_trigger(&hook.id, error);
    }

    async fn dispatch_wake(&self, hook: &WebhookEntry, payload: &Map<String, Value>) -> Option<String> {
        let rendered = template::render(&hook.template, payload);
        let text = template::wrap_untrusted(&rendered);
        for chat_id in &self.wake_chats {
            self.wake.deliver(*chat_id, text.clone()).await;
        }
        None
    }

    async fn dispatch_task(&self, hook: &WebhookEntry) -> Option<String> {
        let Some(task_folder) = hook.task_folder.clone() else {
            return Some("task_folder_not_set".into());
        };
        let spec = TaskSpec {
            title: hook.title.clone(),
            task_folder,
            instruction: hook.template.clone(),
            overrides: hook.overrides.clone(),
            quiet_hours: hook.quiet_hours,
            dependency_key: hook.dependency_key.clone(),
            timezone: None,
            label: format!("hook:{}", hook.id),
        };
        let outcome = self.runner.run(&spec).await;
        match outcome.status {
            TaskStatus::Success | TaskStatus::QuietSkipped => None,
            other => Some(other.code()),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<WebhookStore>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<HookDispatcher>,
    pub global_token: String,
}

pub struct WebhookServer {
    state: AppState,
    host: String,
    port: u16,
}

impl WebhookServer {
    pub fn new(config: &Config, state: AppState) -> Self {
        Self {
            state,
            host: config.webhook.host.clone(),
            port: config.webhook.port,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), CoreError> {
        let app = router(self.state);
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoreError::infra(format!("bind {addr}"), e))?;
        info!(addr, "webhook server listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| CoreError::infra("webhook server", e))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/hooks/:id", post(receive_hook))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// The validation chain, in its documented order. The first failing check
/// decides the status; nothing is dispatched on failure.
async fn receive_hook(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // 1. Rate limit per source.
    if !state.limiter.allow(addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS;
    }

    // 2. Content type.
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE;
    }

    // 3. Body must be a JSON object, not an array or scalar.
    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        _ => return StatusCode::BAD_REQUEST,
    };

    // 4. Hook exists.
    let Some(hook) = state.store.find(&id) else {
        return StatusCode::NOT_FOUND;
    };

    // 5. Hook enabled.
    if !hook.enabled {
        return StatusCode::FORBIDDEN;
    }

    // 6. Per-hook authentication.
    let authorized = match &hook.auth {
        HookAuth::Bearer { token } => {
            let authorization = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            auth::verify_bearer(authorization, token, &state.global_token)
        }
        HookAuth::Hmac { header, .. } => {
            let value = headers.get(header.as_str()).and_then(|v| v.to_str().ok());
            auth::verify_hmac(&hook.auth, value, &body)
        }
    };
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }

    // 7. Fire and forget; answer immediately.
    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        dispatcher.dispatch(hook, payload).await;
    });
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullWake;

    #[async_trait]
    impl WakeSink for NullWake {
        async fn deliver(&self, _chat_id: i64, _text: String) {}
    }

    /// A full AppState over a temp store; no network, handler called
    /// directly.
    fn test_state(dir: &std::path::Path, rate_limit: u32) -> AppState {
        let paths = Arc::new(crate::paths::WorkspacePaths::with_root(dir));
        let config = Arc::new(crate::config::Config::default());
        let registry = Arc::new(crate::process::ProcessRegistry::new());
        let cli = Arc::new(crate::cli::CliService::new(registry, &config.cli));
        let runner = Arc::new(crate::runner::TaskRunner::new(
            cli,
            config,
            paths,
            Arc::new(crate::runner::DependencyLocks::new()),
        ));
        let store = Arc::new(WebhookStore::new(dir.join("webhooks.json")));
        let dispatcher = Arc::new(HookDispatcher::new(
            Arc::clone(&store),
            runner,
            Arc::new(NullWake),
            vec![],
        ));
        AppState {
            store,
            limiter: Arc::new(RateLimiter::new(rate_limit)),
            dispatcher,
            global_token: "global-secret".into(),
        }
    }

    async fn post(
        state: &AppState,
        id: &str,
        content_type: Option<&str>,
        authorization: Option<&str>,
        body: &str,
    ) -> StatusCode {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(header::CONTENT_TYPE, ct.parse().unwrap());
        }
        if let Some(auth_header) = authorization {
            headers.insert(header::AUTHORIZATION, auth_header.parse().unwrap());
        }
        receive_hook(
            State(state.clone()),
            ConnectInfo("127.0.0.1:9999".parse().unwrap()),
            Path(id.to_string()),
            headers,
            Bytes::from(body.to_string()),
        )
        .await
    }

    #[tokio::test]
    async fn test_validation_chain_order() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 100);
        crate::store::save_json_atomic(
            &dir.path().join("webhooks.json"),
            &WebhookFile {
                hooks: vec![
                    WebhookEntry {
                        id: "on".into(),
                        ..Default::default()
                    },
                    WebhookEntry {
                        id: "off".into(),
                        enabled: false,
                        ..Default::default()
                    },
                ],
            },
        )
        .unwrap();

        // Content type is checked before hook lookup.
        let status = post(&state, "missing", Some("text/plain"), None, "{}").await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        // A JSON array fails parsing before lookup.
        let status = post(&state, "missing", Some("application/json"), None, "[1]").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Lookup before enabled, enabled before auth.
        let status = post(&state, "missing", Some("application/json"), None, "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let status = post(&state, "off", Some("application/json"), None, "{}").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let status = post(&state, "on", Some("application/json"), None, "{}").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Correct global bearer token is accepted.
        let status = post(
            &state,
            "on",
            Some("application/json"),
            Some("Bearer global-secret"),
            "{}",
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_rate_limit_is_checked_first() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), 1);

        // First request consumes the budget (and fails later checks).
        let status = post(&state, "x", None, None, "").await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        // Second request is refused before any other validation runs.
        let status = post(&state, "x", Some("application/json"), None, "{}").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_rate_limiter_sliding_window() {
        let limiter = RateLimiter::new(3);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
        // Other sources have their own window.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.allow(other));
    }

    #[test]
    fn test_entry_round_trip_with_hmac_auth() {
        let json = r#"{
            "id": "gh-push",
            "title": "GitHub push",
            "mode": "task",
            "template": "Summarize the push",
            "taskFolder": "gh-push",
            "auth": {
                "mode": "hmac",
                "secret": "s3cr3t",
                "header": "X-Hub-Signature-256",
                "signaturePrefix": "sha256="
            },
            "dependencyKey": "gh"
        }"#;
        let hook: WebhookEntry = serde_json::from_str(json).unwrap();
        assert_eq!(hook.mode, HookMode::Task);
        assert!(hook.enabled);
        assert_eq!(hook.task_folder.as_deref(), Some("gh-push"));
        match &hook.auth {
            HookAuth::Hmac {
                header,
                algorithm,
                encoding,
                signature_prefix,
                ..
            } => {
                assert_eq!(header, "X-Hub-Signature-256");
                assert_eq!(algorithm, "sha256");
                assert_eq!(encoding, "hex");
                assert_eq!(signature_prefix.as_deref(), Some("sha256="));
            }
            _ => panic!("expected hmac auth"),
        }

        // A hook without auth material defaults to bearer with an empty
        // token, which falls back to the global token at request time.
        let plain: WebhookEntry = serde_json::from_str(r#"{"id":"x","mode":"wake"}"#).unwrap();
        assert!(matches!(plain.auth, HookAuth::Bearer { .. }));
    }

    #[test]
    fn test_store_reload_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webhooks.json");
        let store = WebhookStore::new(path.clone());
        assert!(store.entries().is_empty());

        let file = WebhookFile {
            hooks: vec![WebhookEntry {
                id: "h1".into(),
                ..Default::default()
            }],
        };
        crate::store::save_json_atomic(&path, &file).unwrap();
        assert_eq!(store.entries().len(), 1);
        assert!(store.find("h1").is_some());
        assert!(store.find("h2").is_none());
    }

    #[test]
    fn test_record_trigger_updates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webhooks.json");
        let store = WebhookStore::new(path.clone());
        crate::store::save_json_atomic(
            &path,
            &WebhookFile {
                hooks: vec![WebhookEntry {
                    id: "h1".into(),
                    ..Default::default()
                }],
            },
        )
        .unwrap();

        store.record_trigger("h1", None);
        store.record_trigger("h1", Some("timeout".into()));

        let hook = store.find("h1").unwrap();
        assert_eq!(hook.trigger_count, 2);
        assert!(hook.last_triggered.is_some());
        assert_eq!(hook.last_error.as_deref(), Some("timeout"));
    }
}
