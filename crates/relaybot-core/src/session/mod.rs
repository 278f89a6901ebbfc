//! Provider-isolated session store.
//!
//! One envelope per chat, one bucket per provider inside it. Switching
//! providers never erases another provider's bucket, and counters never
//! regress: the store is single-writer (only the orchestrator mutates it,
//! loaded once at startup) and every mutation is an increment or an
//! explicit bucket clear. The whole map is persisted to `sessions.json`
//! with an atomic replace after every mutation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::paths::WorkspacePaths;
use crate::store;
use crate::CoreError;

/// Provider-local record: the opaque resume id plus accumulated metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderBucket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message_count: u64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
}

/// Per-chat session envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionEnvelope {
    pub active_provider: String,
    pub active_model: String,
    pub providers: HashMap<String, ProviderBucket>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Default for SessionEnvelope {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            active_provider: String::new(),
            active_model: String::new(),
            providers: HashMap::new(),
            created_at: now,
            last_active: now,
        }
    }
}

impl SessionEnvelope {
    pub fn bucket(&self, provider: &str) -> Option<&ProviderBucket> {
        self.providers.get(provider)
    }

    pub fn bucket_mut(&mut self, provider: &str) -> &mut ProviderBucket {
        self.providers.entry(provider.to_string()).or_default()
    }
}

/// Single-writer session store. Only the orchestrator mutates it.
pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<HashMap<i64, SessionEnvelope>>,
}

impl SessionStore {
    /// Load the store, tolerating a missing file.
    pub fn load(paths: &WorkspacePaths) -> Result<Self, CoreError> {
        let raw: Option<BTreeMap<String, SessionEnvelope>> =
            match store::load_json(&paths.sessions_file) {
                Ok(v) => v,
                Err(e) => {
                    // A corrupt sessions file must not brick the bot.
                    warn!(error = %e, "sessions.json unreadable, starting empty");
                    None
                }
            };

        let mut map = HashMap::new();
        for (key, envelope) in raw.unwrap_or_default() {
            match key.parse::<i64>() {
                Ok(chat_id) => {
                    map.insert(chat_id, envelope);
                }
                Err(_) => warn!(key, "skipping session with non-numeric chat id"),
            }
        }

        Ok(Self {
            path: paths.sessions_file.clone(),
            inner: Mutex::new(map),
        })
    }

    /// Snapshot of one chat's envelope.
    pub async fn get(&self, chat_id: i64) -> Option<SessionEnvelope> {
        self.inner.lock().await.get(&chat_id).cloned()
    }

    /// Mutate one chat's envelope (created lazily) and persist atomically.
    /// A persistence failure aborts the in-memory change.
    pub async fn update<F, R>(&self, chat_id: i64, mutate: F) -> Result<R, CoreError>
    where
        F: FnOnce(&mut SessionEnvelope) -> R,
    {
        let mut map = self.inner.lock().await;
        let mut envelope = map.get(&chat_id).cloned().unwrap_or_default();
        let result = mutate(&mut envelope);
        envelope.last_active = Utc::now();

        let mut next = map.clone();
        next.insert(chat_id, envelope);
        Self::persist(&self.path, &next)?;
        *map = next;
        Ok(result)
    }

    /// Record a completed call against one provider bucket.
    pub async fn record_usage(
        &self,
        chat_id: i64,
        provider: &str,
        session_id: Option<String>,
        cost_usd: f64,
        tokens: u64,
    ) -> Result<ProviderBucket, CoreError> {
        self.update(chat_id, |envelope| {
            let bucket = envelope.bucket_mut(provider);
            if session_id.is_some() {
                bucket.session_id = session_id;
            }
            bucket.message_count += 1;
            bucket.total_cost_usd += cost_usd;
            bucket.total_tokens += tokens;
            bucket.clone()
        })
        .await
    }

    /// Clear one provider's bucket. Used by `/new` and failed-resume recovery.
    pub async fn clear_bucket(&self, chat_id: i64, provider: &str) -> Result<(), CoreError> {
        self.update(chat_id, |envelope| {
            envelope.providers.insert(provider.to_string(), ProviderBucket::default());
        })
        .await
    }

    /// All chat ids with stored sessions.
    pub async fn chat_ids(&self) -> Vec<i64> {
        self.inner.lock().await.keys().copied().collect()
    }

    fn persist(path: &PathBuf, map: &HashMap<i64, SessionEnvelope>) -> Result<(), CoreError> {
        let serializable: BTreeMap<String, &SessionEnvelope> =
            map.iter().map(|(k, v)| (k.to_string(), v)).collect();
        store::save_json_atomic(path, &serializable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> SessionStore {
        let paths = WorkspacePaths::with_root(dir);
        SessionStore::load(&paths).unwrap()
    }

    #[tokio::test]
    async fn test_provider_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let s = store_in(dir.path());

        s.record_usage(1, "claude", Some("c-1".into()), 0.10, 500).await.unwrap();
        s.record_usage(1, "codex", Some("o-1".into()), 0.02, 100).await.unwrap();
        s.record_usage(1, "claude", None, 0.05, 200).await.unwrap();

        let env = s.get(1).await.unwrap();
        let claude = env.bucket("claude").unwrap();
        let codex = env.bucket("codex").unwrap();

        assert_eq!(claude.session_id.as_deref(), Some("c-1"));
        assert_eq!(claude.message_count, 2);
        assert_eq!(claude.total_tokens, 700);
        // Untouched by claude traffic.
        assert_eq!(codex.session_id.as_deref(), Some("o-1"));
        assert_eq!(codex.message_count, 1);
    }

    #[tokio::test]
    async fn test_clear_bucket_leaves_others() {
        let dir = tempfile::tempdir().unwrap();
        let s = store_in(dir.path());

        s.record_usage(7, "claude", Some("c".into()), 0.0, 0).await.unwrap();
        s.record_usage(7, "codex", Some("o".into()), 0.0, 0).await.unwrap();
        s.clear_bucket(7, "claude").await.unwrap();

        let env = s.get(7).await.unwrap();
        assert!(env.bucket("claude").unwrap().session_id.is_none());
        assert_eq!(env.bucket("codex").unwrap().session_id.as_deref(), Some("o"));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = store_in(dir.path());
            s.update(42, |e| {
                e.active_provider = "claude".into();
                e.active_model = "sonnet".into();
            })
            .await
            .unwrap();
            s.record_usage(42, "claude", Some("sid".into()), 1.5, 9000).await.unwrap();
        }

        let s = store_in(dir.path());
        let env = s.get(42).await.unwrap();
        assert_eq!(env.active_provider, "claude");
        assert_eq!(env.bucket("claude").unwrap().total_tokens, 9000);
    }
}
