//! Configuration module for relaybot.
//!
//! Loads typed configuration from `<root>/config/config.json`. On load the
//! user file is deep-merged with the packaged defaults at the **top level
//! only**: missing top-level keys are added silently, unknown keys are
//! preserved, and the file is written back only when keys were added.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::paths::WorkspacePaths;
use crate::store;
use crate::CoreError;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub defaults: DefaultsConfig,
    pub cli: CliConfig,
    pub heartbeat: HeartbeatConfig,
    pub webhook: WebhookServerConfig,
    pub cleanup: CleanupConfig,
    /// IANA timezone name; falls back to `TZ`, then the host zone, then UTC.
    pub timezone: Option<String>,
}

impl Config {
    /// Load from disk, merging packaged defaults at the top level.
    pub fn load(paths: &WorkspacePaths) -> Result<Self, CoreError> {
        let defaults = serde_json::to_value(Config::default())
            .map_err(|e| CoreError::Session(format!("serialize defaults: {e}")))?;

        let mut user: Value = store::load_json(&paths.config_file)?
            .unwrap_or_else(|| Value::Object(Default::default()));
        if !user.is_object() {
            return Err(CoreError::Session(format!(
                "{} is not a JSON object",
                paths.config_file.display()
            )));
        }

        let added = merge_top_level(&mut user, &defaults);
        if added {
            store::save_json_atomic(&paths.config_file, &user)?;
        }

        serde_json::from_value(user)
            .map_err(|e| CoreError::Session(format!("invalid config: {e}")))
    }

    /// Write the default config file if none exists. Returns whether a file
    /// was created.
    pub fn write_default_template(paths: &WorkspacePaths) -> Result<bool, CoreError> {
        if paths.config_file.exists() {
            return Ok(false);
        }
        store::save_json_atomic(&paths.config_file, &Config::default())?;
        Ok(true)
    }
}

/// Add defaults' top-level keys missing from `user`. Returns true if any
/// key was added. Nested objects are never merged: a user-provided section
/// wins whole-field.
fn merge_top_level(user: &mut Value, defaults: &Value) -> bool {
    let (Value::Object(user_map), Value::Object(default_map)) = (user, defaults) else {
        return false;
    };
    let mut added = false;
    for (key, value) in default_map {
        if !user_map.contains_key(key) {
            user_map.insert(key.clone(), value.clone());
            added = true;
        }
    }
    added
}

// ── Telegram ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelegramConfig {
    pub token: String,
    /// User-id allowlist. Updates from anyone else are dropped silently.
    pub allowed_user_ids: Vec<u64>,
    /// Single-word texts that abort the running call, exact match.
    pub abort_keywords: Vec<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            allowed_user_ids: Vec::new(),
            abort_keywords: vec!["stop".into(), "abort".into(), "cancel".into()],
        }
    }
}

// ── Execution defaults ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultsConfig {
    pub provider: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub permission_mode: String,
    pub extra_args: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            provider: "claude".into(),
            model: "sonnet".into(),
            reasoning_effort: None,
            max_turns: None,
            max_budget_usd: None,
            permission_mode: "acceptEdits".into(),
            extra_args: Vec::new(),
        }
    }
}

// ── CLI subprocess layer ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CliConfig {
    /// Wall-clock timeout for one provider call, in seconds.
    pub timeout_seconds: u64,
    pub claude_binary: String,
    pub codex_binary: String,
    /// Sessions older than this get a "consider /new" footer hint.
    pub session_age_hint_hours: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 900,
            claude_binary: "claude".into(),
            codex_binary: "codex".into(),
            session_age_hint_hours: 24,
        }
    }
}

// ── Heartbeat ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    /// Skip a chat if its last activity is within this window.
    pub cooldown_minutes: u64,
    /// Global quiet window, also the fallback for cron/webhook entries.
    pub quiet_start_hour: Option<u8>,
    pub quiet_end_hour: Option<u8>,
    /// Responses equal to (or starting with) this token are suppressed.
    pub ack_token: String,
    pub prompt: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 30,
            cooldown_minutes: 10,
            quiet_start_hour: None,
            quiet_end_hour: None,
            ack_token: "HEARTBEAT_OK".into(),
            prompt: "Heartbeat check-in. Review your task list and memory. \
                     If nothing needs the user's attention, reply with exactly HEARTBEAT_OK."
                .into(),
        }
    }
}

// ── Webhook server ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Fallback bearer token for hooks without one of their own.
    pub token: String,
    pub rate_limit_per_minute: u32,
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 18791,
            token: String::new(),
            rate_limit_per_minute: 30,
        }
    }
}

// ── Cleanup sweeper ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanupConfig {
    /// Local hour-of-day at which the daily sweep runs.
    pub check_hour: u8,
    pub telegram_files_retention_days: u64,
    pub output_retention_days: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            check_hour: 4,
            telegram_files_retention_days: 14,
            output_retention_days: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.defaults.provider, "claude");
        assert_eq!(config.defaults.model, "sonnet");
        assert_eq!(config.cli.timeout_seconds, 900);
        assert!(config.telegram.abort_keywords.contains(&"stop".into()));
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let json = r#"{"telegram": {"token": "123:abc", "allowedUserIds": [42]}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.telegram.token, "123:abc");
        assert_eq!(config.telegram.allowed_user_ids, vec![42]);
        // Untouched sections fall back to defaults.
        assert_eq!(config.webhook.port, 18791);
    }

    #[test]
    fn test_merge_adds_missing_top_level_keys_only() {
        let defaults = serde_json::to_value(Config::default()).unwrap();
        let mut user: Value = serde_json::from_str(
            r#"{"telegram": {"token": "t"}, "customSection": {"keep": true}}"#,
        )
        .unwrap();

        let added = merge_top_level(&mut user, &defaults);
        assert!(added);
        // The user's partial telegram section is NOT deep-merged away.
        assert_eq!(user["telegram"]["token"], "t");
        assert!(user["telegram"].get("allowedUserIds").is_none());
        // Unknown keys survive.
        assert_eq!(user["customSection"]["keep"], true);
        // Missing sections were added.
        assert!(user.get("heartbeat").is_some());

        // Second merge is a no-op.
        assert!(!merge_top_level(&mut user, &defaults));
    }

    #[test]
    fn test_load_writes_back_only_when_keys_added() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::with_root(dir.path());

        std::fs::create_dir_all(&paths.config_dir).unwrap();
        std::fs::write(&paths.config_file, r#"{"telegram": {"token": "t"}}"#).unwrap();

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.telegram.token, "t");

        // File now contains all top-level sections.
        let merged: Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.config_file).unwrap()).unwrap();
        assert!(merged.get("cleanup").is_some());

        // A complete file is left untouched.
        let before = std::fs::metadata(&paths.config_file).unwrap().modified().unwrap();
        let _ = Config::load(&paths).unwrap();
        let after = std::fs::metadata(&paths.config_file).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}
