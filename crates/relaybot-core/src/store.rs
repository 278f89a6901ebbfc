//! Atomic JSON persistence helpers.
//!
//! All persisted state (sessions, cron jobs, webhooks, config) goes through
//! these two functions so a crash mid-write leaves either the old file
//! intact or the new file fully written. External edits by the workspace
//! helper tools are picked up by observers polling [`file_mtime`].

use std::path::Path;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CoreError;

/// Load a JSON file, returning `None` when it does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| CoreError::infra(format!("read {}", path.display()), e))?;
    let value = serde_json::from_str(&content)
        .map_err(|e| CoreError::Session(format!("corrupt JSON in {}: {e}", path.display())))?;
    Ok(Some(value))
}

/// Write a JSON file atomically: temp file in the same directory, then rename.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| CoreError::infra(format!("create {}", parent.display()), e))?;

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::Session(format!("serialize {}: {e}", path.display())))?;

    let tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| CoreError::infra("create temp file", e))?;
    std::fs::write(tmp.path(), json.as_bytes())
        .map_err(|e| CoreError::infra("write temp file", e))?;
    tmp.persist(path)
        .map_err(|e| CoreError::infra(format!("rename into {}", path.display()), e.error))?;
    Ok(())
}

/// Modification time of a file, if it exists.
pub fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
