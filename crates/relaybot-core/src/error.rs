//! Typed error taxonomy for the core.
//!
//! Every failure the core can produce is one of these kinds. The chat
//! pipeline catches them at the orchestrator boundary and converts them to a
//! generic user-visible reply; observers log them and keep their loop alive.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Subprocess spawn failure, abnormal exit, or result-JSON parse failure.
    #[error("CLI error: {message}")]
    Cli {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The provider binary is not installed.
    #[error("{provider} binary not found")]
    CliNotFound { provider: String },

    /// The provider exited abnormally without usable output.
    #[error("CLI exited with code {code}")]
    CliExit { code: i32 },

    /// The per-call wall-clock timeout expired.
    #[error("CLI call timed out after {0:?}")]
    CliTimeout(Duration),

    /// Corrupt session JSON or a persistence failure.
    #[error("session error: {0}")]
    Session(String),

    /// Bad schedule expression, missing task folder, or lock failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Premature end-of-stream or a missing result event.
    #[error("stream error: {0}")]
    Stream(String),

    /// Path traversal or control characters in a path.
    #[error("security error: {0}")]
    Security(String),

    /// Template render failure or dispatch exception. Validation failures
    /// map straight to HTTP codes in the webhook server and never use this.
    #[error("webhook error: {0}")]
    Webhook(String),

    /// PID lock collision or atomic-write failure.
    #[error("infrastructure error: {message}")]
    Infra {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl CoreError {
    pub fn cli(message: impl Into<String>) -> Self {
        Self::Cli {
            message: message.into(),
            source: None,
        }
    }

    pub fn cli_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Cli {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn infra(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Infra {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn infra_msg(message: impl Into<String>) -> Self {
        Self::Infra {
            message: message.into(),
            source: None,
        }
    }

    /// Short operation tag used when logging at the orchestrator boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cli { .. } => "cli",
            Self::CliNotFound { .. } => "cli_not_found",
            Self::CliExit { .. } => "cli_exit",
            Self::CliTimeout(_) => "cli_timeout",
            Self::Session(_) => "session",
            Self::Scheduler(_) => "scheduler",
            Self::Stream(_) => "stream",
            Self::Security(_) => "security",
            Self::Webhook(_) => "webhook",
            Self::Infra { .. } => "infra",
        }
    }
}
