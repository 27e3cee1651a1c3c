use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by a [`crate::RunSource`]. Never retried by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("server error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Server { status: Option<u16>, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            status: None,
            message: message.into(),
        }
    }

    /// Text suitable for a row-level error badge.
    pub fn user_message(&self) -> String {
        match self {
            FetchError::Server { message, .. } if !message.trim().is_empty() => message.clone(),
            FetchError::NotFound(what) => format!("not found: {what}"),
            FetchError::Network(_) => "network unavailable".to_string(),
            _ => "audit request failed".to_string(),
        }
    }
}

/// Why an audit attempt ended in the error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AuditFailure {
    /// The trigger call itself was rejected.
    Server(String),
    /// No audit data arrived within the bound; synthesized locally.
    Timeout,
}

impl AuditFailure {
    pub fn message(&self) -> &str {
        match self {
            AuditFailure::Server(message) => message,
            AuditFailure::Timeout => crate::AUDIT_TIMEOUT_MESSAGE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AuditFailure::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new attempt was recorded and the trigger call was issued.
    Started,
    /// Rejected: an attempt for this row is already in flight.
    DuplicateSuppressed,
}
