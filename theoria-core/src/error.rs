//! Error types for theoria-core.
//!
//! Structural defects found in a document are not errors; they are returned as
//! data by [`crate::latex::analyze`]. Only the variants below abort an
//! operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using theoria-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a completion call failed in a way worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// Connection refused, reset, DNS, 5xx
    Network,
    /// Request exceeded its deadline
    Timeout,
    /// Provider quota or rate limit; optional server hint in seconds
    RateLimit { retry_after_secs: Option<f64> },
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimit {
                retry_after_secs: Some(secs),
            } => write!(f, "rate limit (retry after {secs:.1}s)"),
            Self::RateLimit {
                retry_after_secs: None,
            } => write!(f, "rate limit"),
        }
    }
}

/// Errors that can occur during theoria operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Document nesting exceeded the configured ceiling
    #[error("Nesting depth limit {limit} exceeded at offset {offset}")]
    ParseLimitExceeded { limit: usize, offset: usize },

    /// Completion capability temporarily unavailable
    #[error("Completion temporarily unavailable ({kind}): {message}")]
    TransientCapability { kind: TransientKind, message: String },

    /// Completion returned content that could not fill the required state fields
    #[error("Malformed completion output in phase '{phase}': {message}")]
    MalformedOutput { phase: String, message: String },

    /// Phase table references an undeclared phase
    #[error("Invalid transition from '{from}' to undeclared phase '{to}'")]
    InvalidTransition { from: String, to: String },

    /// Non-retryable provider failure
    #[error("Completion provider error: {provider} - {message}")]
    Capability { provider: String, message: String },

    /// Edit operations overlap or fall outside the document
    #[error("Edit conflict: {0}")]
    EditConflict(String),

    /// Session storage error
    #[error("Session storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a parse limit error.
    pub fn parse_limit(limit: usize, offset: usize) -> Self {
        Self::ParseLimitExceeded { limit, offset }
    }

    /// Create a transient capability error.
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::TransientCapability {
            kind,
            message: message.into(),
        }
    }

    /// Create a malformed output error.
    pub fn malformed_output(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a provider error.
    pub fn capability(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capability {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientCapability { .. })
    }

    /// Server-suggested wait before retrying, if any.
    pub fn retry_after_secs(&self) -> Option<f64> {
        match self {
            Self::TransientCapability {
                kind: TransientKind::RateLimit { retry_after_secs },
                ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// Whether the error is fatal at the analysis or table-construction level.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ParseLimitExceeded { .. } | Self::InvalidTransition { .. }
        )
    }

    /// A message suitable for showing to the person in the session.
    pub fn user_message(&self) -> String {
        match self {
            Self::TransientCapability { kind, .. } => match kind {
                TransientKind::RateLimit {
                    retry_after_secs: Some(secs),
                } => format!("Rate limit exceeded. Try again in {secs:.0} seconds."),
                TransientKind::RateLimit { .. } => {
                    "Rate limit exceeded. Please wait a moment and try again.".to_string()
                }
                _ => "Network error. Check your connection and try again.".to_string(),
            },
            Self::MalformedOutput { message, .. } => format!(
                "The response could not be understood ({message}). Please clarify or retry."
            ),
            other => other.to_string(),
        }
    }
}
