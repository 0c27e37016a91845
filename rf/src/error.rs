//! Request error types

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced to callers of the scheduler
///
/// Cloneable so the same failure can be handed to the caller and kept in the
/// status registry.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("Request key must not be empty")]
    InvalidKey,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Request '{key}' failed: {error}")]
    Execution { key: String, error: Arc<eyre::Report> },

    #[error("Request '{key}' was cancelled before it started")]
    Cancelled { key: String },

    #[error("No recorded request for '{key}'")]
    NotFound { key: String },

    #[error("Request '{key}' was dropped before it settled")]
    Dropped { key: String },
}

impl RequestError {
    /// Wrap an operation failure for `key`
    pub fn execution(key: impl Into<String>, error: eyre::Report) -> Self {
        Self::Execution {
            key: key.into(),
            error: Arc::new(error),
        }
    }

    /// Check if this is a queue-level cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled { .. })
    }

    /// Check if the operation itself failed
    pub fn is_execution(&self) -> bool {
        matches!(self, RequestError::Execution { .. })
    }

    /// The operation's own error, untouched, if this is an execution failure
    pub fn report(&self) -> Option<&eyre::Report> {
        match self {
            RequestError::Execution { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }

    /// The request key this error belongs to, when there is one
    pub fn key(&self) -> Option<&str> {
        match self {
            RequestError::Execution { key, .. }
            | RequestError::Cancelled { key }
            | RequestError::NotFound { key }
            | RequestError::Dropped { key } => Some(key),
            RequestError::InvalidKey | RequestError::InvalidConfig(_) => None,
        }
    }
}
