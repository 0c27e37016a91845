//! Request lifecycle status

use serde::{Deserialize, Serialize};

use crate::error::RequestError;

/// Lifecycle state of a request key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Current status of a key
///
/// `data` is the last successful result and survives later Pending and Error
/// transitions. `error` is only set while the status is `Error`.
#[derive(Debug, Clone)]
pub struct StatusRecord<T> {
    pub status: RequestStatus,
    pub data: Option<T>,
    pub error: Option<RequestError>,
}

impl<T> Default for StatusRecord<T> {
    fn default() -> Self {
        Self {
            status: RequestStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl<T> StatusRecord<T> {
    pub fn is_idle(&self) -> bool {
        self.status == RequestStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == RequestStatus::Error
    }
}
