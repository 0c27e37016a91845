//! Status registry keyed by request key

use std::collections::HashMap;

use tracing::debug;

use crate::domain::{RequestStatus, StatusRecord};
use crate::error::RequestError;

/// One status record per key, created lazily and overwritten on each transition
#[derive(Debug)]
pub struct StatusRegistry<T> {
    records: HashMap<String, StatusRecord<T>>,
}

impl<T> Default for StatusRegistry<T> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
        }
    }
}

impl<T: Clone> StatusRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for `key`, creating an idle one on first reference
    pub fn get(&mut self, key: &str) -> StatusRecord<T> {
        self.records.entry(key.to_string()).or_default().clone()
    }

    /// Status without creating a record
    pub fn status(&self, key: &str) -> RequestStatus {
        self.records.get(key).map(|r| r.status).unwrap_or_default()
    }

    pub fn mark_pending(&mut self, key: &str) {
        debug!(%key, "StatusRegistry::mark_pending: called");
        let previous = self.records.remove(key).unwrap_or_default();
        self.records.insert(
            key.to_string(),
            StatusRecord {
                status: RequestStatus::Pending,
                data: previous.data,
                error: None,
            },
        );
    }

    pub fn mark_success(&mut self, key: &str, data: T) {
        debug!(%key, "StatusRegistry::mark_success: called");
        self.records.insert(
            key.to_string(),
            StatusRecord {
                status: RequestStatus::Success,
                data: Some(data),
                error: None,
            },
        );
    }

    pub fn mark_error(&mut self, key: &str, error: RequestError) {
        debug!(%key, %error, "StatusRegistry::mark_error: called");
        let previous = self.records.remove(key).unwrap_or_default();
        self.records.insert(
            key.to_string(),
            StatusRecord {
                status: RequestStatus::Error,
                data: previous.data,
                error: Some(error),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
