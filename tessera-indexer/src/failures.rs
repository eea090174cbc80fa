//! Operator-visible report of items whose retry budget ran out.

use serde::Serialize;
use std::sync::Mutex;
use tessera_core::{IndexError, IndexMessage, StorageError, TesseraResult, Timestamp};
use uuid::Uuid;

/// One item that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermanentFailure {
    /// The message as last attempted, `attempts` included.
    pub message: IndexMessage,
    pub error: IndexError,
    pub failed_at: Timestamp,
}

impl PermanentFailure {
    pub fn uuid(&self) -> Uuid {
        self.message.uuid
    }
}

/// Permanent failures, one entry per uuid, oldest first.
///
/// A uuid that fails again replaces its earlier entry. Entries stay until an
/// operator requeues them.
#[derive(Debug, Default)]
pub struct FailureReport {
    entries: Mutex<Vec<PermanentFailure>>,
}

impl FailureReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: IndexMessage, reason: impl Into<String>) -> TesseraResult<PermanentFailure> {
        let failure = PermanentFailure {
            error: IndexError::Permanent {
                uuid: message.uuid,
                attempts: message.attempts,
                reason: reason.into(),
            },
            message,
            failed_at: chrono::Utc::now(),
        };
        let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        entries.retain(|entry| entry.uuid() != failure.uuid());
        entries.push(failure.clone());
        Ok(failure)
    }

    pub fn entries(&self) -> Vec<PermanentFailure> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.iter().any(|entry| entry.uuid() == uuid))
            .unwrap_or(false)
    }

    /// Remove and return every entry.
    pub fn take(&self) -> TesseraResult<Vec<PermanentFailure>> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(std::mem::take(&mut *entries))
    }
}
