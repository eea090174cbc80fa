//! Propagation queue messages

use crate::{EntityKey, ItemType, Sid, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The three propagation lanes, in the order workers drain them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueLane {
    /// Entities whose own properties changed.
    Primary,
    /// Dependents that only need re-embedding.
    Secondary,
    /// Failed attempts waiting for their backoff to elapse.
    Deferred,
}

impl QueueLane {
    pub const ALL: [QueueLane; 3] = [QueueLane::Primary, QueueLane::Secondary, QueueLane::Deferred];
}

impl fmt::Display for QueueLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueLane::Primary => "primary",
            QueueLane::Secondary => "secondary",
            QueueLane::Deferred => "deferred",
        };
        f.write_str(name)
    }
}

/// One unit of indexing work as carried on a lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMessage {
    pub item_type: ItemType,
    pub uuid: Uuid,
    /// Sid of the write that produced this message, when known.
    pub sid: Option<Sid>,
    /// When set, the worker rebuilds this view only and never fans out.
    pub strict: bool,
    /// Changed fields as `"ItemType.field"`; `None` means unknown.
    pub diff: Option<Vec<String>>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Correlates messages produced by one caller action (e.g. a reindex run).
    pub telemetry_id: Option<String>,
    pub timestamp: Timestamp,
}

impl IndexMessage {
    /// A message for an entity whose own state changed.
    pub fn primary(key: EntityKey, sid: Option<Sid>, diff: Option<Vec<String>>) -> Self {
        Self {
            item_type: key.item_type,
            uuid: key.uuid,
            sid,
            strict: false,
            diff,
            attempts: 0,
            telemetry_id: None,
            timestamp: Utc::now(),
        }
    }

    /// A rebuild-only message for a dependent. Secondary work is always strict.
    pub fn secondary(key: EntityKey, sid: Option<Sid>) -> Self {
        Self {
            item_type: key.item_type,
            uuid: key.uuid,
            sid,
            strict: true,
            diff: None,
            attempts: 0,
            telemetry_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_telemetry_id(mut self, telemetry_id: impl Into<String>) -> Self {
        self.telemetry_id = Some(telemetry_id.into());
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.item_type.clone(), self.uuid)
    }
}
