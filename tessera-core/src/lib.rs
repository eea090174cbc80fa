//! Tessera Core - Entity, View and Registry Types
//!
//! Pure data structures shared by the storage and indexer crates. This crate
//! owns the vocabulary of the system (sids, entity records, link edges,
//! cached views, queue messages, the type registry) and the error taxonomy,
//! but performs no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

mod config;
mod entity;
mod error;
mod message;
mod registry;
mod view;

pub use config::*;
pub use entity::*;
pub use error::*;
pub use message::*;
pub use registry::*;
pub use view::*;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Write version stamp. Allocated once per write, globally ordered.
pub type Sid = i64;

/// Entity identifier. New entities use UUIDv7 so ids sort by creation time.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Property map of a single property sheet.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Name of the unnamed default property sheet.
pub const DEFAULT_SHEET: &str = "";

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}
