//! Read Store - denormalized cached views
//!
//! One document per uuid plus an inverted index from every linked uuid to
//! the views that embed it. The store never rebuilds anything itself: views
//! arrive whole from the embedding resolver and replace what was there.
//!
//! # Backends
//!
//! - [`InMemoryReadStore`]: process-local, with outage and failure injection
//!   for exercising the retry path
//! - [`LmdbReadStore`]: memory-mapped and durable, via `heed`

mod lmdb_backend;
mod memory;

pub use lmdb_backend::{LmdbReadError, LmdbReadStore};
pub use memory::InMemoryReadStore;

use async_trait::async_trait;
use std::collections::HashMap;
use tessera_core::{CachedView, EntityKey, ItemType, Sid, TesseraResult};
use uuid::Uuid;

/// Document store holding one cached view per entity.
#[async_trait]
pub trait ReadStore: Send + Sync {
    /// Overwrite the view for `view.uuid`. Idempotent.
    async fn put_view(&self, view: CachedView) -> TesseraResult<()>;

    /// Fails with `NotFound` if the uuid was never indexed.
    async fn get_view(&self, uuid: Uuid) -> TesseraResult<CachedView>;

    /// Remove a view. Returns whether one existed.
    async fn delete_view(&self, uuid: Uuid) -> TesseraResult<bool>;

    /// Highest `max_sid` across stored views, or 0 when empty.
    async fn get_max_sid(&self) -> TesseraResult<Sid>;

    /// Views whose `linked_uuids` contain `uuid`.
    async fn find_dependents(&self, uuid: Uuid) -> TesseraResult<Vec<EntityKey>>;

    /// Stored view sids for the given uuids; unindexed uuids are omitted.
    async fn view_sids(&self, uuids: &[Uuid]) -> TesseraResult<HashMap<Uuid, Sid>>;

    /// Number of stored views of one type.
    async fn count(&self, item_type: &ItemType) -> TesseraResult<usize>;

    fn stats(&self) -> ReadStoreStats;

    fn is_available(&self) -> bool {
        true
    }
}

/// Read Store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStoreStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub deletes: u64,
    pub view_count: u64,
}

impl ReadStoreStats {
    /// Fraction of `get_view` calls that found a view.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
