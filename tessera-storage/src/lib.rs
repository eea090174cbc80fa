//! Tessera Storage - Dual Store, Routing, Embedding and Invalidation
//!
//! The transactional Write Store holds canonical entity state; the Read Store
//! holds denormalized cached views derived from it. Everything in between
//! lives here:
//!
//! - [`SequenceAllocator`]: globally ordered sids
//! - [`WriteStore`] / [`InMemoryWriteStore`]: property sheets, current-sid
//!   pointers, link edges and unique keys, written atomically
//! - [`ReadStore`] / [`InMemoryReadStore`] / [`LmdbReadStore`]: cached views
//!   plus the forward-dependency index
//! - [`StorageRouter`]: picks a store per operation
//! - [`EmbeddingResolver`]: builds views and their dependency sets
//! - [`InvalidationScope`]: decides which dependents a change reaches
//! - [`StalenessChecker`]: compares views with the Write Store

pub mod embed;
pub mod invalidation;
pub mod read_store;
pub mod router;
pub mod sequence;
pub mod staleness;
pub mod write_store;

pub use embed::{EmbeddingResolver, ResolveCache, Resolution};
pub use invalidation::InvalidationScope;
pub use read_store::{
    InMemoryReadStore, LmdbReadError, LmdbReadStore, ReadStore, ReadStoreStats,
};
pub use router::{Fetched, StorageRouter, StoreOp};
pub use sequence::SequenceAllocator;
pub use staleness::{StalenessChecker, StalenessReport};
pub use write_store::{InMemoryWriteStore, WriteStore};
