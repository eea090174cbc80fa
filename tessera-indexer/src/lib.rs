//! Tessera Indexer - Propagation Pipeline
//!
//! Keeps the Read Store consistent with the Write Store after writes:
//!
//! - [`IndexQueue`] / [`InMemoryIndexQueue`]: primary, secondary and deferred
//!   lanes with visibility-timeout delivery
//! - [`Indexer`]: one resolve+write cycle per delivery, fan-out to
//!   dependents, retries and permanent failures
//! - [`WorkerPool`]: background workers draining the queue
//! - [`Tessera`]: the caller-facing service (`put`, `get`, `purge`,
//!   `reindex`, `index_diff`)
//!
//! # Example
//!
//! ```ignore
//! let tessera = Tessera::open(TesseraConfig::default(), registry)?;
//! let pool = tessera.start_workers();
//! let sid = tessera.put(uuid, "Experiment", properties, None).await?;
//! let fetched = tessera.get(uuid, None).await?;
//! pool.shutdown().await;
//! ```

pub mod failures;
pub mod pool;
pub mod queue;
pub mod service;
pub mod telemetry;
pub mod worker;

pub use failures::{FailureReport, PermanentFailure};
pub use pool::WorkerPool;
pub use queue::{Delivery, InMemoryIndexQueue, IndexQueue, LaneStatus, QueueStatus};
pub use service::{ReindexOptions, ReindexReport, Tessera, TypeReindex};
pub use telemetry::init_tracing;
pub use worker::{Indexer, IndexerMetrics, IndexerSnapshot, Outcome};
