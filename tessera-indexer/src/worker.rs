//! Indexer - one worker's processing of queue deliveries
//!
//! Per item: `Queued(lane) -> InProgress -> Done | Queued(deferred)`.
//!
//! One resolve+write cycle:
//!
//! 1. A message whose sid is newer than the batch watermark snapshot cannot
//!    be served yet; it fails the cycle and is deferred like any other error.
//! 2. Resolve the embedded view. A uuid missing from the Write Store was
//!    purged: drop its cached view and finish.
//! 3. Leave a stored view with a higher sid alone (version conflict, counts
//!    as success); otherwise overwrite it.
//! 4. For non-strict messages, compute the invalidation scope plus the link
//!    targets whose reverse links changed, and enqueue them on the secondary
//!    lane.
//!
//! The cycle runs under `operation_timeout`. Any error or timeout defers the
//! item with exponential backoff; once `max_attempts` is reached it goes to
//! the [`FailureReport`] instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{
    IndexError, IndexMessage, PipelineConfig, QueueLane, Sid, StorageError, TesseraError,
    TesseraResult,
};
use tessera_storage::{
    EmbeddingResolver, InvalidationScope, ReadStore, ResolveCache, WriteStore,
};

use crate::failures::FailureReport;
use crate::queue::{Delivery, IndexQueue};

// ============================================================================
// METRICS
// ============================================================================

/// Pipeline counters, shared by every worker of one indexer.
#[derive(Debug, Default)]
pub struct IndexerMetrics {
    /// Deliveries handled, whatever the outcome
    pub processed: AtomicU64,
    /// Views written
    pub indexed: AtomicU64,
    /// Rebuilds not written because a newer view was already stored
    pub version_conflicts: AtomicU64,
    /// Views removed because their entity was purged
    pub removed: AtomicU64,
    pub deferred: AtomicU64,
    pub timeouts: AtomicU64,
    /// Items moved to the failure report
    pub failed: AtomicU64,
    pub secondary_queued: AtomicU64,
    pub batches: AtomicU64,
    /// Queue or store errors outside a single item's cycle
    pub errors: AtomicU64,
}

impl IndexerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> IndexerSnapshot {
        IndexerSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            secondary_queued: self.secondary_queued.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct IndexerSnapshot {
    pub processed: u64,
    pub indexed: u64,
    pub version_conflicts: u64,
    pub removed: u64,
    pub deferred: u64,
    pub timeouts: u64,
    pub failed: u64,
    pub secondary_queued: u64,
    pub batches: u64,
    pub errors: u64,
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Indexed { sid: Sid, secondaries: usize },
    /// A view with a newer sid was already stored.
    VersionConflict { stored_sid: Sid, sid: Sid },
    /// The entity no longer exists; its view (if any) was dropped.
    Removed,
    Deferred { attempts: u32, delay: Duration },
    Failed { attempts: u32 },
}

// ============================================================================
// INDEXER
// ============================================================================

/// Consumes deliveries and rebuilds cached views.
pub struct Indexer {
    write: Arc<dyn WriteStore>,
    read: Arc<dyn ReadStore>,
    queue: Arc<dyn IndexQueue>,
    resolver: EmbeddingResolver,
    scope: InvalidationScope,
    config: PipelineConfig,
    failures: Arc<FailureReport>,
    metrics: Arc<IndexerMetrics>,
}

impl Indexer {
    pub fn new(
        write: Arc<dyn WriteStore>,
        read: Arc<dyn ReadStore>,
        queue: Arc<dyn IndexQueue>,
        resolver: EmbeddingResolver,
        scope: InvalidationScope,
        config: PipelineConfig,
    ) -> Self {
        Self {
            write,
            read,
            queue,
            resolver,
            scope,
            config,
            failures: Arc::new(FailureReport::new()),
            metrics: Arc::new(IndexerMetrics::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn IndexQueue> {
        &self.queue
    }

    pub fn failures(&self) -> &Arc<FailureReport> {
        &self.failures
    }

    pub fn metrics(&self) -> &Arc<IndexerMetrics> {
        &self.metrics
    }

    /// Receive and process up to `batch_size` deliveries.
    ///
    /// Returns the number of deliveries handled; 0 means nothing was
    /// visible. The resolve cache and the watermark snapshot live for this
    /// one batch.
    pub async fn process_batch(&self) -> TesseraResult<usize> {
        let deliveries = self.queue.receive(self.config.batch_size).await?;
        if deliveries.is_empty() {
            return Ok(0);
        }
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);

        // Taken before anything is resolved, so every view built in this
        // batch claims a watermark no newer than the data it read.
        let snapshot = self.write.max_sid().await?;
        let mut cache = ResolveCache::new();
        let count = deliveries.len();
        for delivery in deliveries {
            self.process(delivery, snapshot, &mut cache).await?;
        }
        tracing::trace!(count, snapshot, cached = cache.len(), "Processed batch");
        Ok(count)
    }

    /// Process batches until none is visible. Returns deliveries handled.
    pub async fn run_until_idle(&self) -> TesseraResult<usize> {
        let mut total = 0;
        loop {
            let handled = self.process_batch().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }

    /// Run one delivery to completion and ack it.
    ///
    /// Only queue failures are returned as errors; everything that goes wrong
    /// inside the cycle becomes a deferral or a permanent failure.
    pub async fn process(
        &self,
        delivery: Delivery,
        snapshot: Sid,
        cache: &mut ResolveCache,
    ) -> TesseraResult<Outcome> {
        let Delivery {
            receipt,
            lane,
            message,
        } = delivery;
        let started = Instant::now();
        let cycle = tokio::time::timeout(
            self.config.operation_timeout,
            self.rebuild(&message, snapshot, cache),
        )
        .await;

        let outcome = match cycle {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.defer(message.clone(), e.to_string()).await?,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                let error = IndexError::Timeout {
                    uuid: message.uuid,
                    elapsed_ms,
                };
                self.defer(message.clone(), error.to_string()).await?
            }
        };

        self.queue.ack(receipt).await?;
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            uuid = %message.uuid,
            item_type = %message.item_type,
            lane = %lane,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processed delivery"
        );
        Ok(outcome)
    }

    async fn rebuild(
        &self,
        message: &IndexMessage,
        snapshot: Sid,
        cache: &mut ResolveCache,
    ) -> TesseraResult<Outcome> {
        if let Some(sid) = message.sid.filter(|sid| *sid > snapshot) {
            return Err(IndexError::Transient {
                uuid: message.uuid,
                reason: format!("sid {} is ahead of watermark {}", sid, snapshot),
            }
            .into());
        }

        let resolution = match self.resolver.resolve(message.uuid, cache).await {
            Ok(resolution) => resolution,
            Err(TesseraError::Storage(StorageError::NotFound { .. })) => {
                let existed = self.read.delete_view(message.uuid).await?;
                tracing::warn!(
                    uuid = %message.uuid,
                    view_removed = existed,
                    "Entity missing from write store, dropping cached view"
                );
                self.metrics.removed.fetch_add(1, Ordering::Relaxed);
                return Ok(Outcome::Removed);
            }
            Err(e) => return Err(e),
        };
        let record = (!message.strict).then(|| resolution.record.clone());
        let view = resolution.into_view(snapshot);

        let stored = self.read.view_sids(&[message.uuid]).await?;
        let stored_sid = stored.get(&message.uuid).copied();
        if let Some(stored_sid) = stored_sid {
            if stored_sid > view.sid {
                tracing::debug!(
                    uuid = %message.uuid,
                    stored_sid,
                    sid = view.sid,
                    "Newer view already stored, skipping write"
                );
                self.metrics.version_conflicts.fetch_add(1, Ordering::Relaxed);
                return Ok(Outcome::VersionConflict {
                    stored_sid,
                    sid: view.sid,
                });
            }
        }

        let sid = view.sid;
        let fingerprint = view.fingerprint();
        self.read.put_view(view).await?;
        self.metrics.indexed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(uuid = %message.uuid, sid, fingerprint = %fingerprint, "Wrote cached view");

        let mut secondaries = 0;
        if let Some(record) = record {
            let mut dependents = self.scope.scope(message.uuid, message.diff.as_deref()).await?;
            dependents.extend(self.scope.link_targets(&record, stored_sid).await?);
            if !dependents.is_empty() {
                let messages: Vec<IndexMessage> = dependents
                    .into_iter()
                    .map(|key| {
                        let secondary = IndexMessage::secondary(key, Some(sid));
                        match &message.telemetry_id {
                            Some(id) => secondary.with_telemetry_id(id.clone()),
                            None => secondary,
                        }
                    })
                    .collect();
                secondaries = self.queue.send(QueueLane::Secondary, messages).await?;
                self.metrics
                    .secondary_queued
                    .fetch_add(secondaries as u64, Ordering::Relaxed);
            }
        }
        Ok(Outcome::Indexed { sid, secondaries })
    }

    async fn defer(&self, mut message: IndexMessage, reason: String) -> TesseraResult<Outcome> {
        message.attempts += 1;
        let attempts = message.attempts;
        if attempts >= self.config.retry.max_attempts {
            tracing::error!(
                uuid = %message.uuid,
                item_type = %message.item_type,
                attempts,
                reason = %reason,
                "Retry budget exhausted, reporting permanent failure"
            );
            self.failures.record(message, reason)?;
            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::Failed { attempts });
        }

        let delay = self.config.retry.backoff_for(attempts);
        tracing::warn!(
            uuid = %message.uuid,
            attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Deferring failed item"
        );
        self.queue.send_deferred(message, delay).await?;
        self.metrics.deferred.fetch_add(1, Ordering::Relaxed);
        Ok(Outcome::Deferred { attempts, delay })
    }
}
