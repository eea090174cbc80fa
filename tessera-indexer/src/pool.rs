//! Worker Pool Background Tasks
//!
//! Spawns `worker_count` independent workers over one shared [`Indexer`].
//! Each worker wakes on `poll_interval`, drains every visible batch, and goes
//! back to sleep. Workers share nothing but the queue and the stores, so
//! ordering between them is not guaranteed; per-uuid ordering is settled by
//! sid comparison in the worker itself.
//!
//! # Shutdown
//!
//! ```ignore
//! let pool = WorkerPool::spawn(indexer.clone());
//! // ...
//! let metrics = pool.shutdown().await;
//! println!("Indexed {} views", metrics.indexed);
//! ```

use futures_util::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::worker::{Indexer, IndexerSnapshot};

/// Running workers and the channel that stops them.
pub struct WorkerPool {
    indexer: Arc<Indexer>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured number of workers on the current runtime.
    pub fn spawn(indexer: Arc<Indexer>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = indexer.config().worker_count.max(1);
        let poll_interval = indexer.config().poll_interval;

        tracing::info!(
            worker_count,
            poll_interval_ms = poll_interval.as_millis() as u64,
            batch_size = indexer.config().batch_size,
            "Worker pool started"
        );

        let handles = (0..worker_count)
            .map(|worker_id| {
                let indexer = indexer.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_task(worker_id, indexer, poll_interval, shutdown_rx).await;
                })
            })
            .collect();

        Self {
            indexer,
            shutdown_tx,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn metrics(&self) -> IndexerSnapshot {
        self.indexer.metrics().snapshot()
    }

    /// Signal every worker to stop after its current delivery and wait for
    /// all of them.
    pub async fn shutdown(self) -> IndexerSnapshot {
        let _ = self.shutdown_tx.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }

        let snapshot = self.indexer.metrics().snapshot();
        tracing::info!(
            processed = snapshot.processed,
            indexed = snapshot.indexed,
            deferred = snapshot.deferred,
            failed = snapshot.failed,
            secondary_queued = snapshot.secondary_queued,
            timeouts = snapshot.timeouts,
            "Worker pool stopped"
        );
        snapshot
    }
}

async fn worker_task(
    worker_id: usize,
    indexer: Arc<Indexer>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!(worker_id, "Worker started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                drain(worker_id, &indexer, &shutdown_rx).await;
            }
        }
    }

    tracing::debug!(worker_id, "Worker stopped");
}

/// Process batches until the queue has nothing visible or shutdown is
/// requested.
async fn drain(worker_id: usize, indexer: &Indexer, shutdown_rx: &watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        match indexer.process_batch().await {
            Ok(0) => break,
            Ok(handled) => {
                tracing::trace!(worker_id, handled, "Worker handled batch");
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Worker batch failed");
                indexer.metrics().errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
}
