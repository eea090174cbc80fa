//! Tessera service - the caller-facing operations
//!
//! Wires the stores, the type registry, the queue and the indexer together
//! and exposes `put`, `get`, `purge`, `reindex`, `index_diff` and the
//! operator helpers around the propagation pipeline.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tessera_core::{
    field_diff, EntityKey, EntityRecord, IndexMessage, ItemType, Properties, QueueLane, Sid,
    StorageError, StoreKind, TesseraConfig, TesseraError, TesseraResult, TypeRegistry, ViewState,
};
use tessera_storage::{
    EmbeddingResolver, Fetched, InMemoryReadStore, InMemoryWriteStore, InvalidationScope,
    LmdbReadStore, ReadStore, StalenessChecker, StorageRouter, WriteStore,
};
use uuid::Uuid;

use crate::failures::PermanentFailure;
use crate::pool::WorkerPool;
use crate::queue::{InMemoryIndexQueue, IndexQueue, QueueStatus};
use crate::worker::Indexer;

/// Tries per `put` when a concurrent write moves the entity underneath it.
const PUT_ATTEMPTS: u32 = 8;

// ============================================================================
// REINDEX
// ============================================================================

/// Options for [`Tessera::reindex`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexOptions {
    /// Types to rebuild; `None` rebuilds everything.
    pub types: Option<Vec<ItemType>>,
    /// Skip types whose views already match the Write Store.
    pub check_existing: bool,
    /// Report what would be queued without queueing it.
    pub skip_propagation: bool,
    /// Rebuild each view only, without fanning out to dependents.
    pub strict: bool,
}

impl ReindexOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn types(types: impl IntoIterator<Item = impl Into<ItemType>>) -> Self {
        Self {
            types: Some(types.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn check_existing(mut self, check_existing: bool) -> Self {
        self.check_existing = check_existing;
        self
    }

    pub fn skip_propagation(mut self, skip_propagation: bool) -> Self {
        self.skip_propagation = skip_propagation;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Per-type line of a [`ReindexReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeReindex {
    pub item_type: ItemType,
    /// Entities of this type in the Write Store.
    pub entities: usize,
    /// Messages queued (or, with `skip_propagation`, that would be).
    pub queued: usize,
    /// Skipped by `check_existing`.
    pub up_to_date: bool,
}

/// Outcome of one reindex run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub telemetry_id: String,
    /// Whether every type was rebuilt.
    pub total: bool,
    pub strict: bool,
    /// Waiting messages dropped before a total reindex.
    pub purged_messages: usize,
    pub types: Vec<TypeReindex>,
}

impl ReindexReport {
    pub fn queued(&self) -> usize {
        self.types.iter().map(|t| t.queued).sum()
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Cached-view engine: canonical writes, cached reads and their
/// reconciliation.
#[derive(Clone)]
pub struct Tessera {
    config: TesseraConfig,
    registry: Arc<TypeRegistry>,
    router: StorageRouter,
    queue: Arc<dyn IndexQueue>,
    indexer: Arc<Indexer>,
    staleness: StalenessChecker,
}

impl Tessera {
    pub fn new(
        config: TesseraConfig,
        registry: Arc<TypeRegistry>,
        write: Arc<dyn WriteStore>,
        read: Arc<dyn ReadStore>,
        queue: Arc<dyn IndexQueue>,
    ) -> Self {
        let resolver = EmbeddingResolver::new(write.clone(), registry.clone());
        let scope = InvalidationScope::new(
            write.clone(),
            read.clone(),
            registry.clone(),
            config.invalidation_mode,
        );
        let indexer = Arc::new(Indexer::new(
            write.clone(),
            read.clone(),
            queue.clone(),
            resolver,
            scope,
            config.pipeline.clone(),
        ));
        Self {
            router: StorageRouter::new(write.clone(), read.clone()),
            staleness: StalenessChecker::new(write, read),
            config,
            registry,
            queue,
            indexer,
        }
    }

    /// Validate `config` and build a service over in-memory stores, or over
    /// an LMDB Read Store when `read_store.lmdb_path` is set.
    pub fn open(config: TesseraConfig, registry: Arc<TypeRegistry>) -> TesseraResult<Self> {
        config.validate()?;
        let write: Arc<dyn WriteStore> = Arc::new(InMemoryWriteStore::new());
        let read: Arc<dyn ReadStore> = match &config.read_store.lmdb_path {
            Some(path) => Arc::new(LmdbReadStore::new(path, config.read_store.lmdb_max_size_mb)?),
            None => Arc::new(InMemoryReadStore::new()),
        };
        let queue: Arc<dyn IndexQueue> =
            Arc::new(InMemoryIndexQueue::new(config.pipeline.visibility_timeout));
        tracing::info!(
            lmdb = config.read_store.lmdb_path.is_some(),
            invalidation_mode = ?config.invalidation_mode,
            types = registry.type_names().len(),
            "Opened tessera"
        );
        Ok(Self::new(config, registry, write, read, queue))
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &StorageRouter {
        &self.router
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// Spawn the background worker pool.
    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::spawn(self.indexer.clone())
    }

    /// Create or update `uuid` and queue it for indexing.
    ///
    /// Creates when the uuid is new (a `base_sid` then fails with
    /// `NotFound`); updates otherwise, with optimistic concurrency when
    /// `base_sid` is given. Updates carry the field diff against the previous
    /// default sheet so the invalidation scope can be trimmed. Without a
    /// `base_sid` a concurrent write is retried against the new sheet.
    pub async fn put(
        &self,
        uuid: Uuid,
        item_type: impl Into<ItemType>,
        properties: Properties,
        base_sid: Option<Sid>,
    ) -> TesseraResult<Sid> {
        let item_type = item_type.into();
        let write = self.registry.require(&item_type)?.entity_write(properties)?;

        let mut tries = 0;
        let (sid, diff) = loop {
            tries += 1;
            let existing = match self.router.write_store().get(uuid).await {
                Ok(record) => Some(record),
                Err(TesseraError::Storage(StorageError::NotFound { .. })) => None,
                Err(e) => return Err(e),
            };

            let attempt = match existing {
                None if base_sid.is_some() => return Err(StorageError::NotFound { uuid }.into()),
                None => self
                    .router
                    .create(uuid, item_type.clone(), write.clone())
                    .await
                    .map(|sid| (sid, None)),
                Some(record) if record.item_type != item_type => {
                    return Err(StorageError::UuidConflict { uuid }.into());
                }
                Some(record) => {
                    // The diff is only valid against the sheet it was computed
                    // from, so the update is pinned to that sheet's sid.
                    let diff = field_diff(&item_type, &record.properties, &write.properties);
                    let base = base_sid.or(Some(record.sid));
                    self.router
                        .update(uuid, write.clone(), base)
                        .await
                        .map(|sid| (sid, Some(diff)))
                }
            };

            match attempt {
                Ok(stored) => break stored,
                Err(TesseraError::Storage(
                    StorageError::StaleWrite { .. } | StorageError::UuidConflict { .. },
                )) if base_sid.is_none() && tries < PUT_ATTEMPTS => {
                    tracing::debug!(uuid = %uuid, tries, "Entity changed during put, retrying");
                }
                Err(e) => return Err(e),
            }
        };

        let message = IndexMessage::primary(EntityKey::new(item_type.clone(), uuid), Some(sid), diff);
        self.queue.send(QueueLane::Primary, vec![message]).await?;
        tracing::debug!(uuid = %uuid, item_type = %item_type, sid, "Stored entity and queued primary");
        Ok(sid)
    }

    /// Read `uuid` through the router.
    pub async fn get(&self, uuid: Uuid, prefer: Option<StoreKind>) -> TesseraResult<Fetched> {
        self.router.get(uuid, prefer).await
    }

    pub async fn get_by_unique_key(&self, name: &str, value: &str) -> TesseraResult<EntityRecord> {
        self.router.get_by_unique_key(name, value).await
    }

    /// Remove `uuid` from the Write Store, then drop its cached view.
    ///
    /// Fails with `ReferentialIntegrity`, touching neither store, while
    /// another entity still links to it.
    /// Entities the purged one linked to lose a reverse link and are
    /// queued on the secondary lane.
    pub async fn purge(&self, uuid: Uuid) -> TesseraResult<()> {
        let write = self.router.write_store();
        let targets: Vec<Uuid> = match write.get(uuid).await {
            Ok(record) => record.links.iter().map(|edge| edge.target).collect(),
            Err(TesseraError::Storage(StorageError::NotFound { .. })) => Vec::new(),
            Err(e) => return Err(e),
        };
        self.router.purge(uuid).await?;
        let removed = self.router.read_store().delete_view(uuid).await?;

        let mut messages = Vec::new();
        for target in targets.into_iter().filter(|target| *target != uuid) {
            if let Some(item_type) = write.item_type_of(target).await? {
                messages.push(IndexMessage::secondary(EntityKey::new(item_type, target), None));
            }
        }
        let queued = if messages.is_empty() {
            0
        } else {
            self.queue.send(QueueLane::Secondary, messages).await?
        };
        tracing::info!(uuid = %uuid, view_removed = removed, queued, "Purged entity and cached view");
        Ok(())
    }

    /// Queue rebuilds for every entity of the selected types.
    ///
    /// A total reindex (no type filter) drops waiting messages first and
    /// always runs strict, since every view is rebuilt anyway.
    pub async fn reindex(&self, options: ReindexOptions) -> TesseraResult<ReindexReport> {
        let total = options.types.is_none();
        let strict = options.strict || total;
        let telemetry_id = format!("reindex-{}", Uuid::now_v7());

        let purged_messages = if total && !options.skip_propagation {
            self.queue.purge().await?
        } else {
            0
        };

        let write = self.router.write_store();
        let keys = write.list(options.types.as_deref()).await?;
        let mut by_type: BTreeMap<ItemType, Vec<EntityKey>> = BTreeMap::new();
        for key in keys {
            by_type.entry(key.item_type.clone()).or_default().push(key);
        }

        let mut types = Vec::with_capacity(by_type.len());
        for (item_type, keys) in by_type {
            let entities = keys.len();
            if options.check_existing && self.is_up_to_date(&item_type, entities).await? {
                tracing::debug!(item_type = %item_type, entities, "Views current, skipping type");
                types.push(TypeReindex {
                    item_type,
                    entities,
                    queued: 0,
                    up_to_date: true,
                });
                continue;
            }

            let queued = if options.skip_propagation {
                entities
            } else {
                let messages: Vec<IndexMessage> = keys
                    .into_iter()
                    .map(|key| {
                        IndexMessage::primary(key, None, None)
                            .with_strict(strict)
                            .with_telemetry_id(telemetry_id.clone())
                    })
                    .collect();
                self.queue.send(QueueLane::Primary, messages).await?
            };
            types.push(TypeReindex {
                item_type,
                entities,
                queued,
                up_to_date: false,
            });
        }

        let report = ReindexReport {
            telemetry_id,
            total,
            strict,
            purged_messages,
            types,
        };
        tracing::info!(
            telemetry_id = %report.telemetry_id,
            total,
            strict,
            skip_propagation = options.skip_propagation,
            queued = report.queued(),
            "Reindex requested"
        );
        Ok(report)
    }

    async fn is_up_to_date(&self, item_type: &ItemType, entities: usize) -> TesseraResult<bool> {
        let views = self.router.read_store().count(item_type).await?;
        if views != entities {
            return Ok(false);
        }
        let report = self
            .staleness
            .report(Some(std::slice::from_ref(item_type)))
            .await?;
        Ok(report.is_clean())
    }

    /// Uuids of the selected types whose cached view is missing or older
    /// than the Write Store. Rebuilds nothing.
    pub async fn index_diff(&self, types: Option<&[ItemType]>) -> TesseraResult<Vec<Uuid>> {
        let keys = self.router.write_store().list(types).await?;
        let uuids: Vec<Uuid> = keys.iter().map(|key| key.uuid).collect();
        let current: HashMap<Uuid, Sid> = self.router.write_store().current_sids(&uuids).await?;
        let indexed: HashMap<Uuid, Sid> = self.router.read_store().view_sids(&uuids).await?;

        Ok(uuids
            .into_iter()
            .filter(|uuid| match (current.get(uuid), indexed.get(uuid)) {
                (Some(write_sid), Some(view_sid)) => view_sid < write_sid,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect())
    }

    /// Compare the cached view of `uuid` with the Write Store.
    pub async fn check_view(&self, uuid: Uuid) -> TesseraResult<ViewState> {
        self.staleness.check_view(uuid).await
    }

    pub async fn queue_status(&self) -> TesseraResult<QueueStatus> {
        self.queue.status().await
    }

    /// Items whose retry budget ran out.
    pub fn failures(&self) -> Vec<PermanentFailure> {
        self.indexer.failures().entries()
    }

    /// Move every reported failure back to the primary lane with a fresh
    /// retry budget.
    pub async fn requeue_failures(&self) -> TesseraResult<usize> {
        let failures = self.indexer.failures().take()?;
        if failures.is_empty() {
            return Ok(0);
        }
        let messages: Vec<IndexMessage> = failures
            .into_iter()
            .map(|failure| {
                let mut message = failure.message;
                message.attempts = 0;
                // A sid that never committed would fail again.
                message.sid = None;
                message
            })
            .collect();
        let count = self.queue.send(QueueLane::Primary, messages).await?;
        tracing::info!(count, "Requeued permanent failures");
        Ok(count)
    }

    /// Process queued work on the calling task until nothing is visible.
    pub async fn run_until_idle(&self) -> TesseraResult<usize> {
        self.indexer.run_until_idle().await
    }
}
