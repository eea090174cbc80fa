//! End-to-end propagation tests over in-memory stores.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tessera_core::{
    EntityKey, EntityRecord, EntityWrite, IndexMessage, InvalidationMode, ItemType, LinkEdge,
    Properties, QueueLane, SheetRevision, Sid, StoreKind, TesseraResult, TypeRegistry, UniqueKey,
    ViewState,
};
use tessera_indexer::{InMemoryIndexQueue, IndexQueue, Outcome, ReindexOptions, Tessera};
use tessera_storage::{
    Fetched, InMemoryReadStore, InMemoryWriteStore, InvalidationScope, ReadStore, WriteStore,
};
use tessera_test_utils::{assertions, fixtures};
use uuid::Uuid;

struct Harness {
    tessera: Tessera,
    write: Arc<InMemoryWriteStore>,
    read: Arc<InMemoryReadStore>,
    queue: Arc<InMemoryIndexQueue>,
}

fn harness(registry: TypeRegistry, mode: InvalidationMode) -> Harness {
    let config = fixtures::config(mode);
    let (write, read) = fixtures::stores();
    let queue = Arc::new(InMemoryIndexQueue::new(config.pipeline.visibility_timeout));
    let tessera = Tessera::new(
        config,
        Arc::new(registry),
        write.clone(),
        read.clone(),
        queue.clone(),
    );
    Harness {
        tessera,
        write,
        read,
        queue,
    }
}

impl Harness {
    async fn put(&self, uuid: Uuid, item_type: &str, value: serde_json::Value) -> i64 {
        self.tessera
            .put(uuid, item_type, fixtures::props(value), None)
            .await
            .expect("put should succeed")
    }

    async fn drain(&self) -> usize {
        self.tessera.run_until_idle().await.expect("drain")
    }

    /// Write straight to the Write Store, bypassing the queue.
    async fn seed(&self, uuid: Uuid, item_type: &str, value: serde_json::Value) -> i64 {
        let item_type = ItemType::new(item_type);
        let write = self
            .tessera
            .registry()
            .require(&item_type)
            .and_then(|info| info.entity_write(fixtures::props(value)))
            .expect("valid write");
        self.write.create(uuid, item_type, write).await.expect("create")
    }
}

// ============================================================================
// WRITE PATH
// ============================================================================

#[tokio::test]
async fn test_put_then_get_returns_new_sid_and_properties() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    let first = h.put(lab, "Lab", json!({"title": "Bio", "code": "BIO"})).await;
    let second = h
        .tessera
        .put(lab, "Lab", fixtures::props(json!({"title": "Chem", "code": "BIO"})), Some(first))
        .await
        .expect("update");
    assert!(second > first);

    match h.tessera.get(lab, Some(StoreKind::Write)).await.expect("get") {
        Fetched::Record(record) => {
            assert_eq!(record.sid, second);
            assert_eq!(record.properties["title"], json!("Chem"));
        }
        other => panic!("expected write store record, got {:?}", other),
    }

    let by_key = h.tessera.get_by_unique_key("Lab:code", "BIO").await.expect("by key");
    assert_eq!(by_key.uuid, lab);
}

#[tokio::test]
async fn test_put_surfaces_caller_errors() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    let sid = h.put(lab, "Lab", json!({"title": "Bio", "code": "BIO"})).await;
    h.put(lab, "Lab", json!({"title": "Bio 2", "code": "BIO"})).await;

    let stale = h
        .tessera
        .put(lab, "Lab", fixtures::props(json!({"title": "Late"})), Some(sid))
        .await;
    assertions::assert_stale_write(&stale);

    let other_type = h
        .tessera
        .put(lab, "Experiment", fixtures::props(json!({"name": "E"})), None)
        .await;
    assertions::assert_conflict(&other_type);

    let duplicate_key = h
        .tessera
        .put(Uuid::now_v7(), "Lab", fixtures::props(json!({"code": "BIO"})), None)
        .await;
    assertions::assert_conflict(&duplicate_key);

    let missing = Uuid::now_v7();
    let update_missing = h
        .tessera
        .put(missing, "Lab", fixtures::props(json!({"title": "Ghost"})), Some(1))
        .await;
    assertions::assert_not_found(&update_missing, missing);

    let unknown = h
        .tessera
        .put(Uuid::now_v7(), "Widget", fixtures::props(json!({})), None)
        .await;
    assertions::assert_validation_error(&unknown);
}

// ============================================================================
// PROPAGATION
// ============================================================================

#[tokio::test]
async fn test_same_message_twice_is_idempotent() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    let exp = Uuid::now_v7();
    h.put(lab, "Lab", json!({"title": "Bio"})).await;
    h.put(exp, "Experiment", json!({"name": "E", "lab": lab.to_string()})).await;
    h.drain().await;

    let first = h.read.get_view(exp).await.expect("view");
    let message = IndexMessage::primary(EntityKey::new("Experiment", exp), None, None);
    h.queue
        .send(QueueLane::Primary, vec![message.clone()])
        .await
        .expect("send");
    h.queue.send(QueueLane::Primary, vec![message]).await.expect("send");
    h.drain().await;

    let second = h.read.get_view(exp).await.expect("view");
    assert_eq!(first.fingerprint(), second.fingerprint());
    assert_eq!(first.embedded, second.embedded);
    assert!(second.sid >= first.sid);
    assert!(second.max_sid >= first.max_sid);
}

#[tokio::test]
async fn test_wildcard_embed_propagates_update_to_dependent() {
    let h = harness(fixtures::wildcard_registry(), InvalidationMode::Precise);
    let b = Uuid::now_v7();
    let a = Uuid::now_v7();
    h.put(b, "Source", json!({"id": 1})).await;
    h.put(a, "Ref", json!({"id": 2, "ref": b.to_string()})).await;
    h.drain().await;

    let view = h.read.get_view(a).await.expect("A indexed");
    assertions::assert_linked(&view, &[b]);

    let b_sid = h.put(b, "Source", json!({"id": 1, "name": "renamed"})).await;
    let outcome_count = h.tessera.indexer().process_batch().await.expect("batch");
    assert_eq!(outcome_count, 1);
    let secondary: Vec<EntityKey> = h
        .queue
        .peek(QueueLane::Secondary)
        .expect("peek")
        .iter()
        .map(IndexMessage::key)
        .collect();
    assert_eq!(secondary, vec![EntityKey::new("Ref", a)]);

    h.drain().await;
    let rebuilt = h.read.get_view(a).await.expect("A rebuilt");
    assert_eq!(rebuilt.embedded["ref"]["name"], json!("renamed"));
    assert!(rebuilt.max_sid >= b_sid);
    assertions::assert_fresh(&h.tessera.check_view(a).await.expect("check"));
}

#[tokio::test]
async fn test_unembedded_field_change_queues_nothing() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    let exp = Uuid::now_v7();
    h.put(lab, "Lab", json!({"title": "Bio", "code": "BIO"})).await;
    h.put(exp, "Experiment", json!({"name": "E", "lab": lab.to_string()})).await;
    h.drain().await;
    let queued_before = h.tessera.indexer().metrics().snapshot().secondary_queued;

    h.put(
        lab,
        "Lab",
        json!({"title": "Bio", "code": "BIO", "unrelated_field": 7}),
    )
    .await;

    let scope = InvalidationScope::new(
        h.write.clone(),
        h.read.clone(),
        h.tessera.registry().clone(),
        InvalidationMode::Precise,
    );
    let diff = vec!["Lab.unrelated_field".to_string()];
    assert!(scope.scope(lab, Some(diff.as_slice())).await.expect("scope").is_empty());

    h.drain().await;
    assert!(h.queue.peek(QueueLane::Secondary).expect("peek").is_empty());
    assert_eq!(
        h.tessera.indexer().metrics().snapshot().secondary_queued,
        queued_before
    );
}

#[tokio::test]
async fn test_conservative_mode_keeps_calculated_dependents() {
    let h = harness(fixtures::registry(), InvalidationMode::CalculatedConservative);
    let lab = Uuid::now_v7();
    let exp = Uuid::now_v7();
    h.put(lab, "Lab", json!({"title": "Bio", "code": "BIO"})).await;
    h.put(exp, "Experiment", json!({"name": "E", "lab": lab.to_string()})).await;
    h.drain().await;

    h.put(lab, "Lab", json!({"title": "Bio", "code": "BIO2"})).await;
    h.tessera.indexer().process_batch().await.expect("batch");
    let secondary = h.queue.peek(QueueLane::Secondary).expect("peek");
    assert_eq!(secondary.len(), 1);
    assert_eq!(secondary[0].uuid, exp);
}

#[tokio::test]
async fn test_new_and_repointed_links_rebuild_targets() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    let other_lab = Uuid::now_v7();
    let exp = Uuid::now_v7();
    h.put(lab, "Lab", json!({"title": "Bio"})).await;
    h.put(other_lab, "Lab", json!({"title": "Chem"})).await;
    h.drain().await;
    assert!(h.read.get_view(lab).await.expect("view").rev_links.is_empty());

    h.put(exp, "Experiment", json!({"name": "E", "lab": lab.to_string()})).await;
    h.drain().await;
    let lab_view = h.read.get_view(lab).await.expect("view");
    assert_eq!(lab_view.rev_links["lab"], [exp].into_iter().collect());
    assertions::assert_fresh(&h.tessera.check_view(lab).await.expect("check"));

    h.put(exp, "Experiment", json!({"name": "E", "lab": other_lab.to_string()}))
        .await;
    h.drain().await;
    assert!(h.read.get_view(lab).await.expect("view").rev_links.is_empty());
    let other_view = h.read.get_view(other_lab).await.expect("view");
    assert_eq!(other_view.rev_links["lab"], [exp].into_iter().collect());
    let exp_view = h.read.get_view(exp).await.expect("view");
    assert_eq!(exp_view.embedded["lab"]["title"], json!("Chem"));
    for uuid in [lab, other_lab, exp] {
        assertions::assert_fresh(&h.tessera.check_view(uuid).await.expect("check"));
    }
}

// ============================================================================
// CONCURRENT WRITES
// ============================================================================

/// Write Store whose next `get` returns a record captured earlier, as if
/// another writer committed between the caller's read and its update.
struct RacingWriteStore {
    inner: Arc<InMemoryWriteStore>,
    stale: Mutex<Option<EntityRecord>>,
}

#[async_trait]
impl WriteStore for RacingWriteStore {
    async fn create(&self, uuid: Uuid, item_type: ItemType, write: EntityWrite) -> TesseraResult<Sid> {
        self.inner.create(uuid, item_type, write).await
    }

    async fn update(&self, uuid: Uuid, write: EntityWrite, base_sid: Option<Sid>) -> TesseraResult<Sid> {
        self.inner.update(uuid, write, base_sid).await
    }

    async fn get(&self, uuid: Uuid) -> TesseraResult<EntityRecord> {
        let stale = self.stale.lock().expect("lock").take();
        match stale {
            Some(record) if record.uuid == uuid => Ok(record),
            _ => self.inner.get(uuid).await,
        }
    }

    async fn get_by_unique_key(&self, name: &str, value: &str) -> TesseraResult<EntityRecord> {
        self.inner.get_by_unique_key(name, value).await
    }

    async fn unique_key_owners(&self, keys: &[UniqueKey]) -> TesseraResult<BTreeMap<UniqueKey, Uuid>> {
        self.inner.unique_key_owners(keys).await
    }

    async fn sheet(&self, uuid: Uuid, name: &str) -> TesseraResult<Option<Properties>> {
        self.inner.sheet(uuid, name).await
    }

    async fn history(&self, uuid: Uuid) -> TesseraResult<Vec<SheetRevision>> {
        self.inner.history(uuid).await
    }

    async fn purge(&self, uuid: Uuid) -> TesseraResult<()> {
        self.inner.purge(uuid).await
    }

    async fn rev_links(&self, uuid: Uuid) -> TesseraResult<Vec<LinkEdge>> {
        self.inner.rev_links(uuid).await
    }

    async fn max_sid(&self) -> TesseraResult<Sid> {
        self.inner.max_sid().await
    }

    async fn current_sids(&self, uuids: &[Uuid]) -> TesseraResult<HashMap<Uuid, Sid>> {
        self.inner.current_sids(uuids).await
    }

    async fn item_type_of(&self, uuid: Uuid) -> TesseraResult<Option<ItemType>> {
        self.inner.item_type_of(uuid).await
    }

    async fn list(&self, types: Option<&[ItemType]>) -> TesseraResult<Vec<EntityKey>> {
        self.inner.list(types).await
    }
}

#[tokio::test]
async fn test_put_diffs_against_the_sheet_it_replaces() {
    let config = fixtures::config(InvalidationMode::Precise);
    let (inner, read) = fixtures::stores();
    let write = Arc::new(RacingWriteStore {
        inner: inner.clone(),
        stale: Mutex::new(None),
    });
    let queue = Arc::new(InMemoryIndexQueue::new(config.pipeline.visibility_timeout));
    let tessera = Tessera::new(
        config,
        Arc::new(fixtures::registry()),
        write.clone(),
        read.clone(),
        queue,
    );
    let lab = Uuid::now_v7();
    let exp = Uuid::now_v7();
    tessera
        .put(lab, "Lab", fixtures::props(json!({"title": "Bio"})), None)
        .await
        .expect("put");
    tessera
        .put(exp, "Experiment", fixtures::props(json!({"name": "E", "lab": lab.to_string()})), None)
        .await
        .expect("put");
    tessera.run_until_idle().await.expect("drain");
    let before = inner.get(lab).await.expect("lab");

    tessera
        .put(lab, "Lab", fixtures::props(json!({"title": "Chem"})), None)
        .await
        .expect("put");
    tessera.run_until_idle().await.expect("drain");

    // The next put reads the "Bio" sheet, but "Chem" is what it replaces.
    *write.stale.lock().expect("lock") = Some(before);
    let sid = tessera
        .put(lab, "Lab", fixtures::props(json!({"title": "Bio"})), None)
        .await
        .expect("put retries past the concurrent write");
    assert_eq!(inner.get(lab).await.expect("lab").sid, sid);
    tessera.run_until_idle().await.expect("drain");

    let view = read.get_view(exp).await.expect("view");
    assert_eq!(view.embedded["lab"]["title"], json!("Bio"));
    assertions::assert_fresh(&tessera.check_view(exp).await.expect("check"));
}

// ============================================================================
// PURGE
// ============================================================================

#[tokio::test]
async fn test_purge_rebuilds_former_link_targets() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    let exp = Uuid::now_v7();
    h.put(lab, "Lab", json!({"title": "Bio"})).await;
    h.put(exp, "Experiment", json!({"name": "E", "lab": lab.to_string()})).await;
    h.drain().await;
    assert!(!h.read.get_view(lab).await.expect("view").rev_links.is_empty());

    h.tessera.purge(exp).await.expect("purge");
    let queued = h.queue.peek(QueueLane::Secondary).expect("peek");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].uuid, lab);

    h.drain().await;
    assert!(h.read.get_view(lab).await.expect("view").rev_links.is_empty());
    assertions::assert_fresh(&h.tessera.check_view(lab).await.expect("check"));
}

#[tokio::test]
async fn test_purge_of_linked_entity_is_refused_without_mutation() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    let exp = Uuid::now_v7();
    let lab_sid = h.put(lab, "Lab", json!({"title": "Bio"})).await;
    h.put(exp, "Experiment", json!({"name": "E", "lab": lab.to_string()})).await;
    h.drain().await;
    let lab_view = h.read.get_view(lab).await.expect("lab view");
    let exp_view = h.read.get_view(exp).await.expect("exp view");

    let result = h.tessera.purge(lab).await;
    let blockers = assertions::assert_referential_integrity(&result, lab);
    assert_eq!(blockers, vec![exp]);

    assert_eq!(h.write.get(lab).await.expect("still stored").sid, lab_sid);
    assert_eq!(h.read.get_view(lab).await.expect("view kept"), lab_view);
    assert_eq!(h.read.get_view(exp).await.expect("view kept"), exp_view);

    h.tessera.purge(exp).await.expect("unlinked purge");
    h.tessera.purge(lab).await.expect("purge once free");
    assertions::assert_not_found(&h.write.get(lab).await, lab);
    assert!(h.read.get_view(lab).await.is_err());
    // Nothing stored on either side.
    assert_eq!(h.tessera.check_view(lab).await.expect("check"), ViewState::Fresh);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_twelve_failures_reach_permanent_report() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    h.read.fail_next_puts(u32::MAX);
    h.put(lab, "Lab", json!({"title": "Bio"})).await;

    assert_eq!(h.drain().await, 12);
    let failures = h.tessera.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].uuid(), lab);
    assert_eq!(failures[0].message.attempts, 12);
    assert!(h.read.get_view(lab).await.is_err());
    assert_eq!(h.tessera.check_view(lab).await.expect("check"), ViewState::Missing);
    assert!(h.tessera.queue_status().await.expect("status").is_idle());

    h.read.fail_next_puts(0);
    assert_eq!(h.tessera.requeue_failures().await.expect("requeue"), 1);
    assert!(h.tessera.failures().is_empty());
    h.drain().await;
    assertions::assert_fresh(&h.tessera.check_view(lab).await.expect("check"));
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let lab = Uuid::now_v7();
    h.read.fail_next_puts(2);
    h.put(lab, "Lab", json!({"title": "Bio"})).await;

    let delivery = h.queue.receive(1).await.expect("receive").remove(0);
    let sid = h.write.max_sid().await.expect("max sid");
    let outcome = h
        .tessera
        .indexer()
        .process(delivery, sid, &mut tessera_storage::ResolveCache::new())
        .await
        .expect("process");
    assert!(matches!(outcome, Outcome::Deferred { attempts: 1, .. }));

    h.drain().await;
    assert!(h.read.get_view(lab).await.is_ok());
    assert!(h.tessera.failures().is_empty());
}

// ============================================================================
// REINDEX AND DIFF
// ============================================================================

#[tokio::test]
async fn test_index_diff_and_reindex() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let labs = [Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7()];
    for (i, lab) in labs.iter().enumerate() {
        h.seed(*lab, "Lab", json!({"title": format!("Lab {}", i)})).await;
    }
    let exp = Uuid::now_v7();
    h.seed(exp, "Experiment", json!({"name": "E", "lab": labs[0].to_string()}))
        .await;

    assert_eq!(h.tessera.index_diff(None).await.expect("diff").len(), 4);
    let lab_type = [ItemType::new("Lab")];
    let lab_diff: BTreeSet<Uuid> = h
        .tessera
        .index_diff(Some(&lab_type))
        .await
        .expect("diff")
        .into_iter()
        .collect();
    assert_eq!(lab_diff, labs.iter().copied().collect());

    let report = h.tessera.reindex(ReindexOptions::all()).await.expect("reindex");
    assert!(report.total);
    assert!(report.strict);
    assert_eq!(report.queued(), 4);
    h.drain().await;
    assert!(h.tessera.index_diff(None).await.expect("diff").is_empty());
    assert_eq!(h.tessera.indexer().metrics().snapshot().secondary_queued, 0);

    let unchanged = h
        .tessera
        .reindex(ReindexOptions::all().check_existing(true))
        .await
        .expect("reindex");
    assert_eq!(unchanged.queued(), 0);
    assert!(unchanged.types.iter().all(|t| t.up_to_date));

    let current = h.write.get(labs[1]).await.expect("lab").sid;
    let write = h
        .tessera
        .registry()
        .require(&ItemType::new("Lab"))
        .and_then(|info| info.entity_write(fixtures::props(json!({"title": "Moved"}))))
        .expect("valid write");
    h.write.update(labs[1], write, Some(current)).await.expect("update");
    assert_eq!(h.tessera.index_diff(Some(&lab_type)).await.expect("diff"), vec![labs[1]]);

    let dry_run = h
        .tessera
        .reindex(
            ReindexOptions::types(["Lab"])
                .check_existing(true)
                .skip_propagation(true),
        )
        .await
        .expect("reindex");
    assert!(!dry_run.total);
    assert_eq!(dry_run.queued(), 3);
    assert_eq!(h.tessera.queue_status().await.expect("status").total_waiting(), 0);

    let partial = h
        .tessera
        .reindex(ReindexOptions::types(["Lab"]).check_existing(true))
        .await
        .expect("reindex");
    assert_eq!(partial.queued(), 3);
    assert!(partial.types.iter().all(|t| t.item_type == ItemType::new("Lab")));
    h.drain().await;
    assert!(h.tessera.index_diff(None).await.expect("diff").is_empty());
}

#[tokio::test]
async fn test_worker_pool_serves_service_writes() {
    let h = harness(fixtures::registry(), InvalidationMode::Precise);
    let pool = h.tessera.start_workers();
    let lab = Uuid::now_v7();
    h.put(lab, "Lab", json!({"title": "Bio"})).await;

    for _ in 0..200 {
        if h.read.get_view(lab).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let snapshot = pool.shutdown().await;
    assert!(snapshot.indexed >= 1);
    assert!(matches!(
        h.tessera.get(lab, None).await.expect("get"),
        Fetched::View(_)
    ));
}
