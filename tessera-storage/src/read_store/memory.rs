//! In-memory Read Store.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;
use tessera_core::{
    CachedView, EntityKey, IndexError, ItemType, Sid, StorageError, StoreKind, TesseraResult,
};
use uuid::Uuid;

use super::{ReadStore, ReadStoreStats};

#[derive(Debug, Default)]
struct ReadState {
    views: HashMap<Uuid, CachedView>,
    /// linked uuid -> uuids of views that embed it
    dependents: HashMap<Uuid, BTreeSet<Uuid>>,
    stats: ReadStoreStats,
}

impl ReadState {
    fn unindex(&mut self, view: &CachedView) {
        for linked in &view.linked_uuids {
            if let Some(set) = self.dependents.get_mut(linked) {
                set.remove(&view.uuid);
                if set.is_empty() {
                    self.dependents.remove(linked);
                }
            }
        }
    }

    fn index(&mut self, view: &CachedView) {
        for linked in &view.linked_uuids {
            self.dependents.entry(*linked).or_default().insert(view.uuid);
        }
    }
}

/// Process-local Read Store.
///
/// `set_available(false)` simulates an unreachable backend and
/// `fail_next_puts(n)` makes the next `n` writes fail with a transient
/// error.
#[derive(Debug)]
pub struct InMemoryReadStore {
    state: RwLock<ReadState>,
    available: AtomicBool,
    failing_puts: AtomicU32,
}

impl Default for InMemoryReadStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(ReadState::default()),
            available: AtomicBool::new(true),
            failing_puts: AtomicU32::new(0),
        }
    }
}

impl InMemoryReadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Every stored view, sorted by uuid.
    pub fn snapshot(&self) -> TesseraResult<Vec<CachedView>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut views: Vec<CachedView> = state.views.values().cloned().collect();
        views.sort_by_key(|view| view.uuid);
        Ok(views)
    }

    fn ensure_available(&self) -> TesseraResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                store: StoreKind::Read,
            }
            .into())
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ReadStore for InMemoryReadStore {
    async fn put_view(&self, view: CachedView) -> TesseraResult<()> {
        self.ensure_available()?;
        if self.take_injected_failure() {
            return Err(IndexError::Transient {
                uuid: view.uuid,
                reason: "injected read store failure".to_string(),
            }
            .into());
        }
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(previous) = state.views.remove(&view.uuid) {
            state.unindex(&previous);
        } else {
            state.stats.view_count += 1;
        }
        state.index(&view);
        state.stats.puts += 1;
        state.views.insert(view.uuid, view);
        Ok(())
    }

    async fn get_view(&self, uuid: Uuid) -> TesseraResult<CachedView> {
        self.ensure_available()?;
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        match state.views.get(&uuid).cloned() {
            Some(view) => {
                state.stats.hits += 1;
                Ok(view)
            }
            None => {
                state.stats.misses += 1;
                Err(StorageError::NotFound { uuid }.into())
            }
        }
    }

    async fn delete_view(&self, uuid: Uuid) -> TesseraResult<bool> {
        self.ensure_available()?;
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        match state.views.remove(&uuid) {
            Some(previous) => {
                state.unindex(&previous);
                state.stats.deletes += 1;
                state.stats.view_count = state.stats.view_count.saturating_sub(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_max_sid(&self) -> TesseraResult<Sid> {
        self.ensure_available()?;
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.views.values().map(|v| v.max_sid).max().unwrap_or(0))
    }

    async fn find_dependents(&self, uuid: Uuid) -> TesseraResult<Vec<EntityKey>> {
        self.ensure_available()?;
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(sources) = state.dependents.get(&uuid) else {
            return Ok(Vec::new());
        };
        Ok(sources
            .iter()
            .filter_map(|source| state.views.get(source))
            .map(CachedView::key)
            .collect())
    }

    async fn view_sids(&self, uuids: &[Uuid]) -> TesseraResult<HashMap<Uuid, Sid>> {
        self.ensure_available()?;
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(uuids
            .iter()
            .filter_map(|uuid| state.views.get(uuid).map(|v| (*uuid, v.sid)))
            .collect())
    }

    async fn count(&self, item_type: &ItemType) -> TesseraResult<usize> {
        self.ensure_available()?;
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state
            .views
            .values()
            .filter(|v| &v.item_type == item_type)
            .count())
    }

    fn stats(&self) -> ReadStoreStats {
        self.state
            .read()
            .map(|state| state.stats.clone())
            .unwrap_or_default()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tessera_core::TesseraError;

    fn view(uuid: Uuid, sid: Sid, linked: &[Uuid]) -> CachedView {
        CachedView {
            uuid,
            item_type: ItemType::new("Experiment"),
            embedded: json!({"uuid": uuid}),
            sid,
            max_sid: sid,
            linked_uuids: linked.iter().copied().collect(),
            rev_links: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = InMemoryReadStore::new();
        let uuid = Uuid::now_v7();
        store.put_view(view(uuid, 3, &[])).await.expect("put");
        let stored = store.get_view(uuid).await.expect("get");
        assert_eq!(stored.sid, 3);
        assert_eq!(store.get_max_sid().await.expect("max"), 3);
        assert_eq!(store.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryReadStore::new();
        let uuid = Uuid::now_v7();
        let err = store.get_view(uuid).await.unwrap_err();
        assert_eq!(err, TesseraError::Storage(StorageError::NotFound { uuid }));
        assert_eq!(store.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = InMemoryReadStore::new();
        let uuid = Uuid::now_v7();
        let linked = Uuid::now_v7();
        store.put_view(view(uuid, 2, &[linked])).await.expect("put");
        let first = store.snapshot().expect("snapshot");
        store.put_view(view(uuid, 2, &[linked])).await.expect("put");
        assert_eq!(first, store.snapshot().expect("snapshot"));
        assert_eq!(store.find_dependents(linked).await.expect("deps").len(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_reindexes_dependents() {
        let store = InMemoryReadStore::new();
        let uuid = Uuid::now_v7();
        let old_link = Uuid::now_v7();
        let new_link = Uuid::now_v7();
        store.put_view(view(uuid, 1, &[old_link])).await.expect("put");
        store.put_view(view(uuid, 2, &[new_link])).await.expect("put");
        assert!(store.find_dependents(old_link).await.expect("deps").is_empty());
        assert_eq!(
            store.find_dependents(new_link).await.expect("deps"),
            vec![EntityKey::new("Experiment", uuid)]
        );
    }

    #[tokio::test]
    async fn test_delete_view_drops_index() {
        let store = InMemoryReadStore::new();
        let uuid = Uuid::now_v7();
        let linked = Uuid::now_v7();
        store.put_view(view(uuid, 1, &[linked])).await.expect("put");
        assert!(store.delete_view(uuid).await.expect("delete"));
        assert!(!store.delete_view(uuid).await.expect("delete"));
        assert!(store.find_dependents(linked).await.expect("deps").is_empty());
        assert_eq!(store.count(&ItemType::new("Experiment")).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_counted_down() {
        let store = InMemoryReadStore::new();
        store.fail_next_puts(2);
        let uuid = Uuid::now_v7();
        assert!(store.put_view(view(uuid, 1, &[])).await.unwrap_err().is_transient());
        assert!(store.put_view(view(uuid, 1, &[])).await.unwrap_err().is_transient());
        store.put_view(view(uuid, 1, &[])).await.expect("third put succeeds");
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryReadStore::new();
        store.set_available(false);
        let err = store.get_view(Uuid::nil()).await.unwrap_err();
        assert_eq!(
            err,
            TesseraError::Storage(StorageError::Unavailable {
                store: StoreKind::Read
            })
        );
    }
}
