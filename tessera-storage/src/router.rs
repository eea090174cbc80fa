//! Storage Router - single entry point over both stores
//!
//! Routing rules, in priority order:
//!
//! 1. `create`, `update`, `purge` and unique-key lookups go to the Write
//!    Store; they need transactional guarantees.
//! 2. An explicit store preference is honored unless that store is
//!    unavailable.
//! 3. Otherwise `get` prefers the Read Store and falls back to the Write
//!    Store on a miss or an outage.
//!
//! Choosing a store never mutates either one.

use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::{
    CachedView, EntityRecord, EntityWrite, ItemType, Sid, StorageError, StoreKind, TesseraError,
    TesseraResult, UniqueKey,
};
use uuid::Uuid;

use crate::read_store::ReadStore;
use crate::write_store::WriteStore;

/// Operations the router knows how to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    GetByUniqueKey,
    Purge,
}

/// Result of a routed `get`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// Served from the Read Store.
    View(CachedView),
    /// Served from the Write Store.
    Record(EntityRecord),
}

impl Fetched {
    pub fn uuid(&self) -> Uuid {
        match self {
            Fetched::View(view) => view.uuid,
            Fetched::Record(record) => record.uuid,
        }
    }

    pub fn sid(&self) -> Sid {
        match self {
            Fetched::View(view) => view.sid,
            Fetched::Record(record) => record.sid,
        }
    }

    pub fn item_type(&self) -> &ItemType {
        match self {
            Fetched::View(view) => &view.item_type,
            Fetched::Record(record) => &record.item_type,
        }
    }

    pub fn served_by(&self) -> StoreKind {
        match self {
            Fetched::View(_) => StoreKind::Read,
            Fetched::Record(_) => StoreKind::Write,
        }
    }
}

/// Routes caller operations to the Write or Read Store.
#[derive(Clone)]
pub struct StorageRouter {
    write: Arc<dyn WriteStore>,
    read: Arc<dyn ReadStore>,
}

impl StorageRouter {
    pub fn new(write: Arc<dyn WriteStore>, read: Arc<dyn ReadStore>) -> Self {
        Self { write, read }
    }

    pub fn write_store(&self) -> &Arc<dyn WriteStore> {
        &self.write
    }

    pub fn read_store(&self) -> &Arc<dyn ReadStore> {
        &self.read
    }

    /// Pick the store for `op`.
    pub fn route(&self, op: StoreOp, preference: Option<StoreKind>) -> StoreKind {
        match op {
            StoreOp::Create | StoreOp::Update | StoreOp::Purge | StoreOp::GetByUniqueKey => {
                StoreKind::Write
            }
            StoreOp::Get => match preference {
                Some(StoreKind::Write) if self.write.is_available() => StoreKind::Write,
                Some(StoreKind::Write) if self.read.is_available() => StoreKind::Read,
                Some(StoreKind::Write) => StoreKind::Write,
                Some(StoreKind::Read) | None if self.read.is_available() => StoreKind::Read,
                Some(StoreKind::Read) | None => StoreKind::Write,
            },
        }
    }

    /// Fetch `uuid` as a cached view or a canonical record.
    ///
    /// A Read Store miss falls back to the Write Store unless the caller
    /// explicitly asked for the Read Store, in which case `NotFound` is
    /// returned.
    pub async fn get(&self, uuid: Uuid, preference: Option<StoreKind>) -> TesseraResult<Fetched> {
        match self.route(StoreOp::Get, preference) {
            StoreKind::Write => Ok(Fetched::Record(self.write.get(uuid).await?)),
            StoreKind::Read => match self.read.get_view(uuid).await {
                Ok(view) => Ok(Fetched::View(view)),
                Err(TesseraError::Storage(StorageError::NotFound { .. }))
                    if preference != Some(StoreKind::Read) =>
                {
                    tracing::trace!(uuid = %uuid, "Read store miss, falling back to write store");
                    Ok(Fetched::Record(self.write.get(uuid).await?))
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(uuid = %uuid, error = %e, "Read store failed, falling back to write store");
                    Ok(Fetched::Record(self.write.get(uuid).await?))
                }
                Err(e) => Err(e),
            },
        }
    }

    pub async fn create(&self, uuid: Uuid, item_type: ItemType, write: EntityWrite) -> TesseraResult<Sid> {
        self.write.create(uuid, item_type, write).await
    }

    pub async fn update(&self, uuid: Uuid, write: EntityWrite, base_sid: Option<Sid>) -> TesseraResult<Sid> {
        self.write.update(uuid, write, base_sid).await
    }

    pub async fn get_by_unique_key(&self, name: &str, value: &str) -> TesseraResult<EntityRecord> {
        self.write.get_by_unique_key(name, value).await
    }

    /// Which of `keys` are already owned by an entity other than `uuid`.
    pub async fn unique_key_conflicts(&self, uuid: Uuid, keys: &[UniqueKey]) -> TesseraResult<Vec<UniqueKey>> {
        let owners: BTreeMap<UniqueKey, Uuid> = self.write.unique_key_owners(keys).await?;
        Ok(owners
            .into_iter()
            .filter(|(_, owner)| *owner != uuid)
            .map(|(key, _)| key)
            .collect())
    }

    pub async fn purge(&self, uuid: Uuid) -> TesseraResult<()> {
        self.write.purge(uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_store::InMemoryReadStore;
    use crate::write_store::InMemoryWriteStore;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};
    use tessera_core::Properties;

    struct Fixture {
        write: Arc<InMemoryWriteStore>,
        read: Arc<InMemoryReadStore>,
        router: StorageRouter,
    }

    fn fixture() -> Fixture {
        let write = Arc::new(InMemoryWriteStore::new());
        let read = Arc::new(InMemoryReadStore::new());
        let router = StorageRouter::new(write.clone(), read.clone());
        Fixture { write, read, router }
    }

    fn write_of(name: &str) -> EntityWrite {
        let mut props = Properties::new();
        props.insert("name".to_string(), json!(name));
        EntityWrite::new(props)
    }

    fn view_of(uuid: Uuid, sid: Sid) -> CachedView {
        CachedView {
            uuid,
            item_type: ItemType::new("Lab"),
            embedded: json!({"name": "cached"}),
            sid,
            max_sid: sid,
            linked_uuids: BTreeSet::new(),
            rev_links: BTreeMap::new(),
        }
    }

    #[test]
    fn test_transactional_ops_always_use_write_store() {
        let f = fixture();
        for op in [StoreOp::Create, StoreOp::Update, StoreOp::Purge, StoreOp::GetByUniqueKey] {
            assert_eq!(f.router.route(op, Some(StoreKind::Read)), StoreKind::Write);
            assert_eq!(f.router.route(op, None), StoreKind::Write);
        }
    }

    #[test]
    fn test_get_defaults_to_read_store() {
        let f = fixture();
        assert_eq!(f.router.route(StoreOp::Get, None), StoreKind::Read);
        assert_eq!(
            f.router.route(StoreOp::Get, Some(StoreKind::Write)),
            StoreKind::Write
        );
    }

    #[test]
    fn test_preference_overridden_when_unavailable() {
        let f = fixture();
        f.read.set_available(false);
        assert_eq!(
            f.router.route(StoreOp::Get, Some(StoreKind::Read)),
            StoreKind::Write
        );
        f.read.set_available(true);
        f.write.set_available(false);
        assert_eq!(
            f.router.route(StoreOp::Get, Some(StoreKind::Write)),
            StoreKind::Read
        );
    }

    #[tokio::test]
    async fn test_get_serves_view_when_cached() {
        let f = fixture();
        let uuid = Uuid::now_v7();
        let sid = f
            .router
            .create(uuid, ItemType::new("Lab"), write_of("db"))
            .await
            .expect("create");
        f.read.put_view(view_of(uuid, sid)).await.expect("put");

        let fetched = f.router.get(uuid, None).await.expect("get");
        assert_eq!(fetched.served_by(), StoreKind::Read);
        assert_eq!(fetched.sid(), sid);
    }

    #[tokio::test]
    async fn test_get_falls_back_on_miss() {
        let f = fixture();
        let uuid = Uuid::now_v7();
        f.router
            .create(uuid, ItemType::new("Lab"), write_of("db"))
            .await
            .expect("create");

        let fetched = f.router.get(uuid, None).await.expect("get");
        assert_eq!(fetched.served_by(), StoreKind::Write);
        assert_eq!(fetched.uuid(), uuid);
    }

    #[tokio::test]
    async fn test_explicit_read_preference_does_not_fall_back() {
        let f = fixture();
        let uuid = Uuid::now_v7();
        f.router
            .create(uuid, ItemType::new("Lab"), write_of("db"))
            .await
            .expect("create");

        let err = f
            .router
            .get(uuid, Some(StoreKind::Read))
            .await
            .unwrap_err();
        assert_eq!(err, TesseraError::Storage(StorageError::NotFound { uuid }));
    }

    #[tokio::test]
    async fn test_get_does_not_mutate_stores() {
        let f = fixture();
        let uuid = Uuid::now_v7();
        f.router
            .create(uuid, ItemType::new("Lab"), write_of("db"))
            .await
            .expect("create");
        let before = f.write.max_sid().await.expect("max");
        f.router.get(uuid, None).await.expect("get");
        assert_eq!(f.write.max_sid().await.expect("max"), before);
        assert!(f.read.snapshot().expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_unique_key_conflicts_ignore_own_keys() {
        let f = fixture();
        let uuid = Uuid::now_v7();
        let key = UniqueKey::new("Lab:name", "db");
        f.router
            .create(uuid, ItemType::new("Lab"), write_of("db").with_unique_key(key.clone()))
            .await
            .expect("create");
        assert!(f
            .router
            .unique_key_conflicts(uuid, &[key.clone()])
            .await
            .expect("check")
            .is_empty());
        assert_eq!(
            f.router
                .unique_key_conflicts(Uuid::now_v7(), &[key.clone()])
                .await
                .expect("check"),
            vec![key]
        );
    }
}
