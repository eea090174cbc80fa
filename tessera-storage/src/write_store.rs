//! Write Store - transactional source of truth
//!
//! Persisted layout, one table per concern:
//!
//! - property sheets keyed by (uuid, sheet name, sid); old rows are kept
//! - current-sid pointers keyed by (uuid, sheet name)
//! - link edges (source, field, target), indexed both ways
//! - unique keys (name, value) -> owning uuid
//!
//! Every multi-row effect of one logical write is applied under a single
//! lock, so readers never observe a half-applied write.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tessera_core::{
    EntityKey, EntityRecord, EntityWrite, ItemType, LinkEdge, Properties, SheetRevision, Sid,
    StorageError, StoreKind, TesseraResult, UniqueKey, DEFAULT_SHEET,
};
use uuid::Uuid;

use crate::sequence::SequenceAllocator;

// ============================================================================
// TRAIT
// ============================================================================

/// Transactional store holding canonical entity state.
#[async_trait]
pub trait WriteStore: Send + Sync {
    /// Create a new entity. Fails with a conflict if the uuid exists or a
    /// unique key belongs to another entity.
    async fn create(&self, uuid: Uuid, item_type: ItemType, write: EntityWrite) -> TesseraResult<Sid>;

    /// Replace the default sheet. With `base_sid`, fails with
    /// `StaleWrite` unless it equals the current sid.
    async fn update(&self, uuid: Uuid, write: EntityWrite, base_sid: Option<Sid>) -> TesseraResult<Sid>;

    /// Current default sheet, sid, link edges and unique keys.
    async fn get(&self, uuid: Uuid) -> TesseraResult<EntityRecord>;

    async fn get_by_unique_key(&self, name: &str, value: &str) -> TesseraResult<EntityRecord>;

    /// Owners of any of `keys` that are already taken.
    async fn unique_key_owners(&self, keys: &[UniqueKey]) -> TesseraResult<BTreeMap<UniqueKey, Uuid>>;

    /// Current row of a named sheet, if one was ever written.
    async fn sheet(&self, uuid: Uuid, name: &str) -> TesseraResult<Option<Properties>>;

    /// Every retained default-sheet row, oldest first.
    async fn history(&self, uuid: Uuid) -> TesseraResult<Vec<SheetRevision>>;

    /// Remove every row, edge and key of `uuid`. Fails with
    /// `ReferentialIntegrity` while another entity links to it.
    async fn purge(&self, uuid: Uuid) -> TesseraResult<()>;

    /// Live edges whose target is `uuid`.
    async fn rev_links(&self, uuid: Uuid) -> TesseraResult<Vec<LinkEdge>>;

    /// Highest sid committed to any entity, or 0.
    async fn max_sid(&self) -> TesseraResult<Sid>;

    /// Current default-sheet sids; uuids that do not exist are omitted.
    async fn current_sids(&self, uuids: &[Uuid]) -> TesseraResult<HashMap<Uuid, Sid>>;

    async fn item_type_of(&self, uuid: Uuid) -> TesseraResult<Option<ItemType>>;

    /// Entities of the given types (all types when `None`), ordered by type
    /// name and then creation order.
    async fn list(&self, types: Option<&[ItemType]>) -> TesseraResult<Vec<EntityKey>>;

    fn is_available(&self) -> bool {
        true
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

#[derive(Debug, Clone)]
struct ResourceRow {
    item_type: ItemType,
    created_sid: Sid,
}

#[derive(Debug, Default)]
struct WriteState {
    resources: HashMap<Uuid, ResourceRow>,
    sheets: BTreeMap<(Uuid, String, Sid), Properties>,
    current: HashMap<(Uuid, String), Sid>,
    links_by_source: HashMap<Uuid, BTreeSet<LinkEdge>>,
    links_by_target: HashMap<Uuid, BTreeSet<LinkEdge>>,
    keys: BTreeMap<UniqueKey, Uuid>,
    keys_by_owner: HashMap<Uuid, BTreeSet<UniqueKey>>,
    max_sid: Sid,
}

impl WriteState {
    fn record(&self, uuid: Uuid) -> Result<EntityRecord, StorageError> {
        let resource = self
            .resources
            .get(&uuid)
            .ok_or(StorageError::NotFound { uuid })?;
        let sid = self
            .current
            .get(&(uuid, DEFAULT_SHEET.to_string()))
            .copied()
            .ok_or(StorageError::NotFound { uuid })?;
        let properties = self
            .sheets
            .get(&(uuid, DEFAULT_SHEET.to_string(), sid))
            .cloned()
            .unwrap_or_default();
        Ok(EntityRecord {
            uuid,
            item_type: resource.item_type.clone(),
            sid,
            properties,
            links: self
                .links_by_source
                .get(&uuid)
                .map(|edges| edges.iter().cloned().collect())
                .unwrap_or_default(),
            unique_keys: self
                .keys_by_owner
                .get(&uuid)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        })
    }

    fn key_conflicts(&self, uuid: Uuid, keys: &BTreeSet<UniqueKey>) -> Vec<UniqueKey> {
        keys.iter()
            .filter(|key| matches!(self.keys.get(*key), Some(owner) if *owner != uuid))
            .cloned()
            .collect()
    }

    fn write_sheets(&mut self, uuid: Uuid, sid: Sid, write: &EntityWrite) {
        self.sheets.insert(
            (uuid, DEFAULT_SHEET.to_string(), sid),
            write.properties.clone(),
        );
        self.current.insert((uuid, DEFAULT_SHEET.to_string()), sid);
        for (name, properties) in &write.sheets {
            self.sheets.insert((uuid, name.clone(), sid), properties.clone());
            self.current.insert((uuid, name.clone()), sid);
        }
    }

    fn apply_links(&mut self, uuid: Uuid, links: &BTreeSet<(String, Uuid)>) {
        let wanted: BTreeSet<LinkEdge> = links
            .iter()
            .map(|(field, target)| LinkEdge::new(uuid, field.clone(), *target))
            .collect();
        let existing = self.links_by_source.remove(&uuid).unwrap_or_default();

        for edge in existing.difference(&wanted) {
            if let Some(edges) = self.links_by_target.get_mut(&edge.target) {
                edges.remove(edge);
                if edges.is_empty() {
                    self.links_by_target.remove(&edge.target);
                }
            }
        }
        for edge in wanted.difference(&existing) {
            self.links_by_target
                .entry(edge.target)
                .or_default()
                .insert(edge.clone());
        }
        if !wanted.is_empty() {
            self.links_by_source.insert(uuid, wanted);
        }
    }

    fn apply_keys(&mut self, uuid: Uuid, keys: &BTreeSet<UniqueKey>) {
        let existing = self.keys_by_owner.remove(&uuid).unwrap_or_default();
        for key in existing.difference(keys) {
            self.keys.remove(key);
        }
        for key in keys.difference(&existing) {
            self.keys.insert(key.clone(), uuid);
        }
        if !keys.is_empty() {
            self.keys_by_owner.insert(uuid, keys.clone());
        }
    }
}

/// In-memory transactional Write Store.
///
/// A single lock covers all tables and sid allocation happens while it is
/// held, so sids are committed in allocation order and `max_sid` never
/// names an uncommitted write.
#[derive(Debug)]
pub struct InMemoryWriteStore {
    state: RwLock<WriteState>,
    sequence: SequenceAllocator,
    available: AtomicBool,
}

impl Default for InMemoryWriteStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(WriteState::default()),
            sequence: SequenceAllocator::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryWriteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// `StorageError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn read(&self) -> TesseraResult<RwLockReadGuard<'_, WriteState>> {
        self.ensure_available()?;
        self.state
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> TesseraResult<RwLockWriteGuard<'_, WriteState>> {
        self.ensure_available()?;
        self.state
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn ensure_available(&self) -> TesseraResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                store: StoreKind::Write,
            }
            .into())
        }
    }
}

#[async_trait]
impl WriteStore for InMemoryWriteStore {
    async fn create(&self, uuid: Uuid, item_type: ItemType, write: EntityWrite) -> TesseraResult<Sid> {
        let mut state = self.write()?;
        if state.resources.contains_key(&uuid) {
            return Err(StorageError::UuidConflict { uuid }.into());
        }
        let conflicts = state.key_conflicts(uuid, &write.unique_keys);
        if !conflicts.is_empty() {
            return Err(StorageError::KeyConflict { keys: conflicts }.into());
        }

        let sid = self.sequence.next_sid();
        state.resources.insert(
            uuid,
            ResourceRow {
                item_type: item_type.clone(),
                created_sid: sid,
            },
        );
        state.write_sheets(uuid, sid, &write);
        state.apply_links(uuid, &write.links);
        state.apply_keys(uuid, &write.unique_keys);
        state.max_sid = sid;

        tracing::debug!(uuid = %uuid, item_type = %item_type, sid, "Created entity");
        Ok(sid)
    }

    async fn update(&self, uuid: Uuid, write: EntityWrite, base_sid: Option<Sid>) -> TesseraResult<Sid> {
        let mut state = self.write()?;
        if !state.resources.contains_key(&uuid) {
            return Err(StorageError::NotFound { uuid }.into());
        }
        let current = state
            .current
            .get(&(uuid, DEFAULT_SHEET.to_string()))
            .copied()
            .unwrap_or(0);
        if let Some(expected) = base_sid {
            if expected != current {
                return Err(StorageError::StaleWrite {
                    uuid,
                    expected,
                    actual: current,
                }
                .into());
            }
        }
        let conflicts = state.key_conflicts(uuid, &write.unique_keys);
        if !conflicts.is_empty() {
            return Err(StorageError::KeyConflict { keys: conflicts }.into());
        }

        let sid = self.sequence.next_sid();
        state.write_sheets(uuid, sid, &write);
        state.apply_links(uuid, &write.links);
        state.apply_keys(uuid, &write.unique_keys);
        state.max_sid = sid;

        tracing::debug!(uuid = %uuid, previous_sid = current, sid, "Updated entity");
        Ok(sid)
    }

    async fn get(&self, uuid: Uuid) -> TesseraResult<EntityRecord> {
        Ok(self.read()?.record(uuid)?)
    }

    async fn get_by_unique_key(&self, name: &str, value: &str) -> TesseraResult<EntityRecord> {
        let state = self.read()?;
        let owner = state
            .keys
            .get(&UniqueKey::new(name, value))
            .copied()
            .ok_or_else(|| StorageError::KeyNotFound {
                name: name.to_string(),
                value: value.to_string(),
            })?;
        Ok(state.record(owner)?)
    }

    async fn unique_key_owners(&self, keys: &[UniqueKey]) -> TesseraResult<BTreeMap<UniqueKey, Uuid>> {
        let state = self.read()?;
        Ok(keys
            .iter()
            .filter_map(|key| state.keys.get(key).map(|owner| (key.clone(), *owner)))
            .collect())
    }

    async fn sheet(&self, uuid: Uuid, name: &str) -> TesseraResult<Option<Properties>> {
        let state = self.read()?;
        if !state.resources.contains_key(&uuid) {
            return Err(StorageError::NotFound { uuid }.into());
        }
        Ok(state
            .current
            .get(&(uuid, name.to_string()))
            .and_then(|sid| state.sheets.get(&(uuid, name.to_string(), *sid)))
            .cloned())
    }

    async fn history(&self, uuid: Uuid) -> TesseraResult<Vec<SheetRevision>> {
        let state = self.read()?;
        if !state.resources.contains_key(&uuid) {
            return Err(StorageError::NotFound { uuid }.into());
        }
        let start = (uuid, DEFAULT_SHEET.to_string(), Sid::MIN);
        let end = (uuid, DEFAULT_SHEET.to_string(), Sid::MAX);
        Ok(state
            .sheets
            .range(start..=end)
            .map(|((_, _, sid), properties)| SheetRevision {
                sid: *sid,
                properties: properties.clone(),
            })
            .collect())
    }

    async fn purge(&self, uuid: Uuid) -> TesseraResult<()> {
        let mut state = self.write()?;
        if !state.resources.contains_key(&uuid) {
            return Err(StorageError::NotFound { uuid }.into());
        }
        let linked_from: BTreeSet<Uuid> = state
            .links_by_target
            .get(&uuid)
            .map(|edges| {
                edges
                    .iter()
                    .map(|edge| edge.source)
                    .filter(|source| *source != uuid)
                    .collect()
            })
            .unwrap_or_default();
        if !linked_from.is_empty() {
            return Err(StorageError::ReferentialIntegrity {
                uuid,
                linked_from: linked_from.into_iter().collect(),
            }
            .into());
        }

        state.apply_links(uuid, &BTreeSet::new());
        state.apply_keys(uuid, &BTreeSet::new());
        state.links_by_target.remove(&uuid);
        state.sheets.retain(|(owner, _, _), _| *owner != uuid);
        state.current.retain(|(owner, _), _| *owner != uuid);
        state.resources.remove(&uuid);

        tracing::info!(uuid = %uuid, "Purged entity");
        Ok(())
    }

    async fn rev_links(&self, uuid: Uuid) -> TesseraResult<Vec<LinkEdge>> {
        let state = self.read()?;
        Ok(state
            .links_by_target
            .get(&uuid)
            .map(|edges| edges.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn max_sid(&self) -> TesseraResult<Sid> {
        Ok(self.read()?.max_sid)
    }

    async fn current_sids(&self, uuids: &[Uuid]) -> TesseraResult<HashMap<Uuid, Sid>> {
        let state = self.read()?;
        Ok(uuids
            .iter()
            .filter_map(|uuid| {
                state
                    .current
                    .get(&(*uuid, DEFAULT_SHEET.to_string()))
                    .map(|sid| (*uuid, *sid))
            })
            .collect())
    }

    async fn item_type_of(&self, uuid: Uuid) -> TesseraResult<Option<ItemType>> {
        Ok(self
            .read()?
            .resources
            .get(&uuid)
            .map(|row| row.item_type.clone()))
    }

    async fn list(&self, types: Option<&[ItemType]>) -> TesseraResult<Vec<EntityKey>> {
        let state = self.read()?;
        let mut rows: Vec<(&ItemType, Sid, Uuid)> = state
            .resources
            .iter()
            .filter(|(_, row)| types.map_or(true, |wanted| wanted.contains(&row.item_type)))
            .map(|(uuid, row)| (&row.item_type, row.created_sid, *uuid))
            .collect();
        rows.sort();
        Ok(rows
            .into_iter()
            .map(|(item_type, _, uuid)| EntityKey::new(item_type.clone(), uuid))
            .collect())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TESTS
// ============================================================================
