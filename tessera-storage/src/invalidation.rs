//! Invalidation Scope Calculator
//!
//! Given a changed entity and an optional field-level diff, decides which
//! cached views must be rebuilt.
//!
//! The baseline scope is every view whose `linked_uuids` contains the entity
//! plus every entity that links to it. Without a diff (create, delete,
//! reindex) the baseline is returned as is. With a diff, a dependent of type
//! `T` is kept only if `T`'s embedded-field index reaches one of the changed
//! fields of the changed entity's type. Calculated-property dependencies
//! count as embedded; in [`InvalidationMode::CalculatedConservative`] a
//! dependent whose calculated properties read anything from the changed
//! type is kept regardless of the diff.
//!
//! Link changes reach the other direction too: an entity gaining or losing
//! an outgoing link changes its target's reverse links, so
//! [`InvalidationScope::link_targets`] names every target whose link set
//! differs across the revisions written since the last stored view.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tessera_core::{
    EmbeddedFields, EntityKey, EntityRecord, InvalidationMode, ItemType, Sid, StorageError,
    TesseraError, TesseraResult, TypeRegistry,
};
use uuid::Uuid;

use crate::read_store::ReadStore;
use crate::write_store::WriteStore;

/// Computes invalidation scopes against both stores.
#[derive(Clone)]
pub struct InvalidationScope {
    write: Arc<dyn WriteStore>,
    read: Arc<dyn ReadStore>,
    registry: Arc<TypeRegistry>,
    mode: InvalidationMode,
    /// Embedded-field index per registered type, built once.
    embedded: HashMap<ItemType, EmbeddedFields>,
}

impl InvalidationScope {
    pub fn new(
        write: Arc<dyn WriteStore>,
        read: Arc<dyn ReadStore>,
        registry: Arc<TypeRegistry>,
        mode: InvalidationMode,
    ) -> Self {
        let embedded = registry
            .type_names()
            .into_iter()
            .filter_map(|name| {
                let fields = registry.embedded_fields(&name)?;
                Some((name, fields))
            })
            .collect();
        Self {
            write,
            read,
            registry,
            mode,
            embedded,
        }
    }

    pub fn mode(&self) -> InvalidationMode {
        self.mode
    }

    /// Dependents of `uuid` whose views must be rebuilt.
    ///
    /// `diff` entries are `"ItemType.field"` or bare `"field"`; entries
    /// naming another registered type are ignored. `Some(&[])` means nothing
    /// changed and yields an empty scope.
    pub async fn scope(&self, uuid: Uuid, diff: Option<&[String]>) -> TesseraResult<BTreeSet<EntityKey>> {
        let candidates = self.baseline(uuid).await?;
        let Some(diff) = diff else {
            return Ok(candidates);
        };
        if self.mode == InvalidationMode::Disabled {
            return Ok(candidates);
        }

        let Some(changed_type) = self.changed_type(uuid).await? else {
            tracing::debug!(uuid = %uuid, "Changed entity type unknown, keeping baseline scope");
            return Ok(candidates);
        };
        let fields = self.changed_fields(&changed_type, diff);
        if fields.is_empty() {
            tracing::trace!(uuid = %uuid, "Diff names no fields of the changed type");
            return Ok(BTreeSet::new());
        }

        let before = candidates.len();
        let scope: BTreeSet<EntityKey> = candidates
            .into_iter()
            .filter(|dependent| self.reaches(&dependent.item_type, &changed_type, &fields))
            .collect();
        tracing::debug!(
            uuid = %uuid,
            item_type = %changed_type,
            baseline = before,
            kept = scope.len(),
            "Computed invalidation scope"
        );
        Ok(scope)
    }

    /// Link targets whose reverse links changed since the view stored at
    /// `since`.
    ///
    /// Every revision from `since` up to the current one is compared; a
    /// target linked in some but not all of them is returned. Without a
    /// stored view every current target counts as new. Targets missing from
    /// the Write Store are skipped.
    pub async fn link_targets(
        &self,
        record: &EntityRecord,
        since: Option<Sid>,
    ) -> TesseraResult<BTreeSet<EntityKey>> {
        let current: BTreeSet<(String, Uuid)> = record
            .links
            .iter()
            .map(|edge| (edge.field.clone(), edge.target))
            .collect();
        let mut revisions = vec![current];
        match since {
            None => revisions.push(BTreeSet::new()),
            Some(since) => {
                let info = self.registry.get(&record.item_type);
                for revision in self.write.history(record.uuid).await? {
                    if revision.sid < since || revision.sid >= record.sid {
                        continue;
                    }
                    let links = match info {
                        Some(info) => info.extract_links(&revision.properties)?,
                        None => BTreeSet::new(),
                    };
                    revisions.push(links);
                }
            }
        }

        let mut seen: BTreeSet<(String, Uuid)> = BTreeSet::new();
        for links in &revisions {
            seen.extend(links.iter().cloned());
        }
        let mut targets = BTreeSet::new();
        for (field, target) in seen {
            if target == record.uuid {
                continue;
            }
            let pair = (field, target);
            if revisions.iter().all(|links| links.contains(&pair)) {
                continue;
            }
            targets.insert(target);
        }

        let mut keys = BTreeSet::new();
        for target in targets {
            if let Some(item_type) = self.write.item_type_of(target).await? {
                keys.insert(EntityKey::new(item_type, target));
            }
        }
        if !keys.is_empty() {
            tracing::debug!(uuid = %record.uuid, targets = keys.len(), "Link targets changed");
        }
        Ok(keys)
    }

    /// Whether a view of `dependent` reads any of `fields` of `changed`.
    pub fn reaches(&self, dependent: &ItemType, changed: &ItemType, fields: &[String]) -> bool {
        let Some(embedded) = self.embedded.get(dependent) else {
            // Unregistered dependent: nothing says what it reads.
            return true;
        };
        if self.mode == InvalidationMode::CalculatedConservative
            && embedded.calculated_types.contains(changed)
        {
            return true;
        }
        fields.iter().any(|field| embedded.covers(changed, field))
    }

    async fn baseline(&self, uuid: Uuid) -> TesseraResult<BTreeSet<EntityKey>> {
        let mut keys: BTreeSet<EntityKey> =
            self.read.find_dependents(uuid).await?.into_iter().collect();

        let sources: BTreeSet<Uuid> = match self.read.get_view(uuid).await {
            Ok(view) => view.rev_linked_uuids(),
            Err(TesseraError::Storage(StorageError::NotFound { .. })) => self
                .write
                .rev_links(uuid)
                .await?
                .into_iter()
                .map(|edge| edge.source)
                .collect(),
            Err(e) => return Err(e),
        };
        for source in sources {
            if source == uuid {
                continue;
            }
            if let Some(item_type) = self.write.item_type_of(source).await? {
                keys.insert(EntityKey::new(item_type, source));
            }
        }
        keys.retain(|key| key.uuid != uuid);
        Ok(keys)
    }

    async fn changed_type(&self, uuid: Uuid) -> TesseraResult<Option<ItemType>> {
        if let Some(item_type) = self.write.item_type_of(uuid).await? {
            return Ok(Some(item_type));
        }
        match self.read.get_view(uuid).await {
            Ok(view) => Ok(Some(view.item_type)),
            Err(TesseraError::Storage(StorageError::NotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Field paths of `changed_type` named by `diff`.
    fn changed_fields(&self, changed_type: &ItemType, diff: &[String]) -> Vec<String> {
        let own_prefix = format!("{}.", changed_type);
        diff.iter()
            .filter_map(|entry| {
                if let Some(field) = entry.strip_prefix(&own_prefix) {
                    return Some(field.to_string());
                }
                match entry.split_once('.') {
                    Some((prefix, _)) if self.registry.contains(prefix) => None,
                    _ => Some(entry.clone()),
                }
            })
            .collect()
    }
}
