//! Entity records, link edges and unique keys

use crate::{Properties, Sid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Type tag of an entity, e.g. `"Experiment"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemType(String);

impl ItemType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ItemType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A (type, uuid) pair naming one unit of indexing work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub item_type: ItemType,
    pub uuid: Uuid,
}

impl EntityKey {
    pub fn new(item_type: impl Into<ItemType>, uuid: Uuid) -> Self {
        Self {
            item_type: item_type.into(),
            uuid,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_type, self.uuid)
    }
}

/// Directed reference from one entity's property to another entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkEdge {
    pub source: Uuid,
    pub field: String,
    pub target: Uuid,
}

impl LinkEdge {
    pub fn new(source: Uuid, field: impl Into<String>, target: Uuid) -> Self {
        Self {
            source,
            field: field.into(),
            target,
        }
    }
}

/// A (key-name, value) pair owned by exactly one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueKey {
    pub name: String,
    pub value: String,
}

impl UniqueKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Current canonical state of an entity as read from the Write Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub uuid: Uuid,
    pub item_type: ItemType,
    /// Sid of the current default-sheet row.
    pub sid: Sid,
    /// Default-sheet properties at `sid`.
    pub properties: Properties,
    /// Outgoing link edges, sorted.
    pub links: Vec<LinkEdge>,
    /// Unique keys owned by this entity, sorted.
    pub unique_keys: Vec<UniqueKey>,
}

impl EntityRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.item_type.clone(), self.uuid)
    }
}

/// Payload of one logical write: the new default sheet plus everything
/// derived from it that the Write Store must apply in the same transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub properties: Properties,
    /// Additional named sheets to store alongside the default sheet.
    pub sheets: BTreeMap<String, Properties>,
    /// Complete set of outgoing (field, target) links after this write.
    pub links: BTreeSet<(String, Uuid)>,
    /// Complete set of unique keys after this write.
    pub unique_keys: BTreeSet<UniqueKey>,
}

impl EntityWrite {
    pub fn new(properties: Properties) -> Self {
        Self {
            properties,
            ..Self::default()
        }
    }

    pub fn with_sheet(mut self, name: impl Into<String>, properties: Properties) -> Self {
        self.sheets.insert(name.into(), properties);
        self
    }

    pub fn with_link(mut self, field: impl Into<String>, target: Uuid) -> Self {
        self.links.insert((field.into(), target));
        self
    }

    pub fn with_unique_key(mut self, key: UniqueKey) -> Self {
        self.unique_keys.insert(key);
        self
    }
}

/// One retained default-sheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetRevision {
    pub sid: Sid,
    pub properties: Properties,
}

/// Top-level fields that differ between two property maps, formatted as
/// `"ItemType.field"` and sorted.
pub fn field_diff(item_type: &ItemType, old: &Properties, new: &Properties) -> Vec<String> {
    let mut changed: BTreeSet<&str> = BTreeSet::new();
    for (field, value) in new {
        if old.get(field) != Some(value) {
            changed.insert(field);
        }
    }
    for field in old.keys() {
        if !new.contains_key(field) {
            changed.insert(field);
        }
    }
    changed
        .into_iter()
        .map(|field| format!("{}.{}", item_type, field))
        .collect()
}
