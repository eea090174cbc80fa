//! Cached view documents and staleness vocabulary

use crate::{EntityKey, ItemType, Sid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A fully embedded, read-optimized document for one entity.
///
/// Views are replaced whole on every rebuild; nothing ever patches one in
/// place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedView {
    pub uuid: Uuid,
    pub item_type: ItemType,
    /// Embedded representation built by the resolver.
    pub embedded: Value,
    /// Write-store sid of the entity when the view was built.
    pub sid: Sid,
    /// Global watermark when the view was built.
    pub max_sid: Sid,
    /// Every uuid visited while embedding, excluding the entity itself.
    pub linked_uuids: BTreeSet<Uuid>,
    /// Field name to the uuids whose link through that field targets this
    /// entity.
    pub rev_links: BTreeMap<String, BTreeSet<Uuid>>,
}

impl CachedView {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.item_type.clone(), self.uuid)
    }

    /// All uuids that reverse-link to this entity, across fields.
    pub fn rev_linked_uuids(&self) -> BTreeSet<Uuid> {
        self.rev_links.values().flatten().copied().collect()
    }

    /// SHA-256 over the content that a rebuild must reproduce exactly.
    ///
    /// `sid` and `max_sid` are left out; two rebuilds from the same source
    /// state share a fingerprint even if the watermark moved in between.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "uuid": self.uuid,
            "item_type": self.item_type,
            "embedded": self.embedded,
            "linked_uuids": self.linked_uuids,
            "rev_links": self.rev_links,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Why a cached view no longer reflects the Write Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleReason {
    /// The entity itself was written after the view was built.
    EntityAdvanced { view_sid: Sid, current_sid: Sid },
    /// A linked entity was written after the view's watermark.
    LinkAdvanced { uuid: Uuid, current_sid: Sid },
    /// The entity was purged but its view remains.
    EntityPurged,
    /// Links into the entity were added or removed after the view was built.
    RevLinksChanged,
}

/// Result of comparing one cached view against the Write Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewState {
    Fresh,
    Stale(Vec<StaleReason>),
    Missing,
}

impl ViewState {
    pub fn is_fresh(&self) -> bool {
        matches!(self, ViewState::Fresh)
    }
}
