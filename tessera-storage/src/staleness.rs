//! Staleness detection for cached views.
//!
//! A view records two watermarks: `sid`, the entity's own sid when the view
//! was built, and `max_sid`, the global watermark observed just before
//! resolving. The view is stale when the entity has since been written, or
//! when any uuid in `linked_uuids` now carries a sid above `max_sid`, or
//! when its recorded reverse links no longer match the Write Store's edges.
//! Staleness is detected, never prevented; the pipeline re-triggers rebuilds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tessera_core::{
    CachedView, EntityKey, ItemType, Sid, StaleReason, StorageError, TesseraError, TesseraResult,
    ViewState,
};
use uuid::Uuid;

use crate::read_store::ReadStore;
use crate::write_store::WriteStore;

/// Views of one or more types that do not match the Write Store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalenessReport {
    /// Write-store entities examined.
    pub checked: usize,
    pub stale: Vec<(EntityKey, Vec<StaleReason>)>,
    pub missing: Vec<EntityKey>,
}

impl StalenessReport {
    pub fn is_clean(&self) -> bool {
        self.stale.is_empty() && self.missing.is_empty()
    }

    /// Uuids needing a rebuild, stale first, then missing.
    pub fn uuids(&self) -> Vec<Uuid> {
        self.stale
            .iter()
            .map(|(key, _)| key.uuid)
            .chain(self.missing.iter().map(|key| key.uuid))
            .collect()
    }
}

/// Compares cached views with canonical state.
#[derive(Clone)]
pub struct StalenessChecker {
    write: Arc<dyn WriteStore>,
    read: Arc<dyn ReadStore>,
}

impl StalenessChecker {
    pub fn new(write: Arc<dyn WriteStore>, read: Arc<dyn ReadStore>) -> Self {
        Self { write, read }
    }

    /// Reasons `view` no longer reflects the Write Store; empty when fresh.
    pub async fn is_stale(&self, view: &CachedView) -> TesseraResult<Vec<StaleReason>> {
        let mut uuids: Vec<Uuid> = Vec::with_capacity(view.linked_uuids.len() + 1);
        uuids.push(view.uuid);
        uuids.extend(view.linked_uuids.iter().copied());
        let current = self.write.current_sids(&uuids).await?;

        let Some(&entity_sid) = current.get(&view.uuid) else {
            return Ok(vec![StaleReason::EntityPurged]);
        };
        let mut reasons = Vec::new();
        if entity_sid > view.sid {
            reasons.push(StaleReason::EntityAdvanced {
                view_sid: view.sid,
                current_sid: entity_sid,
            });
        }
        // A linked uuid missing from the Write Store was rendered as null at
        // build time and is not a reason on its own.
        for linked in &view.linked_uuids {
            if let Some(&sid) = current.get(linked) {
                if sid > view.max_sid {
                    reasons.push(StaleReason::LinkAdvanced {
                        uuid: *linked,
                        current_sid: sid,
                    });
                }
            }
        }

        let mut rev_links: BTreeMap<String, BTreeSet<Uuid>> = BTreeMap::new();
        for edge in self.write.rev_links(view.uuid).await? {
            if edge.source != view.uuid {
                rev_links.entry(edge.field).or_default().insert(edge.source);
            }
        }
        if rev_links != view.rev_links {
            reasons.push(StaleReason::RevLinksChanged);
        }
        Ok(reasons)
    }

    /// State of the cached view for `uuid`.
    pub async fn check_view(&self, uuid: Uuid) -> TesseraResult<ViewState> {
        match self.read.get_view(uuid).await {
            Ok(view) => {
                let reasons = self.is_stale(&view).await?;
                if reasons.is_empty() {
                    Ok(ViewState::Fresh)
                } else {
                    tracing::debug!(uuid = %uuid, reasons = reasons.len(), "Cached view is stale");
                    Ok(ViewState::Stale(reasons))
                }
            }
            Err(TesseraError::Storage(StorageError::NotFound { .. })) => {
                match self.write.item_type_of(uuid).await? {
                    Some(_) => Ok(ViewState::Missing),
                    None => Ok(ViewState::Fresh),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Check every write-store entity of `types` (all types when `None`).
    pub async fn report(&self, types: Option<&[ItemType]>) -> TesseraResult<StalenessReport> {
        let mut report = StalenessReport::default();
        for key in self.write.list(types).await? {
            report.checked += 1;
            match self.check_view(key.uuid).await? {
                ViewState::Fresh => {}
                ViewState::Stale(reasons) => report.stale.push((key, reasons)),
                ViewState::Missing => report.missing.push(key),
            }
        }
        if !report.is_clean() {
            tracing::info!(
                checked = report.checked,
                stale = report.stale.len(),
                missing = report.missing.len(),
                "Staleness report"
            );
        }
        Ok(report)
    }

    /// How far the Read Store's watermark trails the Write Store's.
    pub async fn global_lag(&self) -> TesseraResult<Sid> {
        let write_max = self.write.max_sid().await?;
        let read_max = self.read.get_max_sid().await?;
        Ok((write_max - read_max).max(0))
    }
}
