//! LMDB-backed Read Store.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped,
//! durable view store.
//!
//! # Layout
//!
//! - `views`: uuid bytes -> JSON-encoded [`CachedView`]
//! - `dependents`: linked uuid bytes ++ view uuid bytes -> item type
//!
//! Replacing a view rewrites its dependents entries in the same write
//! transaction, so a reader never sees an index that disagrees with the
//! stored view.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Reads use read transactions, `put_view`
//! and `delete_view` use one write transaction each. Statistics sit behind a
//! lock and are best-effort.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use tessera_core::{
    CachedView, EntityKey, ItemType, Sid, StorageError, TesseraError, TesseraResult,
};
use uuid::Uuid;

use super::{ReadStore, ReadStoreStats};

/// Error type for LMDB read store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbReadError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbReadError> for TesseraError {
    fn from(e: LmdbReadError) -> Self {
        TesseraError::Storage(StorageError::TransactionFailed {
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> LmdbReadError {
    LmdbReadError::Transaction(e.to_string())
}

fn dependent_key(linked: Uuid, view: Uuid) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(linked.as_bytes());
    key[16..].copy_from_slice(view.as_bytes());
    key
}

/// LMDB-backed Read Store.
///
/// # Example
///
/// ```ignore
/// use tessera_storage::{LmdbReadStore, ReadStore};
///
/// let store = LmdbReadStore::new("/var/lib/tessera/views", 1024)?;
/// store.put_view(view).await?;
/// let cached = store.get_view(uuid).await?;
/// ```
pub struct LmdbReadStore {
    env: Env,
    views: Database<Bytes, Bytes>,
    dependents: Database<Bytes, Bytes>,
    stats: RwLock<ReadStoreStats>,
}

impl LmdbReadStore {
    /// Open (or create) a store under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Either database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbReadError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbReadError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let views: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("views"))
            .map_err(|e| LmdbReadError::DbOpen(e.to_string()))?;
        let dependents: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("dependents"))
            .map_err(|e| LmdbReadError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        let store = Self {
            env,
            views,
            dependents,
            stats: RwLock::new(ReadStoreStats::default()),
        };
        let existing = store.all_views()?.len() as u64;
        if let Ok(mut stats) = store.stats.write() {
            stats.view_count = existing;
        }
        Ok(store)
    }

    fn decode(bytes: &[u8]) -> Result<CachedView, LmdbReadError> {
        serde_json::from_slice(bytes).map_err(|e| LmdbReadError::Deserialization(e.to_string()))
    }

    fn load(&self, uuid: Uuid) -> Result<Option<CachedView>, LmdbReadError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.views.get(&rtxn, uuid.as_bytes()).map_err(txn_err)? {
            Some(bytes) => Ok(Some(Self::decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn all_views(&self) -> Result<Vec<CachedView>, LmdbReadError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = Vec::new();
        for entry in self.views.iter(&rtxn).map_err(txn_err)? {
            let (_, bytes) = entry.map_err(txn_err)?;
            out.push(Self::decode(bytes)?);
        }
        Ok(out)
    }

    /// Remove the stored view and its dependents entries inside `wtxn`.
    fn remove_in(&self, wtxn: &mut RwTxn<'_>, uuid: Uuid) -> Result<bool, LmdbReadError> {
        let previous = match self.views.get(wtxn, uuid.as_bytes()).map_err(txn_err)? {
            Some(bytes) => Self::decode(bytes)?,
            None => return Ok(false),
        };
        for linked in &previous.linked_uuids {
            self.dependents
                .delete(wtxn, &dependent_key(*linked, uuid))
                .map_err(txn_err)?;
        }
        self.views.delete(wtxn, uuid.as_bytes()).map_err(txn_err)?;
        Ok(true)
    }

    fn bump<F: FnOnce(&mut ReadStoreStats)>(&self, update: F) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }
}

#[async_trait]
impl ReadStore for LmdbReadStore {
    async fn put_view(&self, view: CachedView) -> TesseraResult<()> {
        let bytes =
            serde_json::to_vec(&view).map_err(|e| LmdbReadError::Serialization(e.to_string()))?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let replaced = self.remove_in(&mut wtxn, view.uuid)?;
        self.views
            .put(&mut wtxn, view.uuid.as_bytes(), &bytes)
            .map_err(txn_err)?;
        for linked in &view.linked_uuids {
            self.dependents
                .put(
                    &mut wtxn,
                    &dependent_key(*linked, view.uuid),
                    view.item_type.as_str().as_bytes(),
                )
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;

        self.bump(|stats| {
            stats.puts += 1;
            if !replaced {
                stats.view_count += 1;
            }
        });
        Ok(())
    }

    async fn get_view(&self, uuid: Uuid) -> TesseraResult<CachedView> {
        match self.load(uuid)? {
            Some(view) => {
                self.bump(|stats| stats.hits += 1);
                Ok(view)
            }
            None => {
                self.bump(|stats| stats.misses += 1);
                Err(StorageError::NotFound { uuid }.into())
            }
        }
    }

    async fn delete_view(&self, uuid: Uuid) -> TesseraResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.remove_in(&mut wtxn, uuid)?;
        wtxn.commit().map_err(txn_err)?;
        if deleted {
            self.bump(|stats| {
                stats.deletes += 1;
                stats.view_count = stats.view_count.saturating_sub(1);
            });
        }
        Ok(deleted)
    }

    async fn get_max_sid(&self) -> TesseraResult<Sid> {
        Ok(self
            .all_views()?
            .iter()
            .map(|view| view.max_sid)
            .max()
            .unwrap_or(0))
    }

    async fn find_dependents(&self, uuid: Uuid) -> TesseraResult<Vec<EntityKey>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = Vec::new();
        let iter = self
            .dependents
            .prefix_iter(&rtxn, uuid.as_bytes())
            .map_err(txn_err)?;
        for entry in iter {
            let (key, value) = entry.map_err(txn_err)?;
            let source = Uuid::from_slice(&key[16..])
                .map_err(|e| LmdbReadError::Deserialization(e.to_string()))?;
            let item_type = String::from_utf8(value.to_vec())
                .map_err(|e| LmdbReadError::Deserialization(e.to_string()))?;
            out.push(EntityKey::new(item_type, source));
        }
        Ok(out)
    }

    async fn view_sids(&self, uuids: &[Uuid]) -> TesseraResult<HashMap<Uuid, Sid>> {
        let mut out = HashMap::new();
        for uuid in uuids {
            if let Some(view) = self.load(*uuid)? {
                out.insert(*uuid, view.sid);
            }
        }
        Ok(out)
    }

    async fn count(&self, item_type: &ItemType) -> TesseraResult<usize> {
        Ok(self
            .all_views()?
            .iter()
            .filter(|view| &view.item_type == item_type)
            .count())
    }

    fn stats(&self) -> ReadStoreStats {
        self.stats
            .read()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}
