//! Error types for Tessera operations

use crate::{ItemType, Sid, UniqueKey};
use thiserror::Error;
use uuid::Uuid;

/// Which of the two stores an error or routing decision refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StoreKind {
    /// Transactional source of truth.
    Write,
    /// Denormalized cached views.
    Read,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Write => write!(f, "write store"),
            StoreKind::Read => write!(f, "read store"),
        }
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("UUID conflict: {uuid} already exists")]
    UuidConflict { uuid: Uuid },

    #[error("Keys conflict: {keys:?}")]
    KeyConflict { keys: Vec<UniqueKey> },

    #[error("Stale write for {uuid}: expected sid {expected}, current sid {actual}")]
    StaleWrite { uuid: Uuid, expected: Sid, actual: Sid },

    #[error("Entity not found: {uuid}")]
    NotFound { uuid: Uuid },

    #[error("No entity owns unique key {name}={value}")]
    KeyNotFound { name: String, value: String },

    #[error("Cannot purge {uuid}: still linked from {linked_from:?}")]
    ReferentialIntegrity { uuid: Uuid, linked_from: Vec<Uuid> },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("{store} unavailable")]
    Unavailable { store: StoreKind },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Whether the caller hit a uuid or unique-key collision.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::UuidConflict { .. } | StorageError::KeyConflict { .. }
        )
    }
}

/// Errors raised while rebuilding and writing cached views.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IndexError {
    #[error("Transient index failure for {uuid}: {reason}")]
    Transient { uuid: Uuid, reason: String },

    #[error("Indexing {uuid} failed permanently after {attempts} attempts: {reason}")]
    Permanent {
        uuid: Uuid,
        attempts: u32,
        reason: String,
    },

    #[error("Indexing {uuid} timed out after {elapsed_ms}ms")]
    Timeout { uuid: Uuid, elapsed_ms: u64 },
}

/// Validation errors for registry declarations and entity payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown item type: {item_type}")]
    UnknownItemType { item_type: ItemType },

    #[error("Invalid embed path {path:?} on {item_type}: {reason}")]
    InvalidEmbedPath {
        item_type: ItemType,
        path: String,
        reason: String,
    },

    #[error("Invalid link value in {item_type}.{field}: {reason}")]
    InvalidLink {
        item_type: ItemType,
        field: String,
        reason: String,
    },

    #[error("Item type {item_type} is already registered")]
    DuplicateItemType { item_type: ItemType },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Tessera errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TesseraError::Index(IndexError::Transient { .. })
                | TesseraError::Index(IndexError::Timeout { .. })
                | TesseraError::Storage(StorageError::Unavailable { .. })
                | TesseraError::Storage(StorageError::TransactionFailed { .. })
        )
    }
}

/// Result type alias for Tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

/// Surfaced when embedding hits a link whose target is missing.
///
/// Not an error: resolution writes `null` in place of the target and keeps
/// going.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DanglingLinkWarning {
    pub source: Uuid,
    pub field: String,
    pub target: Uuid,
}

impl std::fmt::Display for DanglingLinkWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dangling link {}.{} -> {}",
            self.source, self.field, self.target
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================
