//! Tessera Test Utilities
//!
//! Shared test infrastructure for the Tessera workspace:
//! - Proptest generators for identities, properties, messages and config
//! - Fixtures: ready-made type registries and in-memory stores
//! - Assertions for Tessera-specific error and view checks

pub use tessera_storage::{InMemoryReadStore, InMemoryWriteStore};

pub use tessera_core::{
    CachedView, CalculatedProperty, ConfigError, EntityKey, EntityRecord, IndexMessage,
    InvalidationMode, ItemType, PipelineConfig, Properties, QueueLane, RetryConfig, Sid,
    StaleReason, StorageError, TesseraConfig, TesseraError, TesseraResult, TypeInfo,
    TypeRegistry, ValidationError, ViewState,
};

use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Tessera types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a valid UUIDv7 (timestamp-sortable).
    pub fn arb_uuid_v7() -> impl Strategy<Value = Uuid> {
        Just(()).prop_map(|_| Uuid::now_v7())
    }

    /// Generate one of the item types registered by [`fixtures::registry`].
    pub fn arb_item_type() -> impl Strategy<Value = ItemType> {
        prop_oneof![
            Just(ItemType::new("Lab")),
            Just(ItemType::new("Experiment")),
            Just(ItemType::new("Sample")),
        ]
    }

    /// Generate a plain property name.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,11}"
    }

    /// Generate a scalar JSON value.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,24}".prop_map(Value::String),
        ]
    }

    /// Generate a flat property sheet.
    pub fn arb_properties() -> impl Strategy<Value = Properties> {
        prop::collection::btree_map(arb_field_name(), arb_scalar(), 0..8)
            .prop_map(|fields| fields.into_iter().collect())
    }

    pub fn arb_queue_lane() -> impl Strategy<Value = QueueLane> {
        prop_oneof![
            Just(QueueLane::Primary),
            Just(QueueLane::Secondary),
            Just(QueueLane::Deferred),
        ]
    }

    pub fn arb_invalidation_mode() -> impl Strategy<Value = InvalidationMode> {
        prop_oneof![
            Just(InvalidationMode::Precise),
            Just(InvalidationMode::CalculatedConservative),
            Just(InvalidationMode::Disabled),
        ]
    }

    /// Generate a primary or secondary message for a fixture type.
    pub fn arb_index_message() -> impl Strategy<Value = IndexMessage> {
        (
            arb_item_type(),
            arb_uuid(),
            prop::option::of(1i64..10_000),
            any::<bool>(),
            prop::option::of(prop::collection::vec(arb_field_name(), 0..4)),
        )
            .prop_map(|(item_type, uuid, sid, secondary, fields)| {
                let key = EntityKey::new(item_type.clone(), uuid);
                if secondary {
                    IndexMessage::secondary(key, sid)
                } else {
                    let diff = fields.map(|fields| {
                        fields
                            .into_iter()
                            .map(|field| format!("{}.{}", item_type, field))
                            .collect()
                    });
                    IndexMessage::primary(key, sid, diff)
                }
            })
    }

    /// Generate a RetryConfig that passes validation.
    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (1u32..20, 0u64..1000, 1000u64..60_000, 1.0f64..4.0).prop_map(
            |(max_attempts, initial_ms, max_ms, multiplier)| RetryConfig {
                max_attempts,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
            },
        )
    }

    /// Generate a TesseraConfig that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = TesseraConfig> {
        (
            arb_invalidation_mode(),
            1usize..16,
            1usize..100,
            1u64..5000,
            1u64..60_000,
            1u64..600_000,
            arb_retry_config(),
        )
            .prop_map(
                |(
                    invalidation_mode,
                    worker_count,
                    batch_size,
                    poll_ms,
                    timeout_ms,
                    visibility_ms,
                    retry,
                )| {
                    let mut config = TesseraConfig {
                        invalidation_mode,
                        ..TesseraConfig::default()
                    };
                    config.pipeline = PipelineConfig {
                        worker_count,
                        batch_size,
                        poll_interval: Duration::from_millis(poll_ms),
                        operation_timeout: Duration::from_millis(timeout_ms),
                        visibility_timeout: Duration::from_millis(visibility_ms),
                        retry,
                    };
                    config
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built registries, stores and payloads.

    use super::*;
    use std::sync::Arc;

    /// Build a property sheet from a `json!` object literal.
    ///
    /// Anything other than an object yields an empty sheet.
    pub fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            _ => Properties::new(),
        }
    }

    /// Lab, Experiment and Sample, chained by links.
    ///
    /// - `Lab`: `title`, unique `code`
    /// - `Experiment`: links `lab`, embeds `lab.title`, calculates
    ///   `display_title` from `name` and `lab.title`
    /// - `Sample`: links `experiment`, embeds `experiment.name` and
    ///   `experiment.lab.title`
    pub fn registry() -> TypeRegistry {
        let display_title = CalculatedProperty::new("display_title", &["lab.title"], |own, inputs| {
            let name = own.get("name").and_then(Value::as_str).unwrap_or("?");
            let lab = inputs
                .get("lab.title")
                .and_then(Value::as_str)
                .unwrap_or("?");
            Value::String(format!("{} ({})", name, lab))
        });

        TypeRegistry::new()
            .with_type(TypeInfo::new("Lab").unique_key("code"))
            .and_then(|r| {
                r.with_type(
                    TypeInfo::new("Experiment")
                        .link("lab", "Lab")
                        .embed("lab.title")
                        .calculated(display_title),
                )
            })
            .and_then(|r| {
                r.with_type(
                    TypeInfo::new("Sample")
                        .link("experiment", "Experiment")
                        .embed("experiment.name")
                        .embed("experiment.lab.title"),
                )
            })
            .expect("fixture registry should build")
    }

    /// `Source` and `Ref`, where `Ref` links `ref` to a `Source` and embeds
    /// all of it.
    pub fn wildcard_registry() -> TypeRegistry {
        TypeRegistry::new()
            .with_type(TypeInfo::new("Source"))
            .and_then(|r| r.with_type(TypeInfo::new("Ref").link("ref", "Source").embed("ref.*")))
            .expect("fixture registry should build")
    }

    /// Development config with a fixed invalidation mode.
    pub fn config(mode: InvalidationMode) -> TesseraConfig {
        TesseraConfig {
            invalidation_mode: mode,
            ..TesseraConfig::development()
        }
    }

    /// Fresh in-memory Write and Read stores.
    pub fn stores() -> (Arc<InMemoryWriteStore>, Arc<InMemoryReadStore>) {
        (
            Arc::new(InMemoryWriteStore::new()),
            Arc::new(InMemoryReadStore::new()),
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Tessera results and views.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert a `NotFound` storage error for `uuid`.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &TesseraResult<T>, uuid: Uuid) {
        match result {
            Err(TesseraError::Storage(StorageError::NotFound { uuid: missing })) => {
                assert_eq!(*missing, uuid, "Wrong uuid in NotFound error");
            }
            other => panic!("Expected NotFound error for {}, got: {:?}", uuid, other),
        }
    }

    /// Assert a uuid or unique-key collision.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Storage(e)) if e.is_conflict() => {}
            other => panic!("Expected conflict error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_stale_write<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Storage(StorageError::StaleWrite { .. })) => {}
            other => panic!("Expected StaleWrite error, got: {:?}", other),
        }
    }

    /// Assert a blocked purge of `uuid` and return the blocking sources.
    #[track_caller]
    pub fn assert_referential_integrity<T: std::fmt::Debug>(
        result: &TesseraResult<T>,
        uuid: Uuid,
    ) -> Vec<Uuid> {
        match result {
            Err(TesseraError::Storage(StorageError::ReferentialIntegrity {
                uuid: blocked,
                linked_from,
            })) => {
                assert_eq!(*blocked, uuid, "Wrong uuid in ReferentialIntegrity error");
                linked_from.clone()
            }
            other => panic!("Expected ReferentialIntegrity error for {}, got: {:?}", uuid, other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_valid(config: &TesseraConfig) {
        if let Err(e) = config.validate() {
            panic!("Config should be valid: {:?}", e);
        }
    }

    /// Assert that `view.linked_uuids` is exactly `expected`.
    #[track_caller]
    pub fn assert_linked(view: &CachedView, expected: &[Uuid]) {
        let actual: Vec<Uuid> = view.linked_uuids.iter().copied().collect();
        let mut expected = expected.to_vec();
        expected.sort();
        expected.dedup();
        assert_eq!(actual, expected, "linked_uuids of {} differ", view.uuid);
    }

    #[track_caller]
    pub fn assert_fresh(state: &ViewState) {
        assert!(state.is_fresh(), "Expected fresh view, got: {:?}", state);
    }

    #[track_caller]
    pub fn assert_stale(state: &ViewState) -> Vec<StaleReason> {
        match state {
            ViewState::Stale(reasons) => reasons.clone(),
            other => panic!("Expected stale view, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
