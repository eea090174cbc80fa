//! Property-Based Tests for Dependency Tracking
//!
//! Over the Lab -> Experiment -> Sample chain from the shared fixtures:
//! - every entity embedded at any depth appears in `linked_uuids`
//! - a Lab field nothing embeds produces an empty invalidation scope
//! - an embedded Lab field always reaches every view that embeds it
//! - a view whose linked entity moved past its watermark is flagged stale

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tessera_core::{
    EntityKey, InvalidationMode, ItemType, Sid, StaleReason, TypeRegistry, ViewState,
};
use tessera_storage::{
    EmbeddingResolver, InMemoryReadStore, InMemoryWriteStore, InvalidationScope, ReadStore,
    ResolveCache, StalenessChecker, WriteStore,
};
use tessera_test_utils::{assertions, fixtures, generators};
use tokio::runtime::Runtime;
use uuid::Uuid;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

struct Chain {
    registry: Arc<TypeRegistry>,
    write: Arc<InMemoryWriteStore>,
    read: Arc<InMemoryReadStore>,
    lab: Uuid,
    experiment: Uuid,
    sample: Uuid,
}

impl Chain {
    async fn create(&self, uuid: Uuid, item_type: &str, value: serde_json::Value) -> Sid {
        let item_type = ItemType::new(item_type);
        let write = self
            .registry
            .require(&item_type)
            .and_then(|info| info.entity_write(fixtures::props(value)))
            .expect("valid write");
        self.write.create(uuid, item_type, write).await.expect("create")
    }

    async fn update_lab(&self, value: serde_json::Value) -> Sid {
        let write = self
            .registry
            .require(&ItemType::new("Lab"))
            .and_then(|info| info.entity_write(fixtures::props(value)))
            .expect("valid write");
        self.write.update(self.lab, write, None).await.expect("update")
    }

    /// Build and store views for the whole chain at the current watermark.
    async fn index_all(&self) {
        let resolver = EmbeddingResolver::new(self.write.clone(), self.registry.clone());
        let snapshot = self.write.max_sid().await.expect("max sid");
        let mut cache = ResolveCache::new();
        for uuid in [self.lab, self.experiment, self.sample] {
            let view = resolver
                .resolve(uuid, &mut cache)
                .await
                .expect("resolve")
                .into_view(snapshot);
            self.read.put_view(view).await.expect("put view");
        }
    }

    fn scope(&self, mode: InvalidationMode) -> InvalidationScope {
        InvalidationScope::new(
            self.write.clone(),
            self.read.clone(),
            self.registry.clone(),
            mode,
        )
    }
}

async fn chain(title: &str, name: &str) -> Chain {
    let (write, read) = fixtures::stores();
    let chain = Chain {
        registry: Arc::new(fixtures::registry()),
        write,
        read,
        lab: Uuid::now_v7(),
        experiment: Uuid::now_v7(),
        sample: Uuid::now_v7(),
    };
    chain.create(chain.lab, "Lab", json!({"title": title})).await;
    chain
        .create(
            chain.experiment,
            "Experiment",
            json!({"name": name, "lab": chain.lab.to_string()}),
        )
        .await;
    chain
        .create(
            chain.sample,
            "Sample",
            json!({"experiment": chain.experiment.to_string()}),
        )
        .await;
    chain.index_all().await;
    chain
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_embedded_entities_are_linked(title in "[A-Za-z ]{1,16}", name in "[A-Za-z ]{1,16}") {
        let rt = test_runtime()?;
        rt.block_on(async {
            let c = chain(&title, &name).await;

            let sample = c.read.get_view(c.sample).await.expect("sample view");
            assertions::assert_linked(&sample, &[c.experiment, c.lab]);
            prop_assert_eq!(&sample.embedded["experiment"]["lab"]["title"], &json!(title));

            let experiment = c.read.get_view(c.experiment).await.expect("experiment view");
            assertions::assert_linked(&experiment, &[c.lab]);

            let lab = c.read.get_view(c.lab).await.expect("lab view");
            prop_assert!(lab.linked_uuids.is_empty());
            Ok(())
        })?;
    }

    #[test]
    fn prop_unembedded_field_has_empty_scope(
        field in generators::arb_field_name().prop_filter("title is embedded", |f| f != "title"),
        value in generators::arb_scalar(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let c = chain("Bio", "E").await;
            let mut props = json!({"title": "Bio"});
            props[field.as_str()] = value;
            c.update_lab(props).await;

            let diff = vec![format!("Lab.{}", field)];
            let scope = c
                .scope(InvalidationMode::Precise)
                .scope(c.lab, Some(diff.as_slice()))
                .await
                .expect("scope");
            prop_assert!(scope.is_empty(), "unexpected dependents: {:?}", scope);
            Ok(())
        })?;
    }

    #[test]
    fn prop_embedded_field_reaches_every_dependent(
        title in "[A-Za-z]{1,12}",
        mode in prop_oneof![
            Just(InvalidationMode::Precise),
            Just(InvalidationMode::CalculatedConservative),
            Just(InvalidationMode::Disabled),
        ],
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let c = chain("Bio", "E").await;
            c.update_lab(json!({"title": format!("{}!", title)})).await;

            let diff = vec!["Lab.title".to_string()];
            let scope = c.scope(mode).scope(c.lab, Some(diff.as_slice())).await.expect("scope");
            prop_assert!(scope.contains(&EntityKey::new("Experiment", c.experiment)));
            prop_assert!(scope.contains(&EntityKey::new("Sample", c.sample)));
            prop_assert!(!scope.contains(&EntityKey::new("Lab", c.lab)));
            Ok(())
        })?;
    }

    #[test]
    fn prop_linked_write_past_watermark_is_stale(updates in 1usize..4) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let c = chain("Bio", "E").await;
            let checker = StalenessChecker::new(c.write.clone(), c.read.clone());
            assertions::assert_fresh(&checker.check_view(c.sample).await.expect("check"));

            let mut lab_sid = 0;
            for i in 0..updates {
                lab_sid = c.update_lab(json!({"title": format!("Bio {}", i)})).await;
            }

            let reasons = assertions::assert_stale(&checker.check_view(c.sample).await.expect("check"));
            let expected = StaleReason::LinkAdvanced {
                uuid: c.lab,
                current_sid: lab_sid,
            };
            prop_assert!(reasons.contains(&expected));
            let lab_state = checker.check_view(c.lab).await.expect("check");
            prop_assert!(matches!(lab_state, ViewState::Stale(_)));

            let report = checker.report(None).await.expect("report");
            prop_assert_eq!(report.checked, 3);
            prop_assert!(report.missing.is_empty());
            prop_assert!(!report.is_clean());

            c.index_all().await;
            prop_assert!(checker.report(None).await.expect("report").is_clean());
            prop_assert_eq!(checker.global_lag().await.expect("lag"), 0);
            Ok(())
        })?;
    }
}
