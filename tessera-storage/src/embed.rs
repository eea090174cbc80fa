//! Embedding Resolver
//!
//! Builds the embedded document for one entity from its type's embed
//! specification and records what the document depends on.
//!
//! Resolution runs in two passes:
//!
//! 1. **Fetch**: walk every embed path (and every calculated-property
//!    dependency path) through link fields, loading each target from the
//!    Write Store into the per-batch [`ResolveCache`] and recording it in
//!    `linked_uuids`. Missing targets produce a [`DanglingLinkWarning`].
//! 2. **Build**: assemble the document synchronously from the cache. A link
//!    that leads back to an entity already on the current path is written as
//!    its bare uuid, which breaks cycles without failing.
//!
//! Reverse links come from the Write Store's live edges whose target is the
//! entity.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tessera_core::{
    CachedView, CalculatedInputs, DanglingLinkWarning, EmbedNode, EntityRecord, ItemType,
    Properties, Sid, StorageError, TesseraError, TesseraResult, TypeRegistry,
};
use uuid::Uuid;

use crate::write_store::WriteStore;

/// Entity records loaded during one worker batch.
///
/// Create one per batch and drop it at the batch boundary; nothing is shared
/// between batches.
#[derive(Debug, Default)]
pub struct ResolveCache {
    records: HashMap<Uuid, Option<EntityRecord>>,
}

impl ResolveCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn record(&self, uuid: &Uuid) -> Option<&EntityRecord> {
        self.records.get(uuid).and_then(Option::as_ref)
    }
}

/// Output of resolving one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The root entity at the sid the document was built from.
    pub record: EntityRecord,
    pub document: Value,
    pub linked_uuids: BTreeSet<Uuid>,
    pub rev_links: BTreeMap<String, BTreeSet<Uuid>>,
    pub warnings: Vec<DanglingLinkWarning>,
}

impl Resolution {
    /// Stamp the resolution with the watermark observed before resolving.
    pub fn into_view(self, max_sid: Sid) -> CachedView {
        CachedView {
            uuid: self.record.uuid,
            item_type: self.record.item_type.clone(),
            embedded: self.document,
            sid: self.record.sid,
            max_sid: max_sid.max(self.record.sid),
            linked_uuids: self.linked_uuids,
            rev_links: self.rev_links,
        }
    }
}

/// Resolves embed specifications against the Write Store.
#[derive(Clone)]
pub struct EmbeddingResolver {
    write: Arc<dyn WriteStore>,
    registry: Arc<TypeRegistry>,
}

impl EmbeddingResolver {
    pub fn new(write: Arc<dyn WriteStore>, registry: Arc<TypeRegistry>) -> Self {
        Self { write, registry }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Resolve `uuid` with the embed specification registered for its type.
    /// Types without a registration embed nothing.
    pub async fn resolve(&self, uuid: Uuid, cache: &mut ResolveCache) -> TesseraResult<Resolution> {
        let record = self.load_root(uuid, cache).await?;
        let spec = self
            .registry
            .get(&record.item_type)
            .map(|info| info.embedded.clone())
            .unwrap_or_default();
        self.resolve_record(record, &spec, cache).await
    }

    /// Resolve `uuid` with an explicit embed specification.
    pub async fn resolve_with_spec(
        &self,
        uuid: Uuid,
        spec: &[String],
        cache: &mut ResolveCache,
    ) -> TesseraResult<Resolution> {
        let record = self.load_root(uuid, cache).await?;
        self.resolve_record(record, spec, cache).await
    }

    async fn load_root(&self, uuid: Uuid, cache: &mut ResolveCache) -> TesseraResult<EntityRecord> {
        // The root is always read fresh so the view carries its current sid.
        let record = self.write.get(uuid).await?;
        cache.records.insert(uuid, Some(record.clone()));
        Ok(record)
    }

    async fn resolve_record(
        &self,
        record: EntityRecord,
        spec: &[String],
        cache: &mut ResolveCache,
    ) -> TesseraResult<Resolution> {
        let root = record.uuid;
        let mut linked = BTreeSet::new();
        let mut warnings = Vec::new();

        for path in spec {
            let segments: Vec<&str> = path.split('.').collect();
            self.fetch_path(root, &segments, false, cache, &mut linked, &mut warnings)
                .await?;
        }
        let calculated = self
            .registry
            .get(&record.item_type)
            .map(|info| info.calculated.clone())
            .unwrap_or_default();
        for calc in &calculated {
            for path in &calc.depends_on {
                let segments: Vec<&str> = path.split('.').collect();
                self.fetch_path(root, &segments, true, cache, &mut linked, &mut warnings)
                    .await?;
            }
        }
        linked.remove(&root);

        let tree = EmbedNode::from_paths(spec);
        let mut stack = vec![root];
        let mut document = self.build_entity(&record, &tree, &mut stack, cache);
        if let Value::Object(map) = &mut document {
            for calc in &calculated {
                let inputs: CalculatedInputs = calc
                    .depends_on
                    .iter()
                    .map(|path| {
                        let segments: Vec<&str> = path.split('.').collect();
                        (
                            path.clone(),
                            self.lookup_path(&record.properties, &record.item_type, &segments, cache),
                        )
                    })
                    .collect();
                map.insert(calc.name.clone(), calc.compute(&record.properties, &inputs));
            }
        }

        let mut rev_links: BTreeMap<String, BTreeSet<Uuid>> = BTreeMap::new();
        for edge in self.write.rev_links(root).await? {
            if edge.source != root {
                rev_links.entry(edge.field).or_default().insert(edge.source);
            }
        }

        for warning in &warnings {
            tracing::warn!(
                source = %warning.source,
                field = %warning.field,
                target = %warning.target,
                "Dangling link while embedding"
            );
        }

        Ok(Resolution {
            record,
            document,
            linked_uuids: linked,
            rev_links,
            warnings,
        })
    }

    /// Load every entity reachable along `segments` into the cache.
    ///
    /// Embed paths only follow a link when more segments remain; calculated
    /// dependency paths also follow a terminal link, since the function then
    /// receives the whole target.
    async fn fetch_path(
        &self,
        root: Uuid,
        segments: &[&str],
        follow_terminal: bool,
        cache: &mut ResolveCache,
        linked: &mut BTreeSet<Uuid>,
        warnings: &mut Vec<DanglingLinkWarning>,
    ) -> TesseraResult<()> {
        let mut frontier = vec![root];
        for (depth, segment) in segments.iter().enumerate() {
            let last = depth + 1 == segments.len();
            if last && !follow_terminal {
                break;
            }
            let mut next = Vec::new();
            for source in frontier {
                let Some(record) = cache.record(&source) else {
                    continue;
                };
                let is_link = self
                    .registry
                    .get(&record.item_type)
                    .map(|info| info.links.contains_key(*segment))
                    .unwrap_or(false);
                if !is_link {
                    continue;
                }
                let targets = link_targets(record.properties.get(*segment));
                for target in targets {
                    linked.insert(target);
                    if self.fetch(target, cache).await? {
                        next.push(target);
                    } else {
                        let warning = DanglingLinkWarning {
                            source,
                            field: segment.to_string(),
                            target,
                        };
                        if !warnings.contains(&warning) {
                            warnings.push(warning);
                        }
                    }
                }
            }
            frontier = next;
        }
        Ok(())
    }

    /// Load `uuid` into the cache. Returns whether it exists.
    async fn fetch(&self, uuid: Uuid, cache: &mut ResolveCache) -> TesseraResult<bool> {
        if let Some(entry) = cache.records.get(&uuid) {
            return Ok(entry.is_some());
        }
        match self.write.get(uuid).await {
            Ok(record) => {
                cache.records.insert(uuid, Some(record));
                Ok(true)
            }
            Err(TesseraError::Storage(StorageError::NotFound { .. })) => {
                cache.records.insert(uuid, None);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn build_entity(
        &self,
        record: &EntityRecord,
        node: &EmbedNode,
        stack: &mut Vec<Uuid>,
        cache: &ResolveCache,
    ) -> Value {
        let mut out = Map::new();
        for (field, value) in &record.properties {
            if !node.keeps(field) {
                continue;
            }
            let built = match node.children.get(field) {
                Some(child) if self.is_link(&record.item_type, field) => {
                    self.build_link(value, child, stack, cache)
                }
                Some(child) => select_nested(value, child),
                None => value.clone(),
            };
            out.insert(field.clone(), built);
        }
        out.insert("uuid".to_string(), Value::String(record.uuid.to_string()));
        out.insert(
            "@type".to_string(),
            Value::String(record.item_type.to_string()),
        );
        Value::Object(out)
    }

    fn build_link(
        &self,
        value: &Value,
        node: &EmbedNode,
        stack: &mut Vec<Uuid>,
        cache: &ResolveCache,
    ) -> Value {
        match value {
            Value::String(raw) => match Uuid::parse_str(raw) {
                Ok(target) => self.build_target(target, node, stack, cache),
                Err(_) => value.clone(),
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.build_link(item, node, stack, cache))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn build_target(
        &self,
        target: Uuid,
        node: &EmbedNode,
        stack: &mut Vec<Uuid>,
        cache: &ResolveCache,
    ) -> Value {
        if stack.contains(&target) {
            return Value::String(target.to_string());
        }
        match cache.record(&target) {
            Some(record) => {
                stack.push(target);
                let built = self.build_entity(record, node, stack, cache);
                stack.pop();
                built
            }
            None => Value::Null,
        }
    }

    /// Value at `segments` for a calculated property, following links
    /// through the cache. A terminal link yields the target's full sheet.
    fn lookup_path(
        &self,
        properties: &Properties,
        item_type: &ItemType,
        segments: &[&str],
        cache: &ResolveCache,
    ) -> Value {
        let Some((segment, rest)) = segments.split_first() else {
            return Value::Object(properties.clone());
        };
        let Some(value) = properties.get(*segment) else {
            return Value::Null;
        };
        if self.is_link(item_type, segment) {
            let follow = |raw: &Value| -> Value {
                let target = raw.as_str().and_then(|s| Uuid::parse_str(s).ok());
                match target.and_then(|t| cache.record(&t)) {
                    Some(record) => {
                        self.lookup_path(&record.properties, &record.item_type, rest, cache)
                    }
                    None => Value::Null,
                }
            };
            return match value {
                Value::Array(items) => Value::Array(items.iter().map(follow).collect()),
                single => follow(single),
            };
        }
        if rest.is_empty() {
            return value.clone();
        }
        match value {
            Value::Object(nested) => self.lookup_path(nested, item_type, rest, cache),
            _ => Value::Null,
        }
    }

    fn is_link(&self, item_type: &ItemType, field: &str) -> bool {
        self.registry
            .get(item_type)
            .map(|info| info.links.contains_key(field))
            .unwrap_or(false)
    }
}

fn link_targets(value: Option<&Value>) -> Vec<Uuid> {
    match value {
        Some(Value::String(raw)) => Uuid::parse_str(raw).ok().into_iter().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().and_then(|s| Uuid::parse_str(s).ok()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Apply an embed subtree to a nested (non-link) object.
fn select_nested(value: &Value, node: &EmbedNode) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(field, _)| node.keeps(field))
                .map(|(field, inner)| {
                    let built = match node.children.get(field) {
                        Some(child) => select_nested(inner, child),
                        None => inner.clone(),
                    };
                    (field.clone(), built)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|item| select_nested(item, node)).collect()),
        other => other.clone(),
    }
}
