//! Type registry: embed specifications, link schema and calculated properties
//!
//! Every entity type declares, statically and up front:
//!
//! - which of its properties are links, and to which type they point
//! - which of its properties are unique keys
//! - its embed specification (dotted paths, optionally ending in `*`)
//! - its calculated properties and the paths each one reads
//!
//! The resolver walks these declarations to build views, and the invalidation
//! calculator walks them to decide which dependents a field change reaches.

use crate::{EntityWrite, ItemType, Properties, TesseraResult, UniqueKey, ValidationError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Wildcard segment: embed every property of the nested entity.
pub const WILDCARD: &str = "*";

static EMBED_PATH: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_@][A-Za-z0-9_@]*(\.[A-Za-z_@][A-Za-z0-9_@]*)*(\.\*)?$")
});

// ============================================================================
// LINK SCHEMA
// ============================================================================

/// Declaration of one link property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkField {
    pub target: ItemType,
    /// Whether the property holds an array of uuids.
    pub many: bool,
}

// ============================================================================
// CALCULATED PROPERTIES
// ============================================================================

/// Resolved values handed to a calculated property, keyed by dependency path.
///
/// A path that ends on a link field resolves to the target's full default
/// sheet; a missing path resolves to `null`.
pub type CalculatedInputs = BTreeMap<String, Value>;

type CalculateFn = dyn Fn(&Properties, &CalculatedInputs) -> Value + Send + Sync;

/// A derived property computed at view-build time.
#[derive(Clone)]
pub struct CalculatedProperty {
    pub name: String,
    /// Dotted paths, relative to the owning type, that the function reads.
    pub depends_on: Vec<String>,
    compute: Arc<CalculateFn>,
}

impl CalculatedProperty {
    pub fn new<F>(name: impl Into<String>, depends_on: &[&str], compute: F) -> Self
    where
        F: Fn(&Properties, &CalculatedInputs) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            depends_on: depends_on.iter().map(|p| p.to_string()).collect(),
            compute: Arc::new(compute),
        }
    }

    pub fn compute(&self, own: &Properties, inputs: &CalculatedInputs) -> Value {
        (self.compute)(own, inputs)
    }
}

impl fmt::Debug for CalculatedProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatedProperty")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TYPE INFO
// ============================================================================

/// Static declaration of one entity type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: ItemType,
    /// Embed specification, in declaration order.
    pub embedded: Vec<String>,
    pub links: BTreeMap<String, LinkField>,
    /// Property names whose values are globally unique within this type.
    pub unique_keys: Vec<String>,
    pub calculated: Vec<CalculatedProperty>,
}

impl TypeInfo {
    pub fn new(name: impl Into<ItemType>) -> Self {
        Self {
            name: name.into(),
            embedded: Vec::new(),
            links: BTreeMap::new(),
            unique_keys: Vec::new(),
            calculated: Vec::new(),
        }
    }

    pub fn embed(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !self.embedded.contains(&path) {
            self.embedded.push(path);
        }
        self
    }

    pub fn link(mut self, field: impl Into<String>, target: impl Into<ItemType>) -> Self {
        self.links.insert(
            field.into(),
            LinkField {
                target: target.into(),
                many: false,
            },
        );
        self
    }

    pub fn link_many(mut self, field: impl Into<String>, target: impl Into<ItemType>) -> Self {
        self.links.insert(
            field.into(),
            LinkField {
                target: target.into(),
                many: true,
            },
        );
        self
    }

    pub fn unique_key(mut self, field: impl Into<String>) -> Self {
        self.unique_keys.push(field.into());
        self
    }

    pub fn calculated(mut self, property: CalculatedProperty) -> Self {
        self.calculated.push(property);
        self
    }

    /// Unique-key name for one of this type's key properties.
    pub fn unique_key_name(&self, field: &str) -> String {
        format!("{}:{}", self.name, field)
    }

    /// Outgoing links declared by `properties`.
    ///
    /// Link values must be uuid strings (or arrays of them for `many` links);
    /// `null` and absent values yield no edge.
    pub fn extract_links(&self, properties: &Properties) -> TesseraResult<BTreeSet<(String, Uuid)>> {
        let mut links = BTreeSet::new();
        for (field, decl) in &self.links {
            let Some(value) = properties.get(field) else {
                continue;
            };
            match value {
                Value::Null => {}
                Value::String(raw) if !decl.many => {
                    links.insert((field.clone(), self.parse_link(field, raw)?));
                }
                Value::Array(items) if decl.many => {
                    for item in items {
                        let raw = item.as_str().ok_or_else(|| ValidationError::InvalidLink {
                            item_type: self.name.clone(),
                            field: field.clone(),
                            reason: "array items must be uuid strings".to_string(),
                        })?;
                        links.insert((field.clone(), self.parse_link(field, raw)?));
                    }
                }
                other => {
                    return Err(ValidationError::InvalidLink {
                        item_type: self.name.clone(),
                        field: field.clone(),
                        reason: format!("unexpected value {}", other),
                    }
                    .into());
                }
            }
        }
        Ok(links)
    }

    fn parse_link(&self, field: &str, raw: &str) -> TesseraResult<Uuid> {
        Uuid::parse_str(raw).map_err(|e| {
            ValidationError::InvalidLink {
                item_type: self.name.clone(),
                field: field.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Unique keys declared by `properties`. Non-scalar values are skipped.
    pub fn extract_unique_keys(&self, properties: &Properties) -> BTreeSet<UniqueKey> {
        self.unique_keys
            .iter()
            .filter_map(|field| {
                let value = match properties.get(field)? {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some(UniqueKey::new(self.unique_key_name(field), value))
            })
            .collect()
    }

    /// Build the full write payload for a new default sheet.
    pub fn entity_write(&self, properties: Properties) -> TesseraResult<EntityWrite> {
        let links = self.extract_links(&properties)?;
        let unique_keys = self.extract_unique_keys(&properties);
        Ok(EntityWrite {
            properties,
            sheets: BTreeMap::new(),
            links,
            unique_keys,
        })
    }
}

// ============================================================================
// EMBED TREE
// ============================================================================

/// Nested form of an embed specification.
///
/// `fields` names the properties kept at this level (`*` keeps all of them);
/// `children` holds the subtrees to expand below a property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedNode {
    pub fields: BTreeSet<String>,
    pub children: BTreeMap<String, EmbedNode>,
}

impl EmbedNode {
    /// Build the tree for a root entity. The root always keeps all of its own
    /// properties.
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a String>) -> Self {
        let mut root = EmbedNode::default();
        root.fields.insert(WILDCARD.to_string());
        for path in paths {
            let segments: Vec<&str> = path.split('.').collect();
            let mut node = &mut root;
            for (i, segment) in segments.iter().enumerate() {
                node.fields.insert(segment.to_string());
                if i + 1 == segments.len() || *segment == WILDCARD {
                    break;
                }
                node = node.children.entry(segment.to_string()).or_default();
            }
        }
        root
    }

    pub fn keeps_all(&self) -> bool {
        self.fields.contains(WILDCARD)
    }

    pub fn keeps(&self, field: &str) -> bool {
        self.keeps_all() || self.fields.contains(field)
    }
}

// ============================================================================
// EMBEDDED FIELD INDEX
// ============================================================================

/// Fields of one type that a dependent's view reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelection {
    pub all: bool,
    pub fields: BTreeSet<String>,
}

impl FieldSelection {
    /// Whether a change to `field` (possibly dotted) reaches this selection.
    pub fn covers(&self, field: &str) -> bool {
        let top = field.split('.').next().unwrap_or(field);
        self.all || self.fields.contains(top)
    }
}

/// For one dependent type: every (type, field) its view reads, through the
/// embed specification or through calculated-property dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedFields {
    pub by_type: BTreeMap<ItemType, FieldSelection>,
    /// Types that some calculated property reads from through a link.
    pub calculated_types: BTreeSet<ItemType>,
}

impl EmbeddedFields {
    pub fn covers(&self, item_type: &ItemType, field: &str) -> bool {
        self.by_type
            .get(item_type)
            .map(|selection| selection.covers(field))
            .unwrap_or(false)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Lookup table from type tag to its static declaration.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<ItemType, TypeInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type, validating its embed and calculated paths.
    pub fn register(&mut self, info: TypeInfo) -> TesseraResult<()> {
        if self.types.contains_key(&info.name) {
            return Err(ValidationError::DuplicateItemType {
                item_type: info.name.clone(),
            }
            .into());
        }
        let calculated_paths = info.calculated.iter().flat_map(|c| c.depends_on.iter());
        for path in info.embedded.iter().chain(calculated_paths) {
            validate_path(&info.name, path)?;
        }
        self.types.insert(info.name.clone(), info);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_type(mut self, info: TypeInfo) -> TesseraResult<Self> {
        self.register(info)?;
        Ok(self)
    }

    pub fn get(&self, item_type: &ItemType) -> Option<&TypeInfo> {
        self.types.get(item_type)
    }

    pub fn require(&self, item_type: &ItemType) -> TesseraResult<&TypeInfo> {
        self.types.get(item_type).ok_or_else(|| {
            ValidationError::UnknownItemType {
                item_type: item_type.clone(),
            }
            .into()
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(&ItemType::new(name))
    }

    /// Registered type names in sorted order.
    pub fn type_names(&self) -> Vec<ItemType> {
        self.types.keys().cloned().collect()
    }

    /// Compute which fields of which types a view of `item_type` reads.
    ///
    /// Returns `None` for unregistered types; callers must treat those as
    /// reading everything.
    pub fn embedded_fields(&self, item_type: &ItemType) -> Option<EmbeddedFields> {
        let info = self.types.get(item_type)?;
        let mut acc = EmbeddedFields::default();
        for path in &info.embedded {
            let segments: Vec<&str> = path.split('.').collect();
            self.walk(item_type, &segments, false, &mut acc);
        }
        for calc in &info.calculated {
            for path in &calc.depends_on {
                let segments: Vec<&str> = path.split('.').collect();
                self.walk(item_type, &segments, true, &mut acc);
            }
        }
        Some(acc)
    }

    fn walk(&self, current: &ItemType, segments: &[&str], calculated: bool, acc: &mut EmbeddedFields) {
        let Some((segment, rest)) = segments.split_first() else {
            return;
        };
        let selection = acc.by_type.entry(current.clone()).or_default();
        if *segment == WILDCARD {
            selection.all = true;
            return;
        }
        selection.fields.insert(segment.to_string());

        let link = self
            .types
            .get(current)
            .and_then(|info| info.links.get(*segment));
        let Some(link) = link else {
            return;
        };
        if calculated {
            acc.calculated_types.insert(link.target.clone());
        }
        if rest.is_empty() {
            // A calculated property reading a bare link receives the whole
            // target sheet.
            if calculated {
                acc.by_type.entry(link.target.clone()).or_default().all = true;
            }
            return;
        }
        let target = link.target.clone();
        self.walk(&target, rest, calculated, acc);
    }
}

fn validate_path(item_type: &ItemType, path: &str) -> TesseraResult<()> {
    let pattern = EMBED_PATH.as_ref().map_err(|e| ValidationError::InvalidEmbedPath {
        item_type: item_type.clone(),
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    if pattern.is_match(path) {
        Ok(())
    } else {
        Err(ValidationError::InvalidEmbedPath {
            item_type: item_type.clone(),
            path: path.to_string(),
            reason: "expected segment(.segment)* with an optional trailing .*".to_string(),
        }
        .into())
    }
}
