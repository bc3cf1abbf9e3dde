//! Records, update operations and batches that flow through a migration run.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::derive::Identifier;

/// Document field holding the entity type tag.
pub const ENTITY_TYPE_FIELD: &str = "entity_type";

/// Document field listing the ancestor types of an entity.
pub const PARENT_TYPES_FIELD: &str = "parent_types";

/// Document field holding the canonical identifier.
pub const STANDARD_ID_FIELD: &str = "standard_id";

/// Physical sub-index holding a record (e.g. a concrete Elasticsearch index
/// behind a read alias).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreLocation(String);

impl StoreLocation {
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current store-level identifier of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `(location, id)` pair an update targets. Unique within one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub location: StoreLocation,
    pub id: RecordId,
}

/// A document read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub location: StoreLocation,
    pub id: RecordId,
    pub content: Map<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new(
        location: impl Into<String>,
        id: impl Into<String>,
        content: Map<String, Value>,
    ) -> Self {
        Self {
            location: StoreLocation::new(location),
            id: RecordId::new(id),
            content,
        }
    }

    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            location: self.location.clone(),
            id: self.id.clone(),
        }
    }
}

/// Selects records by legacy type or class.
///
/// A record matches when its `entity_type` or any entry of `parent_types`
/// equals one of `entity_types`. `indices` names the indices (or patterns
/// with a trailing `*`) to read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPredicate {
    pub indices: Vec<String>,
    pub entity_types: Vec<String>,
}

impl ScanPredicate {
    #[must_use]
    pub fn new(indices: Vec<String>, entity_types: Vec<String>) -> Self {
        Self {
            indices,
            entity_types,
        }
    }

    /// Whether `location` is covered by one of the configured index patterns.
    #[must_use]
    pub fn covers(&self, location: &str) -> bool {
        self.indices.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => location.starts_with(prefix),
            None => pattern == location,
        })
    }

    /// Whether a document's type tags satisfy the predicate.
    #[must_use]
    pub fn matches_content(&self, content: &Map<String, Value>) -> bool {
        let own_type = content.get(ENTITY_TYPE_FIELD).and_then(Value::as_str);
        if own_type.is_some_and(|t| self.entity_types.iter().any(|wanted| wanted == t)) {
            return true;
        }
        content
            .get(PARENT_TYPES_FIELD)
            .and_then(Value::as_array)
            .is_some_and(|parents| {
                parents
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|p| self.entity_types.iter().any(|wanted| wanted == p))
            })
    }
}

impl fmt::Display for ScanPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "types [{}] in [{}]",
            self.entity_types.join(", "),
            self.indices.join(", ")
        )
    }
}

/// Opaque pagination token handed back to the store on the next fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub Value);

/// One page of scan results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// `None` once the scan is exhausted.
    pub next: Option<PageToken>,
}

/// Corrected fields written back to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub entity_type: String,
    pub standard_id: Identifier,
}

impl Patch {
    /// Partial document merged into the stored record.
    #[must_use]
    pub fn to_doc(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert(ENTITY_TYPE_FIELD.to_string(), json!(self.entity_type));
        doc.insert(STANDARD_ID_FIELD.to_string(), json!(self.standard_id.as_str()));
        doc
    }
}

/// A targeted partial update of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOperation {
    pub target: RecordKey,
    pub patch: Patch,
}

/// An ordered group of operations sent in one bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    seq: usize,
    operations: Vec<UpdateOperation>,
}

impl Batch {
    /// `seq` is the 1-indexed submission order.
    #[must_use]
    pub fn new(seq: usize, operations: Vec<UpdateOperation>) -> Self {
        Self { seq, operations }
    }

    #[must_use]
    pub fn seq(&self) -> usize {
        self.seq
    }

    #[must_use]
    pub fn operations(&self) -> &[UpdateOperation] {
        &self.operations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
