//! Shared data model for the stream-to-search-index replication pipeline.
//!
//! Every other crate in this workspace depends on these types rather than
//! redefining its own view of a change record, a lease, or a search document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// ChangeRecord
// ---------------------------------------------------------------------------

/// Two-part sequence number. Lexicographic order matches stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub commit_num: i64,
    pub op_num: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Add,
    Remove,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Add => "ADD",
            Op::Remove => "REMOVE",
        }
    }
}

/// Property-graph element kind, carried on the `type` field of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphElementType {
    /// vertex label
    Vl,
    /// vertex property
    Vp,
    /// edge
    E,
    /// edge property
    Ep,
}

impl GraphElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphElementType::Vl => "vl",
            GraphElementType::Vp => "vp",
            GraphElementType::E => "e",
            GraphElementType::Ep => "ep",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "vl" => Some(GraphElementType::Vl),
            "vp" => Some(GraphElementType::Vp),
            "e" => Some(GraphElementType::E),
            "ep" => Some(GraphElementType::Ep),
            _ => None,
        }
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, GraphElementType::E | GraphElementType::Ep)
    }

    pub fn is_property(&self) -> bool {
        matches!(self, GraphElementType::Vp | GraphElementType::Ep)
    }
}

/// A declared-type value as carried by a property-graph record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedValue {
    pub value: serde_json::Value,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyGraphPayload {
    pub id: String,
    pub r#type: GraphElementType,
    pub key: String,
    pub value: Option<TypedValue>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// A parsed RDF object (the `o` position of a triple/quad).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdfObject {
    pub value: String,
    pub is_literal: bool,
    pub datatype: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdfQuad {
    pub subject: String,
    pub subject_is_blank_node: bool,
    pub predicate: String,
    pub object: RdfObject,
    pub graph: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordData {
    PropertyGraph(PropertyGraphPayload),
    /// `stmt` is the raw n-quad line; `parsed` is filled in once the line
    /// parser has run. Kept separate so parse failures can be surfaced as
    /// `ParseError` before a record ever reaches the transformer.
    Rdf { stmt: String, parsed: RdfQuad },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub event_id: EventId,
    pub op: Op,
    pub data: RecordData,
    /// Wall-clock commit time reported by the source, used for stream-lag metrics.
    pub commit_timestamp_millis: i64,
}

impl ChangeRecord {
    pub fn commit_num(&self) -> i64 {
        self.event_id.commit_num
    }

    pub fn op_num(&self) -> i64 {
        self.event_id.op_num
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

pub const LEASE_OWNER_NOBODY: &str = "nobody";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_key: String,
    pub lease_owner: String,
    pub checkpoint: i64,
    pub checkpoint_sub_sequence_number: i64,
    pub last_update_time_millis: i64,
}

impl Lease {
    pub fn new_free(lease_key: impl Into<String>) -> Self {
        Self {
            lease_key: lease_key.into(),
            lease_owner: LEASE_OWNER_NOBODY.to_string(),
            checkpoint: 0,
            checkpoint_sub_sequence_number: 0,
            last_update_time_millis: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.lease_owner == LEASE_OWNER_NOBODY
    }
}

// ---------------------------------------------------------------------------
// SearchDocument
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentType {
    Vertex,
    Edge,
    RdfResource,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Vertex => "vertex",
            DocumentType::Edge => "edge",
            DocumentType::RdfResource => "rdf-resource",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueObject {
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl ValueObject {
    pub fn plain(value: serde_json::Value) -> Self {
        Self {
            value,
            datatype: None,
            graph: None,
            language: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDocument {
    pub entity_id: String,
    #[serde(default)]
    pub entity_type: Vec<String>,
    pub document_type: DocumentType,
    #[serde(default)]
    pub predicates: BTreeMap<String, Vec<ValueObject>>,
}

impl SearchDocument {
    pub fn new(entity_id: impl Into<String>, document_type: DocumentType) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: Vec::new(),
            document_type,
            predicates: BTreeMap::new(),
        }
    }
}

/// Document-id prefixes. Prevents cross-kind id collisions for the same
/// underlying entity key (e.g. a vertex and an edge named identically).
pub const VERTEX_ID_PREFIX: &str = "v://";
pub const EDGE_ID_PREFIX: &str = "e://";

/// `document_id = md5(prefix + entity_key)`.
pub fn document_id(prefix: &str, entity_key: &str) -> String {
    use md5::{Digest, Md5};

    let mut input = String::with_capacity(prefix.len() + entity_key.len());
    input.push_str(prefix);
    input.push_str(entity_key);

    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}
