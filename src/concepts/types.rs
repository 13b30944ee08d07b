// src/concepts/types.rs
// Core type definitions for the concept layer

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{GatewayError, GatewayResult};

/// Stable identifier limit (bytes).
pub const MAX_ID_BYTES: usize = 64;
/// Display name limit (bytes).
pub const MAX_NAME_BYTES: usize = 512;
/// Description limit (bytes).
pub const MAX_DESCRIPTION_BYTES: usize = 64 * 1024;

/// Metadata key tying a concept back to a relational row.
pub const META_SOURCE_KEY: &str = "source_key";
/// Metadata key naming the mapping rule that produced the concept.
pub const META_MAPPING_RULE: &str = "mapping_rule";

/// A semantic unit: name, description, embedding vector, relations and open
/// metadata. Mutated only through the concept store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub tenant: String,
    pub name: String,
    pub description: String,
    /// Fixed-dimension embedding; must be present and finite for the concept
    /// to be searchable.
    pub vector: Option<Vec<f32>>,
    pub metadata: Map<String, Value>,
    pub usage_count: i64,
    pub strength: f32,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds; always >= created_at.
    pub updated_at: i64,
}

impl Concept {
    pub fn source_key(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE_KEY).and_then(|v| v.as_str())
    }
}

/// Directed typed edge between two concepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub source_id: String,
    pub target_id: String,
    pub relation_type: RelationType,
    /// In (0, 1].
    pub strength: f32,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    IsA,
    PartOf,
    RelatedTo,
    OppositeOf,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IsA => "is_a",
            Self::PartOf => "part_of",
            Self::RelatedTo => "related_to",
            Self::OppositeOf => "opposite_of",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = GatewayError;

    fn from_str(s: &str) -> GatewayResult<Self> {
        match s {
            "is_a" => Ok(Self::IsA),
            "part_of" => Ok(Self::PartOf),
            "related_to" => Ok(Self::RelatedTo),
            "opposite_of" => Ok(Self::OppositeOf),
            other => Err(GatewayError::invalid_relation(format!(
                "unknown relation type: {}",
                other
            ))),
        }
    }
}

/// Input for concept creation. Vector is computed from name + description
/// when not supplied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptDraft {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub vector: Option<Vec<f32>>,
}

/// Partial update. Name or description changes trigger re-embedding;
/// metadata changes do not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl ConceptPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.metadata.is_none()
    }
}

/// A concept with its similarity to a query vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredConcept {
    pub concept: Concept,
    pub score: f32,
}

/// Query input for semantic search.
#[derive(Debug, Clone)]
pub enum SearchQuery {
    Text(String),
    Vector(Vec<f32>),
}

/// Nodes and edges visited by a graph traversal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub root: Option<String>,
    pub nodes: Vec<Concept>,
    pub edges: Vec<Relation>,
}
