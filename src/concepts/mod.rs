// src/concepts/mod.rs

//! The semantic side of the gateway: concepts with embedding vectors,
//! typed relations, semantic search and graph traversal.

pub mod graph;
pub mod store;
pub mod types;

pub use graph::MAX_TRAVERSAL_DEPTH;
pub use store::ConceptStore;
pub use types::{
    Concept, ConceptDraft, ConceptPatch, Relation, RelationType, ScoredConcept, SearchQuery,
    Subgraph, META_MAPPING_RULE, META_SOURCE_KEY,
};
