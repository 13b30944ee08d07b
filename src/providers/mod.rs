// src/providers/mod.rs

//! Capability traits for the external collaborators (relational engine,
//! vector engine, embedding model, LLM intent parser, cache).
//! All engine access goes through these—no direct backend calls in
//! business logic.

pub mod cache;
pub mod openai;
pub mod qdrant;
pub mod relational;

pub use cache::SqliteQueryCache;
pub use openai::OpenAiEmbeddings;
pub use qdrant::QdrantVectorStore;
pub use relational::SqliteRelationalStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::GatewayResult;
use crate::intent::QueryKind;

/// A relational row surfaced to the router: an opaque map keyed by column.
pub type Row = serde_json::Map<String, Value>;

/// Result of a relational statement.
#[derive(Debug, Clone, Default)]
pub struct RelationalResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// The relational engine (precise, transactional). External collaborator.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> GatewayResult<RelationalResult>;

    /// Engine wall clock, used for conflict resolution timestamps.
    fn now(&self) -> DateTime<Utc>;
}

/// A scored ANN hit from the vector engine.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

/// The vector engine (approximate, semantic). External collaborator.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dim: usize) -> GatewayResult<()>;

    async fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        payload: HashMap<String, Value>,
    ) -> GatewayResult<()>;

    async fn delete(&self, id: &str) -> GatewayResult<()>;

    async fn search(
        &self,
        tenant: &str,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> GatewayResult<Vec<ScoredHit>>;
}

/// Turns text into a fixed-dimension vector. Deterministic for identical
/// inputs within a deployment.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dim(&self) -> usize;

    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> GatewayResult<Vec<Vec<f32>>>;
}

/// An LLM-backed intent classification.
#[derive(Debug, Clone)]
pub struct LlmIntent {
    pub kind: QueryKind,
    pub confidence: f32,
    pub reason: String,
}

/// Optional LLM tier for intent parsing. Must respect the caller's deadline;
/// never authoritative.
#[async_trait]
pub trait IntentProvider: Send + Sync {
    async fn classify(&self, text: &str) -> GatewayResult<LlmIntent>;
}

/// Query result cache. Last-writer-wins; never authoritative.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<Value>>;

    async fn put(&self, key: &str, value: &Value, ttl_seconds: i64) -> GatewayResult<()>;
}
