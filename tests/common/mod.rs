// tests/common/mod.rs
// Shared test fixtures: in-memory engines standing in for the external
// collaborators (Qdrant, OpenAI, the relational engine).

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conceptgate::api::{Gateway, GatewayProviders};
use conceptgate::config::GatewayConfig;
use conceptgate::error::{GatewayError, GatewayResult};
use conceptgate::providers::{
    EmbeddingProvider, IntentProvider, LlmIntent, QueryCache, RelationalResult, RelationalStore,
    Row, ScoredHit, SqliteQueryCache, VectorStore,
};
use conceptgate::quota::TenantLimits;
use conceptgate::sync::MappingRule;

pub const TEST_DIM: usize = 8;

pub async fn setup_test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory pool");
    conceptgate::db::init_schema(&pool)
        .await
        .expect("Failed to init schema");
    pool
}

pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.qdrant.vector_dim = TEST_DIM;
    config.embedding.dim = TEST_DIM;
    config
}

/// Deterministic embeddings with optional pinned vectors per text.
#[derive(Default)]
pub struct MockEmbeddings {
    dim: usize,
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    pub calls: AtomicUsize,
    fail: Mutex<bool>,
}

impl MockEmbeddings {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            pinned: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            fail: Mutex::new(false),
        }
    }

    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        self.pinned.lock().insert(text.to_string(), vector);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }

    fn derive(&self, text: &str) -> Vec<f32> {
        // Stable pseudo-embedding from the text bytes.
        let mut vector = vec![0.0f32; self.dim];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dim] += (byte as f32 % 13.0) + 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
        vector.iter_mut().for_each(|v| *v /= norm);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddings {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock() {
            return Err(GatewayError::deadline("embedding provider"));
        }
        if let Some(v) = self.pinned.lock().get(text) {
            return Ok(v.clone());
        }
        Ok(self.derive(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> GatewayResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// In-memory vector engine with cosine search and failure/latency injection.
#[derive(Default)]
pub struct MockVectorStore {
    points: Mutex<HashMap<String, (Vec<f32>, HashMap<String, Value>)>>,
    pub upsert_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    fail_upserts: Mutex<usize>,
    search_delay: Mutex<Option<Duration>>,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upserts fail with a backend error.
    pub fn fail_next_upserts(&self, n: usize) {
        *self.fail_upserts.lock() = n;
    }

    pub fn set_search_delay(&self, delay: Duration) {
        *self.search_delay.lock() = Some(delay);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.points.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn ensure_collection(&self, _name: &str, _dim: usize) -> GatewayResult<()> {
        Ok(())
    }

    async fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        payload: HashMap<String, Value>,
    ) -> GatewayResult<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = self.fail_upserts.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(GatewayError::upstream("vector backend write failed"));
            }
        }
        self.points
            .lock()
            .insert(id.to_string(), (vector.to_vec(), payload));
        Ok(())
    }

    async fn delete(&self, id: &str) -> GatewayResult<()> {
        self.points.lock().remove(id);
        Ok(())
    }

    async fn search(
        &self,
        tenant: &str,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> GatewayResult<Vec<ScoredHit>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.search_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut hits: Vec<ScoredHit> = self
            .points
            .lock()
            .iter()
            .filter(|(_, (_, payload))| {
                payload.get("tenant").and_then(|v| v.as_str()) == Some(tenant)
            })
            .map(|(id, (stored, payload))| ScoredHit {
                id: id.clone(),
                score: cosine(vector, stored),
                payload: payload.clone(),
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(k);
        Ok(hits)
    }
}

/// Scripted relational engine: pops canned results and records every call.
#[derive(Default)]
pub struct MockRelationalStore {
    responses: Mutex<Vec<RelationalResult>>,
    pub calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    fail: Mutex<bool>,
}

impl MockRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rows(&self, rows: Vec<Row>) {
        self.responses.lock().push(RelationalResult {
            rows,
            rows_affected: 0,
        });
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RelationalStore for MockRelationalStore {
    async fn execute(&self, sql: &str, _params: &[Value]) -> GatewayResult<RelationalResult> {
        self.calls.lock().push(sql.to_string());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail.lock() {
            return Err(GatewayError::upstream("relational engine down"));
        }
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            Ok(RelationalResult::default())
        } else {
            Ok(responses.remove(0))
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Scripted LLM intent tier.
pub struct MockIntentProvider {
    pub intent: LlmIntent,
    pub delay: Option<Duration>,
}

#[async_trait]
impl IntentProvider for MockIntentProvider {
    async fn classify(&self, _text: &str) -> GatewayResult<LlmIntent> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.intent.clone())
    }
}

/// Everything a gateway test needs in one place.
pub struct TestHarness {
    pub gateway: Gateway,
    pub pool: SqlitePool,
    pub relational: Arc<MockRelationalStore>,
    pub vectors: Arc<MockVectorStore>,
    pub embeddings: Arc<MockEmbeddings>,
}

pub async fn create_test_gateway() -> TestHarness {
    create_test_gateway_with(test_config(), None, Vec::new()).await
}

pub async fn create_test_gateway_with(
    config: GatewayConfig,
    llm_intent: Option<Arc<dyn IntentProvider>>,
    mapping_rules: Vec<MappingRule>,
) -> TestHarness {
    let pool = setup_test_pool().await;
    let relational = Arc::new(MockRelationalStore::new());
    let vectors = Arc::new(MockVectorStore::new());
    let embeddings = Arc::new(MockEmbeddings::new(config.qdrant.vector_dim));
    let cache: Arc<dyn QueryCache> = Arc::new(SqliteQueryCache::new(pool.clone(), true));

    let providers = GatewayProviders {
        relational: relational.clone(),
        vectors: vectors.clone(),
        embeddings: embeddings.clone(),
        llm_intent,
        cache: Some(cache),
    };

    let gateway = Gateway::new(config, pool.clone(), providers, mapping_rules)
        .await
        .expect("Failed to build gateway");

    gateway
        .set_tenant_limits(&TenantLimits::unlimited("t1"))
        .await
        .expect("Failed to seed tenant limits");

    TestHarness {
        gateway,
        pool,
        relational,
        vectors,
        embeddings,
    }
}

/// Harness for synchronizer tests: the relational engine is a real SQLite
/// adapter over its own pool, so mapping rules run against actual tables.
pub struct SyncHarness {
    pub gateway: Gateway,
    pub pool: SqlitePool,
    pub relational_pool: SqlitePool,
    pub vectors: Arc<MockVectorStore>,
    pub embeddings: Arc<MockEmbeddings>,
}

pub async fn create_sync_harness(rules: Vec<MappingRule>) -> SyncHarness {
    let config = test_config();
    let pool = setup_test_pool().await;

    let relational_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create relational pool");
    let relational = Arc::new(conceptgate::providers::SqliteRelationalStore::new(
        relational_pool.clone(),
    ));

    let vectors = Arc::new(MockVectorStore::new());
    let embeddings = Arc::new(MockEmbeddings::new(config.qdrant.vector_dim));

    let providers = GatewayProviders {
        relational,
        vectors: vectors.clone(),
        embeddings: embeddings.clone(),
        llm_intent: None,
        cache: None,
    };

    let gateway = Gateway::new(config, pool.clone(), providers, rules)
        .await
        .expect("Failed to build gateway");
    gateway
        .set_tenant_limits(&TenantLimits::unlimited("t1"))
        .await
        .expect("Failed to seed tenant limits");

    SyncHarness {
        gateway,
        pool,
        relational_pool,
        vectors,
        embeddings,
    }
}

pub fn products_rule() -> MappingRule {
    MappingRule {
        tenant: "t1".into(),
        table: "products".into(),
        primary_key: "id".into(),
        name_column: "name".into(),
        description_column: Some("summary".into()),
        metadata_columns: vec!["category".into()],
        writeback_columns: vec!["name".into(), "summary".into()],
        updated_at_column: "updated_at".into(),
        conflict_policy: conceptgate::sync::ConflictPolicy::LastWriterWins,
        create_rows: false,
    }
}

pub async fn create_products_table(pool: &SqlitePool) {
    sqlx::query(
        r#"
        CREATE TABLE products (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            summary TEXT,
            category TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to create products table");
}

pub async fn insert_product(
    pool: &SqlitePool,
    id: i64,
    name: &str,
    summary: &str,
    category: &str,
    updated_at: i64,
) {
    sqlx::query("INSERT INTO products (id, name, summary, category, updated_at) VALUES (?, ?, ?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(summary)
        .bind(category)
        .bind(updated_at)
        .execute(pool)
        .await
        .expect("Failed to insert product");
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    let mut map = Row::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.clone());
    }
    map
}

/// A unit vector with 1.0 at `axis`.
pub fn basis(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; TEST_DIM];
    v[axis % TEST_DIM] = 1.0;
    v
}

/// A unit vector with the given cosine similarity to `basis(axis)`.
pub fn vector_with_similarity(axis: usize, similarity: f32) -> Vec<f32> {
    let mut v = vec![0.0; TEST_DIM];
    v[axis % TEST_DIM] = similarity;
    v[(axis + 1) % TEST_DIM] = (1.0 - similarity * similarity).sqrt();
    v
}
