// src/concepts/store.rs

//! Concept store: CRUD with lifecycle rules, semantic search and strength
//! maintenance. The store is the only writer to the vector and metadata
//! backends—no other component touches them directly.
//!
//! Atomicity contract for creates: vector first, metadata second; on a
//! metadata failure the just-written vector is deleted so neither side
//! remains.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{
    Concept, ConceptDraft, ConceptPatch, ScoredConcept, SearchQuery, MAX_DESCRIPTION_BYTES,
    MAX_ID_BYTES, MAX_NAME_BYTES,
};
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{EmbeddingProvider, VectorStore};
use crate::utils::{now_ms, KeyedLocks};

/// Backoff schedule for idempotent vector/embedding operations.
const RETRY_DELAYS_MS: [u64; 3] = [100, 250, 600];

pub struct ConceptStore {
    pub(super) pool: SqlitePool,
    pub(super) vectors: Arc<dyn VectorStore>,
    pub(super) embeddings: Arc<dyn EmbeddingProvider>,
    pub(super) locks: KeyedLocks,
    pub(super) dim: usize,
    pub(super) search_timeout: Duration,
}

impl ConceptStore {
    pub fn new(
        pool: SqlitePool,
        vectors: Arc<dyn VectorStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        dim: usize,
        search_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            vectors,
            embeddings,
            locks: KeyedLocks::new(),
            dim,
            search_timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Create a concept. Generates an id if absent, embeds name +
    /// description when no vector is supplied, and persists vector side
    /// first, metadata second.
    pub async fn create(&self, tenant: &str, draft: ConceptDraft) -> GatewayResult<Concept> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(GatewayError::internal("concept name must not be empty"));
        }
        validate_sizes(&name, &draft.description)?;

        let id = match draft.id {
            Some(id) if !id.trim().is_empty() => {
                if id.len() > MAX_ID_BYTES {
                    return Err(GatewayError::internal("concept id exceeds 64 bytes"));
                }
                id
            }
            _ => Uuid::new_v4().to_string(),
        };

        let vector = match draft.vector {
            Some(v) => self.validate_vector(v)?,
            None => {
                let text = embed_text(&name, &draft.description);
                self.embed_with_retry(&text).await?
            }
        };

        let _guard = self.locks.acquire(&id).await;

        let existing = sqlx::query("SELECT id FROM concepts WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(GatewayError::internal(format!(
                "concept {} already exists",
                id
            )));
        }

        // Vector side first.
        self.upsert_vector(&id, &vector, tenant, &name).await?;

        let now = now_ms();
        let metadata_json = serde_json::to_string(&Value::Object(draft.metadata.clone()))?;
        let vector_json = serde_json::to_string(&vector)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO concepts
                (id, tenant, name, description, vector, metadata, usage_count, strength, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, 0.0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(tenant)
        .bind(&name)
        .bind(&draft.description)
        .bind(&vector_json)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(e) = inserted {
            // Compensate: the metadata write failed, so the vector written
            // above must not remain.
            if let Err(cleanup) = self.delete_vector(&id).await {
                warn!("Compensating vector delete for {} failed: {}", id, cleanup);
            }
            return Err(e.into());
        }

        debug!("Created concept {} ({})", id, name);
        self.get(tenant, &id).await
    }

    pub async fn get(&self, tenant: &str, id: &str) -> GatewayResult<Concept> {
        let row = sqlx::query("SELECT * FROM concepts WHERE id = ? AND tenant = ?")
            .bind(id)
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| concept_from_row(&r))
            .transpose()?
            .ok_or_else(|| GatewayError::not_found(format!("concept {}", id)))
    }

    /// Apply a partial update. Name or description changes re-embed the
    /// concept; metadata-only patches leave the vector untouched.
    pub async fn update(
        &self,
        tenant: &str,
        id: &str,
        patch: ConceptPatch,
    ) -> GatewayResult<Concept> {
        let _guard = self.locks.acquire(id).await;

        let current = self.get(tenant, id).await?;
        if patch.is_empty() {
            return Ok(current);
        }

        let name = patch.name.unwrap_or_else(|| current.name.clone());
        let description = patch
            .description
            .unwrap_or_else(|| current.description.clone());
        if name.trim().is_empty() {
            return Err(GatewayError::internal("concept name must not be empty"));
        }
        validate_sizes(&name, &description)?;

        let metadata = patch.metadata.unwrap_or_else(|| current.metadata.clone());
        let reembed = name != current.name || description != current.description;

        let vector_json = if reembed {
            let vector = self
                .embed_with_retry(&embed_text(&name, &description))
                .await?;
            self.upsert_vector(id, &vector, tenant, &name).await?;
            Some(serde_json::to_string(&vector)?)
        } else {
            None
        };

        let now = now_ms();
        let metadata_json = serde_json::to_string(&Value::Object(metadata))?;
        if let Some(vector_json) = vector_json {
            sqlx::query(
                "UPDATE concepts SET name = ?, description = ?, metadata = ?, vector = ?, updated_at = ? WHERE id = ? AND tenant = ?",
            )
            .bind(&name)
            .bind(&description)
            .bind(&metadata_json)
            .bind(&vector_json)
            .bind(now)
            .bind(id)
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE concepts SET name = ?, description = ?, metadata = ?, updated_at = ? WHERE id = ? AND tenant = ?",
            )
            .bind(&name)
            .bind(&description)
            .bind(&metadata_json)
            .bind(now)
            .bind(id)
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        }

        self.recompute_strength(tenant, id).await?;
        self.get(tenant, id).await
    }

    /// Delete a concept, its vector, and every incident relation.
    pub async fn delete(&self, tenant: &str, id: &str) -> GatewayResult<()> {
        let _guard = self.locks.acquire(id).await;

        // Existence check doubles as tenant scoping.
        self.get(tenant, id).await?;
        let neighbors = self.neighbor_ids(id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM concept_relations WHERE source_id = ? OR target_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM concepts WHERE id = ? AND tenant = ?")
            .bind(id)
            .bind(tenant)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // The metadata row is gone, so search can no longer surface the
        // concept even if this delete has to be retried later.
        self.delete_vector(id).await?;

        self.refresh_neighbor_strengths(tenant, &neighbors).await;
        debug!("Deleted concept {}", id);
        Ok(())
    }

    /// Bump the usage counter and refresh strength.
    pub async fn record_usage(&self, tenant: &str, id: &str) -> GatewayResult<()> {
        let result = sqlx::query(
            "UPDATE concepts SET usage_count = usage_count + 1 WHERE id = ? AND tenant = ?",
        )
        .bind(id)
        .bind(tenant)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::not_found(format!("concept {}", id)));
        }
        self.recompute_strength(tenant, id).await?;
        Ok(())
    }

    /// Top-k concepts by cosine similarity, sorted descending.
    pub async fn semantic_search(
        &self,
        tenant: &str,
        query: SearchQuery,
        k: usize,
        threshold: f32,
    ) -> GatewayResult<Vec<ScoredConcept>> {
        let vector = match query {
            SearchQuery::Vector(v) => self.validate_vector(v)?,
            SearchQuery::Text(text) => {
                if text.trim().is_empty() {
                    return Err(GatewayError::EmptyQuery);
                }
                self.embed_with_retry(&text).await?
            }
        };

        let hits = tokio::time::timeout(
            self.search_timeout,
            self.with_retry("vector search", || {
                self.vectors.search(tenant, &vector, k, threshold)
            }),
        )
        .await
        .map_err(|_| GatewayError::deadline("semantic search"))??;

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        // Hydrate from the metadata side; the vector engine only holds ids
        // and a thin filter payload.
        let placeholders = vec!["?"; hits.len()].join(", ");
        let sql = format!(
            "SELECT * FROM concepts WHERE tenant = ? AND id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(tenant);
        for hit in &hits {
            query = query.bind(&hit.id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut by_id: HashMap<String, Concept> = HashMap::new();
        for row in &rows {
            let concept = concept_from_row(row)?;
            by_id.insert(concept.id.clone(), concept);
        }

        // Preserve the vector engine's similarity ordering.
        let scored = hits
            .into_iter()
            .filter_map(|hit| {
                by_id.remove(&hit.id).map(|concept| ScoredConcept {
                    concept,
                    score: hit.score,
                })
            })
            .collect();

        Ok(scored)
    }

    pub async fn list(
        &self,
        tenant: &str,
        limit: usize,
        offset: usize,
    ) -> GatewayResult<Vec<Concept>> {
        let rows = sqlx::query(
            "SELECT * FROM concepts WHERE tenant = ? ORDER BY updated_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(tenant)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(concept_from_row).collect()
    }

    pub async fn count(&self, tenant: &str) -> GatewayResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM concepts WHERE tenant = ?")
            .bind(tenant)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Approximate bytes of stored concept content, for capacity checks.
    pub async fn storage_bytes(&self, tenant: &str) -> GatewayResult<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(LENGTH(name) + LENGTH(description) + LENGTH(metadata)), 0) as bytes FROM concepts WHERE tenant = ?",
        )
        .bind(tenant)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("bytes"))
    }

    // =====================================
    // Internal helpers
    // =====================================

    pub(super) fn validate_vector(&self, vector: Vec<f32>) -> GatewayResult<Vec<f32>> {
        if vector.len() != self.dim {
            return Err(GatewayError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(GatewayError::internal("vector contains non-finite values"));
        }
        Ok(vector)
    }

    pub(super) async fn embed_with_retry(&self, text: &str) -> GatewayResult<Vec<f32>> {
        let text = text.to_string();
        let vector = self
            .with_retry("embed", || self.embeddings.embed(&text))
            .await?;
        self.validate_vector(vector)
    }

    pub(super) async fn upsert_vector(
        &self,
        id: &str,
        vector: &[f32],
        tenant: &str,
        name: &str,
    ) -> GatewayResult<()> {
        self.with_retry("vector upsert", || {
            let mut payload = HashMap::new();
            payload.insert("tenant".to_string(), Value::from(tenant));
            payload.insert("name".to_string(), Value::from(name));
            self.vectors.upsert(id, vector, payload)
        })
        .await
    }

    pub(super) async fn delete_vector(&self, id: &str) -> GatewayResult<()> {
        self.with_retry("vector delete", || self.vectors.delete(id))
            .await
    }

    /// Retry an idempotent upstream operation on transient failures.
    pub(super) async fn with_retry<T, F, Fut>(&self, op: &str, f: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < RETRY_DELAYS_MS.len() => {
                    let delay = RETRY_DELAYS_MS[attempt];
                    attempt += 1;
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        op,
                        attempt,
                        RETRY_DELAYS_MS.len(),
                        e
                    );
                    crate::metrics::record_upstream_retry(op);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `strength = clamp(0.1*ln(1+usage) + 0.05*degree + 0.5*avg(edge_strength), 0, 1)`
    /// Synchronous for the touched node; neighbors are refreshed
    /// opportunistically.
    pub(super) async fn recompute_strength(&self, tenant: &str, id: &str) -> GatewayResult<f32> {
        let row = sqlx::query("SELECT usage_count FROM concepts WHERE id = ? AND tenant = ?")
            .bind(id)
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(GatewayError::not_found(format!("concept {}", id)));
        };
        let usage: i64 = row.get("usage_count");

        let edges = sqlx::query(
            "SELECT COUNT(*) as degree, COALESCE(AVG(strength), 0.0) as avg_strength FROM concept_relations WHERE source_id = ? OR target_id = ?",
        )
        .bind(id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        let degree: i64 = edges.get("degree");
        let avg_strength: f64 = edges.get("avg_strength");

        let strength = (0.1 * ((1 + usage) as f64).ln()
            + 0.05 * degree as f64
            + 0.5 * avg_strength)
            .clamp(0.0, 1.0);

        sqlx::query("UPDATE concepts SET strength = ? WHERE id = ? AND tenant = ?")
            .bind(strength)
            .bind(id)
            .bind(tenant)
            .execute(&self.pool)
            .await?;

        Ok(strength as f32)
    }

    pub(super) async fn neighbor_ids(&self, id: &str) -> GatewayResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT CASE WHEN source_id = ? THEN target_id ELSE source_id END as other
            FROM concept_relations
            WHERE source_id = ? OR target_id = ?
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("other")).collect())
    }

    pub(super) async fn refresh_neighbor_strengths(&self, tenant: &str, ids: &[String]) {
        let refreshes = ids.iter().map(|id| async move {
            if let Err(e) = self.recompute_strength(tenant, id).await {
                warn!("Opportunistic strength refresh for {} failed: {}", id, e);
            }
        });
        futures::future::join_all(refreshes).await;
    }
}

fn embed_text(name: &str, description: &str) -> String {
    if description.trim().is_empty() {
        name.to_string()
    } else {
        format!("{}\n{}", name, description)
    }
}

fn validate_sizes(name: &str, description: &str) -> GatewayResult<()> {
    if name.len() > MAX_NAME_BYTES {
        return Err(GatewayError::internal("concept name exceeds 512 bytes"));
    }
    if description.len() > MAX_DESCRIPTION_BYTES {
        return Err(GatewayError::internal("concept description exceeds 64 KiB"));
    }
    Ok(())
}

pub(crate) fn concept_from_row(row: &SqliteRow) -> GatewayResult<Concept> {
    let metadata_json: String = row.get("metadata");
    let metadata = match serde_json::from_str::<Value>(&metadata_json)? {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    let vector = row
        .get::<Option<String>, _>("vector")
        .map(|v| serde_json::from_str::<Vec<f32>>(&v))
        .transpose()?;

    Ok(Concept {
        id: row.get("id"),
        tenant: row.get("tenant"),
        name: row.get("name"),
        description: row.get("description"),
        vector,
        metadata,
        usage_count: row.get("usage_count"),
        strength: row.get::<f64, _>("strength") as f32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
