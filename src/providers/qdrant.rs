// src/providers/qdrant.rs

//! Qdrant adapter for the vector engine.
//!
//! The gateway owns a single collection; points are keyed by concept id
//! (UUID) and carry a small scalar payload (tenant, name) used for
//! filtering. Concept data itself stays on the metadata side.

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{ScoredHit, VectorStore};
use crate::error::{GatewayError, GatewayResult};

pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
    dim: usize,
}

impl QdrantVectorStore {
    /// Connect and ensure the backing collection exists.
    pub async fn new(url: &str, collection: &str, dim: usize) -> GatewayResult<Self> {
        // Skip compatibility check to allow minor version mismatches
        let client = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .map_err(|e| GatewayError::upstream(format!("failed to connect to Qdrant: {}", e)))?;

        let store = Self {
            client,
            collection: collection.to_string(),
            dim,
        };
        store.ensure_collection(collection, dim).await?;
        Ok(store)
    }

    fn to_qdrant_value(value: &Value) -> QdrantValue {
        match value {
            Value::Null => QdrantValue::from(String::new()),
            Value::Bool(b) => QdrantValue::from(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    QdrantValue::from(i)
                } else {
                    QdrantValue::from(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => QdrantValue::from(s.clone()),
            other => QdrantValue::from(other.to_string()),
        }
    }

    fn to_json_value(value: &QdrantValue) -> Value {
        if let Some(s) = value.as_str() {
            Value::from(s.to_string())
        } else if let Some(i) = value.as_integer() {
            Value::from(i)
        } else if let Some(f) = value.as_double() {
            Value::from(f)
        } else if let Some(b) = value.as_bool() {
            Value::from(b)
        } else {
            Value::Null
        }
    }

    fn point_id_string(id: &PointId) -> Option<String> {
        use qdrant_client::qdrant::point_id::PointIdOptions;
        match &id.point_id_options {
            Some(PointIdOptions::Uuid(u)) => Some(u.clone()),
            Some(PointIdOptions::Num(n)) => Some(n.to_string()),
            None => None,
        }
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> GatewayResult<()> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| GatewayError::upstream(format!("Qdrant collection check: {}", e)))?;

        if !exists {
            info!("Creating Qdrant collection: {}", name);
            match self
                .client
                .create_collection(
                    CreateCollectionBuilder::new(name)
                        .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
                )
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    // Another process may have created it between the exists
                    // check and the create call.
                    let msg = e.to_string();
                    if msg.contains("already exists") {
                        debug!("Collection {} already exists", name);
                    } else {
                        return Err(GatewayError::upstream(format!(
                            "failed to create collection {}: {}",
                            name, e
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    async fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        payload: HashMap<String, Value>,
    ) -> GatewayResult<()> {
        if vector.len() != self.dim {
            return Err(GatewayError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }

        let qdrant_payload: HashMap<String, QdrantValue> = payload
            .iter()
            .map(|(k, v)| (k.clone(), Self::to_qdrant_value(v)))
            .collect();

        let point = PointStruct::new(id.to_string(), vector.to_vec(), qdrant_payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(|e| GatewayError::upstream(format!("Qdrant upsert: {}", e)))?;

        debug!("Upserted point {} into {}", id, self.collection);
        Ok(())
    }

    async fn delete(&self, id: &str) -> GatewayResult<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(vec![PointId::from(id.to_string())])
                    .wait(true),
            )
            .await
            .map_err(|e| GatewayError::upstream(format!("Qdrant delete: {}", e)))?;

        debug!("Deleted point {} from {}", id, self.collection);
        Ok(())
    }

    async fn search(
        &self,
        tenant: &str,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> GatewayResult<Vec<ScoredHit>> {
        if vector.len() != self.dim {
            return Err(GatewayError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }

        let filter = Filter::must([Condition::matches("tenant", tenant.to_string())]);

        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector.to_vec(), k as u64)
                    .filter(filter)
                    .score_threshold(threshold)
                    .with_payload(true),
            )
            .await
            .map_err(|e| GatewayError::upstream(format!("Qdrant search: {}", e)))?;

        let hits = results
            .result
            .into_iter()
            .filter_map(|point| {
                let id = point.id.as_ref().and_then(Self::point_id_string)?;
                let payload = point
                    .payload
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::to_json_value(v)))
                    .collect();
                Some(ScoredHit {
                    id,
                    score: point.score,
                    payload,
                })
            })
            .collect::<Vec<_>>();

        if hits.is_empty() {
            warn!("Qdrant search returned no hits above threshold {}", threshold);
        }

        Ok(hits)
    }
}
