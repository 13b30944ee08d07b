// src/api/mod.rs

//! Transport-agnostic gateway surface. HTTP, CLI and dashboard layers live
//! outside the core and call into this facade.

use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::concepts::{
    Concept, ConceptDraft, ConceptPatch, ConceptStore, RelationType, ScoredConcept, SearchQuery,
    Subgraph,
};
use crate::config::GatewayConfig;
use crate::db;
use crate::error::GatewayResult;
use crate::evolution::{AdvancementDecision, EvolutionMetrics, EvolutionState, EvolutionTracker};
use crate::intent::IntentAnalyzer;
use crate::providers::{
    EmbeddingProvider, IntentProvider, QueryCache, RelationalStore, VectorStore,
};
use crate::quota::{QuotaGate, QuotaUsage, Resource, TenantLimits};
use crate::router::{QueryOptions, QueryRouter, ResultSet, RouteInfo};
use crate::sync::{MappingRule, SyncDirection, SyncReport, SyncStatus, Synchronizer};

/// External collaborators the gateway is wired to.
pub struct GatewayProviders {
    pub relational: Arc<dyn RelationalStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub llm_intent: Option<Arc<dyn IntentProvider>>,
    pub cache: Option<Arc<dyn QueryCache>>,
}

/// The evolutionary hybrid database gateway.
#[derive(Clone)]
pub struct Gateway {
    pool: SqlitePool,
    concepts: Arc<ConceptStore>,
    quota: Arc<QuotaGate>,
    evolution: Arc<EvolutionTracker>,
    router: Arc<QueryRouter>,
    sync: Arc<Synchronizer>,
}

impl Gateway {
    pub async fn new(
        config: GatewayConfig,
        pool: SqlitePool,
        providers: GatewayProviders,
        mapping_rules: Vec<MappingRule>,
    ) -> GatewayResult<Self> {
        db::init_schema(&pool).await?;

        providers
            .vectors
            .ensure_collection(&config.qdrant.collection, config.qdrant.vector_dim)
            .await?;

        let concepts = Arc::new(ConceptStore::new(
            pool.clone(),
            providers.vectors.clone(),
            providers.embeddings.clone(),
            config.qdrant.vector_dim,
            Duration::from_millis(config.router.semantic_timeout_ms),
        ));
        let quota = Arc::new(QuotaGate::new(pool.clone()));
        let evolution = Arc::new(EvolutionTracker::load(pool.clone(), config.evolution.clone()).await?);
        let intent = Arc::new(IntentAnalyzer::new(
            config.intent.clone(),
            providers.llm_intent.clone(),
        ));

        let router = Arc::new(QueryRouter::new(
            pool.clone(),
            providers.relational.clone(),
            concepts.clone(),
            intent,
            quota.clone(),
            evolution.clone(),
            providers.cache.clone(),
            config.router.clone(),
        ));

        let sync = Arc::new(Synchronizer::new(
            pool.clone(),
            providers.relational.clone(),
            concepts.clone(),
            mapping_rules,
            config.sync.clone(),
        ));

        Ok(Self {
            pool,
            concepts,
            quota,
            evolution,
            router,
            sync,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn concepts(&self) -> &Arc<ConceptStore> {
        &self.concepts
    }

    pub fn evolution(&self) -> &Arc<EvolutionTracker> {
        &self.evolution
    }

    /// Spawn the background synchronizer task.
    pub fn start_sync(&self) -> tokio::task::JoinHandle<()> {
        self.sync.start()
    }

    pub fn stop_sync(&self) {
        self.sync.stop()
    }

    // =====================================
    // Query path
    // =====================================

    pub async fn query(
        &self,
        tenant: &str,
        text: &str,
        opts: QueryOptions,
    ) -> GatewayResult<(ResultSet, RouteInfo)> {
        self.router.execute(tenant, text, opts).await
    }

    /// Routing decision without execution.
    pub async fn explain_query(&self, tenant: &str, text: &str) -> GatewayResult<RouteInfo> {
        self.router.explain(tenant, text).await
    }

    // =====================================
    // Concept path (admits api_call quota)
    // =====================================

    pub async fn create_concept(
        &self,
        tenant: &str,
        draft: ConceptDraft,
    ) -> GatewayResult<Concept> {
        self.quota.admit(tenant, Resource::ApiCall).await?;

        let current_count = self.concepts.count(tenant).await?;
        self.quota
            .check_capacity(tenant, Resource::Concepts, current_count, 1)
            .await?;

        let delta = (draft.name.len()
            + draft.description.len()
            + Value::Object(draft.metadata.clone()).to_string().len()) as i64;
        let current_bytes = self.concepts.storage_bytes(tenant).await?;
        self.quota
            .check_capacity(tenant, Resource::Storage, current_bytes, delta)
            .await?;

        self.concepts.create(tenant, draft).await
    }

    pub async fn get_concept(&self, tenant: &str, id: &str) -> GatewayResult<Concept> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        let concept = self.concepts.get(tenant, id).await?;

        // Retrieval counts as usage; losing the bump is harmless.
        if let Err(e) = self.concepts.record_usage(tenant, id).await {
            warn!("Failed to record usage for {}: {}", id, e);
        }
        Ok(concept)
    }

    pub async fn update_concept(
        &self,
        tenant: &str,
        id: &str,
        patch: ConceptPatch,
    ) -> GatewayResult<Concept> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        self.concepts.update(tenant, id, patch).await
    }

    pub async fn delete_concept(&self, tenant: &str, id: &str) -> GatewayResult<()> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        self.concepts.delete(tenant, id).await
    }

    pub async fn search_concepts(
        &self,
        tenant: &str,
        query: SearchQuery,
        k: usize,
        threshold: f32,
    ) -> GatewayResult<Vec<ScoredConcept>> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        self.concepts.semantic_search(tenant, query, k, threshold).await
    }

    pub async fn add_relation(
        &self,
        tenant: &str,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
        strength: f32,
    ) -> GatewayResult<()> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        self.concepts
            .add_relation(tenant, source_id, target_id, relation_type, strength)
            .await?;
        Ok(())
    }

    pub async fn remove_relation(
        &self,
        tenant: &str,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
    ) -> GatewayResult<()> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        self.concepts
            .remove_relation(tenant, source_id, target_id, relation_type)
            .await
    }

    /// Neighborhood of `root_id` up to `depth`, or the tenant's whole graph
    /// when no root is given.
    pub async fn get_graph(
        &self,
        tenant: &str,
        root_id: Option<&str>,
        depth: usize,
    ) -> GatewayResult<Subgraph> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        match root_id {
            Some(root) => self.concepts.neighbors(tenant, root, depth).await,
            None => self.concepts.full_graph(tenant).await,
        }
    }

    pub async fn merge_concepts(
        &self,
        tenant: &str,
        loser_id: &str,
        winner_id: &str,
    ) -> GatewayResult<Concept> {
        self.quota.admit(tenant, Resource::ApiCall).await?;
        self.concepts.merge(tenant, loser_id, winner_id).await
    }

    // =====================================
    // Evolution / metrics
    // =====================================

    pub fn get_evolution(&self) -> EvolutionMetrics {
        self.evolution.snapshot()
    }

    pub fn evaluate_evolution(&self) -> AdvancementDecision {
        self.evolution.evaluate_advancement()
    }

    /// Operator-triggered phase change; `force` bypasses the evaluator's
    /// preconditions.
    pub async fn trigger_evolution(
        &self,
        target_phase: Option<u8>,
        force: bool,
    ) -> GatewayResult<EvolutionState> {
        self.evolution.trigger(target_phase, force).await
    }

    // =====================================
    // Sync
    // =====================================

    pub async fn sync_status(&self) -> GatewayResult<SyncStatus> {
        self.sync.status().await
    }

    pub async fn run_sync_now(&self, direction: SyncDirection) -> GatewayResult<SyncReport> {
        self.sync.run_once(direction).await
    }

    // =====================================
    // Tenancy
    // =====================================

    pub async fn usage(&self, tenant: &str) -> GatewayResult<QuotaUsage> {
        self.quota.usage(tenant).await
    }

    pub async fn set_tenant_limits(&self, limits: &TenantLimits) -> GatewayResult<()> {
        self.quota.set_limits(limits).await
    }
}
