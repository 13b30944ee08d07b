// src/router/mod.rs

//! Query router: intent classification, routing decision, cross-engine
//! orchestration, result merging and per-query tracking.
//!
//! Ordering contract: the query log entry is written before the reply is
//! returned, for every outcome including errors, and the evolution tracker
//! observes the query after the result is computed and before the reply.

pub mod merge;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::concepts::{ConceptStore, SearchQuery};
use crate::config::RouterConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::evolution::{ratio_for_phase, EvolutionTracker, QueryObservation};
use crate::intent::{IntentAnalyzer, IntentDecision, QueryKind};
use crate::providers::{QueryCache, RelationalStore, Row};
use crate::quota::{QuotaGate, Resource};
use crate::utils::{normalize_query, now_ms, sha256_hex};

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub k: Option<usize>,
    pub threshold: Option<f32>,
    /// Preferred layer; overrides intent analysis when set.
    pub preferred: Option<QueryKind>,
    #[serde(default)]
    pub bypass_cache: bool,
}

/// The router's per-call decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInfo {
    pub kind: QueryKind,
    pub confidence: f32,
    pub reasoning: String,
    pub cached: bool,
    pub degraded: bool,
    /// Error of the failed branch when the other one carried the query.
    pub partial_error: Option<String>,
    pub sql_latency_ms: Option<u64>,
    pub semantic_latency_ms: Option<u64>,
    pub total_latency_ms: u64,
    pub result_count: usize,
}

impl RouteInfo {
    fn from_decision(decision: &IntentDecision) -> Self {
        Self {
            kind: decision.kind,
            confidence: decision.confidence,
            reasoning: decision.reasoning.clone(),
            cached: false,
            degraded: false,
            partial_error: None,
            sql_latency_ms: None,
            semantic_latency_ms: None,
            total_latency_ms: 0,
            result_count: 0,
        }
    }
}

/// One merged result: a relational row or a scored concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultItem {
    pub source: QueryKind,
    /// Stable deduplication key.
    pub key: String,
    /// Normalized score: 1.0 for rows, cosine similarity for concepts.
    pub score: f32,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub items: Vec<ResultItem>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Cached representation of a completed query.
#[derive(Serialize, Deserialize)]
struct CachedQuery {
    items: Vec<ResultItem>,
    route: RouteInfo,
}

struct BranchOutcome {
    result: GatewayResult<Vec<ResultItem>>,
    latency_ms: u64,
}

pub struct QueryRouter {
    pool: SqlitePool,
    relational: Arc<dyn RelationalStore>,
    concepts: Arc<ConceptStore>,
    intent: Arc<IntentAnalyzer>,
    quota: Arc<QuotaGate>,
    evolution: Arc<EvolutionTracker>,
    cache: Option<Arc<dyn QueryCache>>,
    config: RouterConfig,
}

impl QueryRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        relational: Arc<dyn RelationalStore>,
        concepts: Arc<ConceptStore>,
        intent: Arc<IntentAnalyzer>,
        quota: Arc<QuotaGate>,
        evolution: Arc<EvolutionTracker>,
        cache: Option<Arc<dyn QueryCache>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            pool,
            relational,
            concepts,
            intent,
            quota,
            evolution,
            cache,
            config,
        }
    }

    /// Route and execute one query. Exactly one query log entry is written
    /// per call, before the reply.
    pub async fn execute(
        &self,
        tenant: &str,
        text: &str,
        opts: QueryOptions,
    ) -> GatewayResult<(ResultSet, RouteInfo)> {
        let started = Instant::now();
        let mut decision: Option<IntentDecision> = None;

        let mut outcome = self
            .execute_inner(tenant, text, &opts, &mut decision)
            .await;

        let total_ms = started.elapsed().as_millis() as u64;
        if let Ok((set, info)) = &mut outcome {
            info.total_latency_ms = total_ms;
            info.result_count = set.len();
        }

        self.write_query_log(tenant, text, &opts, &decision, &outcome, total_ms)
            .await;

        if let Ok((_, info)) = &outcome {
            self.evolution.observe(QueryObservation {
                kind: info.kind,
                confidence: info.confidence,
                sql_latency_ms: info.sql_latency_ms,
                semantic_latency_ms: info.semantic_latency_ms,
                merged: info.kind == QueryKind::Hybrid && !info.degraded && !info.cached,
                cached: info.cached,
            });
            crate::metrics::record_query(info.kind.as_str(), info.cached);
            crate::metrics::record_query_duration(info.kind.as_str(), total_ms);
        }

        outcome
    }

    /// Classify without executing.
    pub async fn explain(&self, tenant: &str, text: &str) -> GatewayResult<RouteInfo> {
        let ratio = self.effective_ratio(tenant).await?;
        let decision = self.intent.analyze(text, None, ratio).await?;
        Ok(RouteInfo::from_decision(&decision))
    }

    async fn execute_inner(
        &self,
        tenant: &str,
        text: &str,
        opts: &QueryOptions,
        decision_slot: &mut Option<IntentDecision>,
    ) -> GatewayResult<(ResultSet, RouteInfo)> {
        if text.trim().is_empty() {
            return Err(GatewayError::EmptyQuery);
        }

        self.quota.admit(tenant, Resource::Query).await?;

        let fingerprint = self.fingerprint(tenant, text, opts);

        if let Some(cache) = &self.cache {
            if self.config.cache_enabled && !opts.bypass_cache {
                match cache.get(&fingerprint).await {
                    Ok(Some(value)) => {
                        if let Ok(cached) = serde_json::from_value::<CachedQuery>(value) {
                            debug!("Cache hit for query fingerprint {}", fingerprint);
                            let mut route = cached.route;
                            route.cached = true;
                            route.sql_latency_ms = None;
                            route.semantic_latency_ms = None;
                            decision_slot.replace(IntentDecision {
                                kind: route.kind,
                                confidence: route.confidence,
                                reasoning: route.reasoning.clone(),
                            });
                            crate::metrics::record_cache_result(true);
                            return Ok((ResultSet { items: cached.items }, route));
                        }
                    }
                    Ok(None) => crate::metrics::record_cache_result(false),
                    // The cache is never authoritative; fall through.
                    Err(e) => warn!("Cache lookup failed: {}", e),
                }
            }
        }

        let ratio = self.effective_ratio(tenant).await?;
        let decision = self.intent.analyze(text, opts.preferred, ratio).await?;
        decision_slot.replace(decision.clone());

        let deadline = Duration::from_millis(self.config.execute_timeout_ms);
        let k = opts.k.unwrap_or(self.config.default_k);
        let threshold = opts.threshold.unwrap_or(self.config.default_threshold);

        let mut route = RouteInfo::from_decision(&decision);

        let items = match decision.kind {
            QueryKind::Sql => {
                let outcome = self.sql_branch(text, deadline).await;
                route.sql_latency_ms = Some(outcome.latency_ms);
                outcome.result?
            }
            QueryKind::Semantic => {
                let outcome = self.semantic_branch(tenant, text, k, threshold, deadline).await;
                route.semantic_latency_ms = Some(outcome.latency_ms);
                outcome.result?
            }
            QueryKind::Hybrid => {
                // Both branches run concurrently under one deadline; a
                // failure on one side does not cancel the sibling.
                let (sql_out, semantic_out) = tokio::join!(
                    self.sql_branch(text, deadline),
                    self.semantic_branch(tenant, text, k, threshold, deadline)
                );
                route.sql_latency_ms = Some(sql_out.latency_ms);
                route.semantic_latency_ms = Some(semantic_out.latency_ms);

                match (sql_out.result, semantic_out.result) {
                    (Ok(sql_items), Ok(semantic_items)) => {
                        merge::merge_branches(sql_items, semantic_items)
                    }
                    (Ok(sql_items), Err(e)) => {
                        route.degraded = true;
                        route.partial_error = Some(e.to_string());
                        sql_items
                    }
                    (Err(e), Ok(semantic_items)) => {
                        route.degraded = true;
                        route.partial_error = Some(e.to_string());
                        semantic_items
                    }
                    (Err(sql_err), Err(semantic_err)) => {
                        // Surface whichever error arrived first.
                        let err = if sql_out.latency_ms <= semantic_out.latency_ms {
                            merge::combine_failures(sql_err, &semantic_err)
                        } else {
                            merge::combine_failures(semantic_err, &sql_err)
                        };
                        return Err(err);
                    }
                }
            }
        };

        route.result_count = items.len();

        // Degraded results are not memoized; the next call gets a fresh shot
        // at the failed branch.
        if let Some(cache) = &self.cache {
            if self.config.cache_enabled && !opts.bypass_cache && !route.degraded {
                let cached = CachedQuery {
                    items: items.clone(),
                    route: route.clone(),
                };
                if let Ok(value) = serde_json::to_value(&cached) {
                    if let Err(e) = cache
                        .put(&fingerprint, &value, self.config.cache_ttl_seconds)
                        .await
                    {
                        warn!("Cache put failed: {}", e);
                    }
                }
            }
        }

        Ok((ResultSet { items }, route))
    }

    async fn sql_branch(&self, text: &str, deadline: Duration) -> BranchOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, self.relational.execute(text, &[])).await
        {
            Err(_) => Err(GatewayError::deadline("relational branch")),
            Ok(Err(e)) => Err(e),
            Ok(Ok(result)) => Ok(result
                .rows
                .into_iter()
                .enumerate()
                .map(|(idx, row)| row_to_item(row, idx))
                .collect()),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        crate::metrics::record_branch_latency("sql", latency_ms);
        BranchOutcome { result, latency_ms }
    }

    async fn semantic_branch(
        &self,
        tenant: &str,
        text: &str,
        k: usize,
        threshold: f32,
        deadline: Duration,
    ) -> BranchOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            deadline,
            self.concepts
                .semantic_search(tenant, SearchQuery::Text(text.to_string()), k, threshold),
        )
        .await
        {
            Err(_) => Err(GatewayError::deadline("semantic branch")),
            Ok(Err(GatewayError::DeadlineExceeded(_))) => {
                Err(GatewayError::deadline("semantic branch"))
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(scored)) => Ok(scored
                .into_iter()
                .map(|sc| {
                    let key = sc
                        .concept
                        .source_key()
                        .map(|sk| format!("row:{}", sk))
                        .unwrap_or_else(|| format!("concept:{}", sc.concept.id));
                    let score = sc.score;
                    ResultItem {
                        source: QueryKind::Semantic,
                        key,
                        score,
                        data: serde_json::to_value(&sc.concept).unwrap_or(Value::Null),
                    }
                })
                .collect()),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        crate::metrics::record_branch_latency("semantic", latency_ms);
        BranchOutcome { result, latency_ms }
    }

    /// Evolution bias, capped by the tenant's plan phase.
    async fn effective_ratio(&self, tenant: &str) -> GatewayResult<f64> {
        let limits = self.quota.load_limits(tenant).await?;
        let global = self.evolution.concept_ratio();
        Ok(global.min(ratio_for_phase(limits.max_phase)))
    }

    fn fingerprint(&self, tenant: &str, text: &str, opts: &QueryOptions) -> String {
        let key = serde_json::json!({
            "tenant": tenant,
            "query": normalize_query(text),
            "k": opts.k,
            "threshold": opts.threshold,
            "preferred": opts.preferred,
        });
        sha256_hex(key.to_string().as_bytes())
    }

    /// Emitted for every outcome, including errors, before the reply.
    async fn write_query_log(
        &self,
        tenant: &str,
        text: &str,
        opts: &QueryOptions,
        decision: &Option<IntentDecision>,
        outcome: &GatewayResult<(ResultSet, RouteInfo)>,
        total_ms: u64,
    ) {
        let (kind, confidence) = decision
            .as_ref()
            .map(|d| (d.kind.as_str(), d.confidence))
            .unwrap_or(("unrouted", 0.0));

        let (cached, degraded, error_code, sql_ms, semantic_ms, count) = match outcome {
            Ok((set, info)) => (
                info.cached,
                info.degraded,
                None,
                info.sql_latency_ms,
                info.semantic_latency_ms,
                set.len() as i64,
            ),
            Err(e) => (false, false, Some(e.code()), None, None, 0),
        };

        let written = sqlx::query(
            r#"
            INSERT INTO query_log
                (tenant, query_text, kind, confidence, cached, degraded, error_code,
                 sql_latency_ms, semantic_latency_ms, total_latency_ms, result_count,
                 fingerprint, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant)
        .bind(text)
        .bind(kind)
        .bind(confidence as f64)
        .bind(cached)
        .bind(degraded)
        .bind(error_code)
        .bind(sql_ms.map(|v| v as i64))
        .bind(semantic_ms.map(|v| v as i64))
        .bind(total_ms as i64)
        .bind(count)
        .bind(self.fingerprint(tenant, text, opts))
        .bind(now_ms())
        .execute(&self.pool)
        .await;

        if let Err(e) = written {
            // The log write must never mask the query outcome.
            warn!("Failed to write query log entry: {}", e);
        }
    }
}

fn row_to_item(row: Row, idx: usize) -> ResultItem {
    let key = row
        .get("id")
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => format!("row:{}", s),
            other => format!("row:{}", other),
        })
        .unwrap_or_else(|| {
            let serialized = Value::Object(row.clone()).to_string();
            format!("row:{}:{}", idx, &sha256_hex(serialized.as_bytes())[..16])
        });

    ResultItem {
        source: QueryKind::Sql,
        key,
        score: 1.0,
        data: Value::Object(row),
    }
}
