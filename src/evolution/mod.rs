// src/evolution/mod.rs

//! Evolution tracker: aggregates routing/quality metrics and advances the
//! system through four phases that shift the routing bias toward the
//! semantic path.
//!
//! Single writer, snapshot readers. The state is a value owned by the
//! tracker; callers only ever see copies.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::EvolutionConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::intent::QueryKind;
use crate::utils::now_ms;

/// Target share of concept-path traffic per phase.
pub fn ratio_for_phase(phase: u8) -> f64 {
    match phase {
        1 => 0.1,
        2 => 0.3,
        3 => 0.7,
        _ => 1.0,
    }
}

/// Concept-path share required to enter a phase.
fn advancement_target(next_phase: u8) -> f64 {
    match next_phase {
        2 => 0.20,
        3 => 0.50,
        _ => 0.80,
    }
}

pub const MAX_PHASE: u8 = 4;

/// Cumulative totals, persisted alongside the phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionCounters {
    pub total_queries: u64,
    pub sql_queries: u64,
    pub semantic_queries: u64,
    pub hybrid_queries: u64,
    pub merge_hits: u64,
    pub cached_queries: u64,
}

/// The process-wide evolution state. Created at first boot, never destroyed;
/// the phase only advances unless an operator forces otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionState {
    pub phase: u8,
    pub concept_ratio: f64,
    pub counters: EvolutionCounters,
    pub updated_at: i64,
}

/// One routed query, as seen by the tracker.
#[derive(Debug, Clone)]
pub struct QueryObservation {
    pub kind: QueryKind,
    pub confidence: f32,
    pub sql_latency_ms: Option<u64>,
    pub semantic_latency_ms: Option<u64>,
    pub merged: bool,
    pub cached: bool,
}

/// Aggregated view returned by `snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionMetrics {
    pub phase: u8,
    pub concept_ratio: f64,
    pub total_queries: u64,
    pub sql_ratio: f64,
    pub semantic_ratio: f64,
    pub hybrid_ratio: f64,
    pub avg_confidence: f64,
    pub p95_sql_latency_ms: u64,
    pub p95_semantic_latency_ms: u64,
    pub merge_hits: u64,
    pub window_size: usize,
    pub queries_since_advancement: u64,
}

/// Outcome of an advancement evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdvancementDecision {
    Advance { from: u8, to: u8 },
    Hold { reasons: Vec<String> },
    AtMaxPhase,
}

struct Inner {
    state: EvolutionState,
    window: VecDeque<QueryObservation>,
    queries_since_advancement: u64,
}

pub struct EvolutionTracker {
    pool: SqlitePool,
    config: EvolutionConfig,
    inner: RwLock<Inner>,
    /// Serializes advancement/persistence; observers only take the RwLock.
    writer: Mutex<()>,
}

impl EvolutionTracker {
    /// Load persisted state, creating the singleton on first boot.
    pub async fn load(pool: SqlitePool, config: EvolutionConfig) -> GatewayResult<Self> {
        let row = sqlx::query("SELECT phase, concept_ratio, counters FROM evolution_state WHERE id = 1")
            .fetch_optional(&pool)
            .await?;

        let state = match row {
            Some(row) => {
                let counters_json: String = row.get("counters");
                EvolutionState {
                    phase: row.get::<i64, _>("phase") as u8,
                    concept_ratio: row.get("concept_ratio"),
                    counters: serde_json::from_str(&counters_json).unwrap_or_default(),
                    updated_at: now_ms(),
                }
            }
            None => {
                let state = EvolutionState {
                    phase: 1,
                    concept_ratio: ratio_for_phase(1),
                    counters: EvolutionCounters::default(),
                    updated_at: now_ms(),
                };
                sqlx::query(
                    "INSERT INTO evolution_state (id, phase, concept_ratio, counters, updated_at) VALUES (1, ?, ?, ?, ?)",
                )
                .bind(state.phase as i64)
                .bind(state.concept_ratio)
                .bind(serde_json::to_string(&state.counters)?)
                .bind(state.updated_at)
                .execute(&pool)
                .await?;
                info!("Evolution state created at phase 1");
                state
            }
        };

        Ok(Self {
            pool,
            config,
            inner: RwLock::new(Inner {
                state,
                window: VecDeque::new(),
                queries_since_advancement: 0,
            }),
            writer: Mutex::new(()),
        })
    }

    /// Record a routed query. Called on the success path, after the result
    /// is computed and before the reply is returned.
    pub fn observe(&self, observation: QueryObservation) {
        let mut inner = self.inner.write();

        let counters = &mut inner.state.counters;
        counters.total_queries += 1;
        match observation.kind {
            QueryKind::Sql => counters.sql_queries += 1,
            QueryKind::Semantic => counters.semantic_queries += 1,
            QueryKind::Hybrid => counters.hybrid_queries += 1,
        }
        if observation.merged {
            counters.merge_hits += 1;
        }
        if observation.cached {
            counters.cached_queries += 1;
        }

        inner.queries_since_advancement += 1;
        if inner.window.len() >= self.config.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(observation);
    }

    /// Current routing bias, read by the intent analyzer on every decision.
    pub fn concept_ratio(&self) -> f64 {
        self.inner.read().state.concept_ratio
    }

    pub fn phase(&self) -> u8 {
        self.inner.read().state.phase
    }

    pub fn snapshot(&self) -> EvolutionMetrics {
        let inner = self.inner.read();
        let window = &inner.window;
        let total = window.len();

        let mut sql = 0usize;
        let mut semantic = 0usize;
        let mut hybrid = 0usize;
        let mut confidence_sum = 0.0f64;
        let mut sql_latencies = Vec::new();
        let mut semantic_latencies = Vec::new();

        for obs in window {
            match obs.kind {
                QueryKind::Sql => sql += 1,
                QueryKind::Semantic => semantic += 1,
                QueryKind::Hybrid => hybrid += 1,
            }
            confidence_sum += obs.confidence as f64;
            if let Some(ms) = obs.sql_latency_ms {
                sql_latencies.push(ms);
            }
            if let Some(ms) = obs.semantic_latency_ms {
                semantic_latencies.push(ms);
            }
        }

        let ratio = |n: usize| {
            if total == 0 {
                0.0
            } else {
                n as f64 / total as f64
            }
        };

        EvolutionMetrics {
            phase: inner.state.phase,
            concept_ratio: inner.state.concept_ratio,
            total_queries: inner.state.counters.total_queries,
            sql_ratio: ratio(sql),
            semantic_ratio: ratio(semantic),
            hybrid_ratio: ratio(hybrid),
            avg_confidence: if total == 0 {
                0.0
            } else {
                confidence_sum / total as f64
            },
            p95_sql_latency_ms: percentile_95(&mut sql_latencies),
            p95_semantic_latency_ms: percentile_95(&mut semantic_latencies),
            merge_hits: inner.state.counters.merge_hits,
            window_size: total,
            queries_since_advancement: inner.queries_since_advancement,
        }
    }

    /// Check the advancement preconditions without mutating anything.
    pub fn evaluate_advancement(&self) -> AdvancementDecision {
        let inner = self.inner.read();
        self.evaluate_locked(&inner)
    }

    fn evaluate_locked(&self, inner: &Inner) -> AdvancementDecision {
        let phase = inner.state.phase;
        if phase >= MAX_PHASE {
            return AdvancementDecision::AtMaxPhase;
        }
        let next = phase + 1;
        let mut reasons = Vec::new();

        let window = &inner.window;
        let total = window.len();

        if inner.queries_since_advancement < self.config.min_queries_between_phases {
            reasons.push(format!(
                "only {} queries since last advancement (need {})",
                inner.queries_since_advancement, self.config.min_queries_between_phases
            ));
        }

        let concept_queries = window
            .iter()
            .filter(|o| matches!(o.kind, QueryKind::Semantic | QueryKind::Hybrid))
            .count();
        let concept_share = if total == 0 {
            0.0
        } else {
            concept_queries as f64 / total as f64
        };
        let target = advancement_target(next);
        if concept_share < target {
            reasons.push(format!(
                "concept share {:.2} below target {:.2}",
                concept_share, target
            ));
        }

        let semantic: Vec<&QueryObservation> = window
            .iter()
            .filter(|o| matches!(o.kind, QueryKind::Semantic))
            .collect();
        let avg_confidence = if semantic.is_empty() {
            0.0
        } else {
            semantic.iter().map(|o| o.confidence as f64).sum::<f64>() / semantic.len() as f64
        };
        if avg_confidence < self.config.min_semantic_confidence as f64 {
            reasons.push(format!(
                "semantic confidence {:.2} below {:.2}",
                avg_confidence, self.config.min_semantic_confidence
            ));
        }

        let mut sql_latencies: Vec<u64> =
            window.iter().filter_map(|o| o.sql_latency_ms).collect();
        let mut semantic_latencies: Vec<u64> =
            window.iter().filter_map(|o| o.semantic_latency_ms).collect();
        let p95_sql = percentile_95(&mut sql_latencies);
        let p95_semantic = percentile_95(&mut semantic_latencies);
        let latency_ok = p95_semantic <= self.config.latency_ceiling_ms
            || (p95_sql > 0
                && (p95_semantic as f64) <= self.config.latency_multiplier * p95_sql as f64);
        if !latency_ok {
            reasons.push(format!(
                "p95 semantic latency {}ms too high (p95 sql {}ms)",
                p95_semantic, p95_sql
            ));
        }

        if reasons.is_empty() {
            AdvancementDecision::Advance { from: phase, to: next }
        } else {
            AdvancementDecision::Hold { reasons }
        }
    }

    /// Advance one phase if the preconditions hold. Returns the new state.
    pub async fn try_advance(&self) -> GatewayResult<(AdvancementDecision, EvolutionState)> {
        let _writer = self.writer.lock().await;

        let (decision, state) = {
            let mut inner = self.inner.write();
            let decision = self.evaluate_locked(&inner);
            if let AdvancementDecision::Advance { to, .. } = &decision {
                inner.state.phase = *to;
                inner.state.concept_ratio = ratio_for_phase(*to);
                inner.state.updated_at = now_ms();
                inner.queries_since_advancement = 0;
            }
            (decision, inner.state.clone())
        };

        if matches!(decision, AdvancementDecision::Advance { .. }) {
            self.persist(&state).await?;
            info!(
                "Evolution advanced to phase {} (concept ratio {})",
                state.phase, state.concept_ratio
            );
            crate::metrics::record_phase(state.phase);
        }

        Ok((decision, state))
    }

    /// Operator-triggered phase change. Without `force` the evaluator's
    /// preconditions must hold and only single-step advancement is allowed;
    /// with `force` any phase in 1..=4 is accepted, including regression.
    pub async fn trigger(
        &self,
        target_phase: Option<u8>,
        force: bool,
    ) -> GatewayResult<EvolutionState> {
        if !force {
            let (decision, state) = self.try_advance().await?;
            return match decision {
                AdvancementDecision::Advance { .. } => Ok(state),
                AdvancementDecision::AtMaxPhase => {
                    Err(GatewayError::internal("already at maximum phase"))
                }
                AdvancementDecision::Hold { reasons } => Err(GatewayError::internal(format!(
                    "advancement preconditions not met: {}",
                    reasons.join("; ")
                ))),
            };
        }

        let _writer = self.writer.lock().await;
        let target = target_phase.unwrap_or_else(|| self.phase().saturating_add(1).min(MAX_PHASE));
        if !(1..=MAX_PHASE).contains(&target) {
            return Err(GatewayError::internal(format!(
                "phase {} out of range",
                target
            )));
        }

        let state = {
            let mut inner = self.inner.write();
            if target < inner.state.phase {
                warn!(
                    "Operator-forced phase regression {} -> {}",
                    inner.state.phase, target
                );
            }
            inner.state.phase = target;
            inner.state.concept_ratio = ratio_for_phase(target);
            inner.state.updated_at = now_ms();
            inner.queries_since_advancement = 0;
            inner.state.clone()
        };

        self.persist(&state).await?;
        crate::metrics::record_phase(state.phase);
        Ok(state)
    }

    /// Write the current state and counters out. Counters are persisted on
    /// phase transitions and on explicit calls; restarts may lose the tail
    /// of the rolling window but never the phase.
    pub async fn persist_counters(&self) -> GatewayResult<()> {
        let _writer = self.writer.lock().await;
        let state = self.inner.read().state.clone();
        self.persist(&state).await
    }

    async fn persist(&self, state: &EvolutionState) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE evolution_state SET phase = ?, concept_ratio = ?, counters = ?, updated_at = ? WHERE id = 1",
        )
        .bind(state.phase as i64)
        .bind(state.concept_ratio)
        .bind(serde_json::to_string(&state.counters)?)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn percentile_95(values: &mut Vec<u64>) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let rank = ((values.len() as f64) * 0.95).ceil() as usize;
    values[rank.saturating_sub(1).min(values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p95_of_uniform_values() {
        let mut values: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile_95(&mut values), 95);
        let mut one = vec![42];
        assert_eq!(percentile_95(&mut one), 42);
        let mut none = Vec::new();
        assert_eq!(percentile_95(&mut none), 0);
    }

    #[test]
    fn phase_ratios_are_monotonic() {
        assert!(ratio_for_phase(1) < ratio_for_phase(2));
        assert!(ratio_for_phase(2) < ratio_for_phase(3));
        assert!(ratio_for_phase(3) < ratio_for_phase(4));
        assert_eq!(ratio_for_phase(4), 1.0);
    }
}
