// tests/evolution_test.rs
// Evolution tracker: advancement preconditions, phase persistence, bias.

mod common;

use common::*;

use conceptgate::config::{EvolutionConfig, IntentConfig};
use conceptgate::evolution::{
    AdvancementDecision, EvolutionTracker, QueryObservation, MAX_PHASE,
};
use conceptgate::intent::{IntentAnalyzer, QueryKind};

fn sql_observation(latency_ms: u64) -> QueryObservation {
    QueryObservation {
        kind: QueryKind::Sql,
        confidence: 1.0,
        sql_latency_ms: Some(latency_ms),
        semantic_latency_ms: None,
        merged: false,
        cached: false,
    }
}

fn semantic_observation(confidence: f32, latency_ms: u64) -> QueryObservation {
    QueryObservation {
        kind: QueryKind::Semantic,
        confidence,
        sql_latency_ms: None,
        semantic_latency_ms: Some(latency_ms),
        merged: false,
        cached: false,
    }
}

async fn tracker() -> (EvolutionTracker, sqlx::SqlitePool) {
    let pool = setup_test_pool().await;
    let tracker = EvolutionTracker::load(pool.clone(), EvolutionConfig::default())
        .await
        .unwrap();
    (tracker, pool)
}

#[tokio::test]
async fn healthy_semantic_traffic_advances_to_phase_two() {
    let (tracker, pool) = tracker().await;
    assert_eq!(tracker.phase(), 1);
    assert!((tracker.concept_ratio() - 0.1).abs() < 1e-9);

    // 210 semantic queries averaging 0.75 confidence at 300ms, the rest sql
    // at 200ms.
    for _ in 0..210 {
        tracker.observe(semantic_observation(0.75, 300));
    }
    for _ in 0..790 {
        tracker.observe(sql_observation(200));
    }

    match tracker.evaluate_advancement() {
        AdvancementDecision::Advance { from, to } => {
            assert_eq!(from, 1);
            assert_eq!(to, 2);
        }
        other => panic!("expected advancement, got {:?}", other),
    }

    let (_, state) = tracker.try_advance().await.unwrap();
    assert_eq!(state.phase, 2);
    assert!((state.concept_ratio - 0.3).abs() < 1e-9);

    // The new phase survives a restart.
    drop(tracker);
    let reloaded = EvolutionTracker::load(pool, EvolutionConfig::default())
        .await
        .unwrap();
    assert_eq!(reloaded.phase(), 2);
    assert!((reloaded.concept_ratio() - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn new_ratio_shifts_routing_toward_semantic() {
    // Two semantic hits against one sql hit: hybrid under the phase-1 bias,
    // semantic under the phase-2 bias.
    let analyzer = IntentAnalyzer::new(IntentConfig::default(), None);
    let query = "find gadgets similar to smartwatches from inventory";

    let at_phase_one = analyzer.classify_deterministic(query, 0.1);
    assert_eq!(at_phase_one.kind, QueryKind::Hybrid);

    let at_phase_two = analyzer.classify_deterministic(query, 0.3);
    assert_eq!(at_phase_two.kind, QueryKind::Semantic);
}

#[tokio::test]
async fn too_few_queries_hold_the_phase() {
    let (tracker, _pool) = tracker().await;

    for _ in 0..50 {
        tracker.observe(semantic_observation(0.9, 100));
    }

    match tracker.evaluate_advancement() {
        AdvancementDecision::Hold { reasons } => {
            assert!(reasons.iter().any(|r| r.contains("since last advancement")));
        }
        other => panic!("expected hold, got {:?}", other),
    }
}

#[tokio::test]
async fn weak_semantic_confidence_holds_the_phase() {
    let (tracker, _pool) = tracker().await;

    for _ in 0..500 {
        tracker.observe(semantic_observation(0.4, 100));
    }
    for _ in 0..500 {
        tracker.observe(sql_observation(100));
    }

    match tracker.evaluate_advancement() {
        AdvancementDecision::Hold { reasons } => {
            assert!(reasons.iter().any(|r| r.contains("confidence")));
        }
        other => panic!("expected hold, got {:?}", other),
    }

    // And try_advance does not move the phase.
    let (_, state) = tracker.try_advance().await.unwrap();
    assert_eq!(state.phase, 1);
}

#[tokio::test]
async fn slow_semantic_layer_holds_the_phase() {
    let (tracker, _pool) = tracker().await;

    for _ in 0..300 {
        // Confident but slow: over the absolute ceiling and over 2x sql p95.
        tracker.observe(semantic_observation(0.9, 900));
    }
    for _ in 0..700 {
        tracker.observe(sql_observation(100));
    }

    match tracker.evaluate_advancement() {
        AdvancementDecision::Hold { reasons } => {
            assert!(reasons.iter().any(|r| r.contains("latency")));
        }
        other => panic!("expected hold, got {:?}", other),
    }
}

#[tokio::test]
async fn regression_requires_explicit_force() {
    let (tracker, _pool) = tracker().await;

    let state = tracker.trigger(Some(3), true).await.unwrap();
    assert_eq!(state.phase, 3);
    assert!((state.concept_ratio - 0.7).abs() < 1e-9);

    // Unforced trigger evaluates preconditions and fails on an empty window.
    assert!(tracker.trigger(Some(4), false).await.is_err());
    assert_eq!(tracker.phase(), 3);

    // Forced regression is allowed for operators.
    let state = tracker.trigger(Some(1), true).await.unwrap();
    assert_eq!(state.phase, 1);
    assert!((state.concept_ratio - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn snapshot_reports_window_statistics() {
    let (tracker, _pool) = tracker().await;

    for _ in 0..8 {
        tracker.observe(sql_observation(100));
    }
    tracker.observe(semantic_observation(0.8, 50));
    tracker.observe(QueryObservation {
        kind: QueryKind::Hybrid,
        confidence: 0.6,
        sql_latency_ms: Some(30),
        semantic_latency_ms: Some(40),
        merged: true,
        cached: false,
    });

    let metrics = tracker.snapshot();
    assert_eq!(metrics.total_queries, 10);
    assert_eq!(metrics.window_size, 10);
    assert!((metrics.sql_ratio - 0.8).abs() < 1e-9);
    assert!((metrics.semantic_ratio - 0.1).abs() < 1e-9);
    assert!((metrics.hybrid_ratio - 0.1).abs() < 1e-9);
    assert_eq!(metrics.merge_hits, 1);
    assert_eq!(metrics.phase, 1);
    assert!(metrics.p95_sql_latency_ms >= 30);
}

#[tokio::test]
async fn rolling_window_discards_old_observations() {
    let pool = setup_test_pool().await;
    let mut config = EvolutionConfig::default();
    config.window_size = 100;
    let tracker = EvolutionTracker::load(pool, config).await.unwrap();

    for _ in 0..150 {
        tracker.observe(sql_observation(10));
    }
    let metrics = tracker.snapshot();
    assert_eq!(metrics.window_size, 100);
    // Cumulative counters keep the full history.
    assert_eq!(metrics.total_queries, 150);
}

#[tokio::test]
async fn phase_four_is_terminal() {
    let (tracker, _pool) = tracker().await;
    tracker.trigger(Some(MAX_PHASE), true).await.unwrap();
    assert!(matches!(
        tracker.evaluate_advancement(),
        AdvancementDecision::AtMaxPhase
    ));
}
