// tests/router_test.rs
// Query router scenarios: routing, hybrid merging, degradation, caching.

mod common;

use common::*;
use serde_json::json;
use sqlx::Row as SqlxRow;
use std::time::Duration;

use conceptgate::concepts::ConceptDraft;
use conceptgate::error::GatewayError;
use conceptgate::intent::QueryKind;
use conceptgate::router::QueryOptions;

async fn query_log_count(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query("SELECT COUNT(*) as n FROM query_log")
        .fetch_one(pool)
        .await
        .unwrap()
        .get("n")
}

#[tokio::test]
async fn sql_statement_routes_to_relational_only() {
    let h = create_test_gateway().await;
    h.relational.push_rows(vec![
        row(&[("id", json!(1)), ("name", json!("cheap mouse"))]),
        row(&[("id", json!(2)), ("name", json!("usb hub"))]),
    ]);

    let (results, route) = h
        .gateway
        .query(
            "t1",
            "SELECT name FROM products WHERE price < 100",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(route.kind, QueryKind::Sql);
    assert_eq!(route.confidence, 1.0);
    assert!(!route.degraded);
    assert_eq!(results.len(), 2);
    assert_eq!(h.relational.call_count(), 1);

    // The concept side received zero calls.
    assert_eq!(
        h.vectors
            .search_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert_eq!(
        h.embeddings.calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn semantic_query_routes_to_concept_store_only() {
    let h = create_test_gateway().await;
    let query_text = "find products similar to noise-cancelling headphones";

    // The stored concept sits on a basis axis; the query vector is built to
    // have cosine similarity 0.88 with it.
    h.embeddings.pin("AirPods Pro", basis(0));
    h.embeddings.pin(query_text, vector_with_similarity(0, 0.88));

    h.gateway
        .create_concept(
            "t1",
            ConceptDraft {
                name: "AirPods Pro".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let relational_calls_before = h.relational.call_count();

    let (results, route) = h
        .gateway
        .query("t1", query_text, QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(route.kind, QueryKind::Semantic);
    assert!(route.confidence >= 0.7);
    assert_eq!(results.len(), 1);
    assert!((results.items[0].score - 0.88).abs() < 1e-3);
    assert_eq!(results.items[0].data["name"], json!("AirPods Pro"));

    // The relational engine received zero calls.
    assert_eq!(h.relational.call_count(), relational_calls_before);
}

#[tokio::test]
async fn hybrid_query_merges_both_branches() {
    let h = create_test_gateway().await;
    let query_text =
        "show me laptops from inventory where price > 1000 similar to developer picks";

    h.embeddings.pin("Developer Laptop", basis(1));
    h.embeddings.pin(query_text, vector_with_similarity(1, 0.9));
    h.gateway
        .create_concept(
            "t1",
            ConceptDraft {
                name: "Developer Laptop".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.relational.push_rows(vec![
        row(&[("id", json!(10)), ("name", json!("ThinkPad"))]),
        row(&[("id", json!(11)), ("name", json!("MacBook"))]),
    ]);

    let (results, route) = h
        .gateway
        .query("t1", query_text, QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(route.kind, QueryKind::Hybrid);
    assert!(!route.degraded);
    assert!(route.sql_latency_ms.is_some());
    assert!(route.semantic_latency_ms.is_some());

    // Both branches contributed; rows (score 1.0) sort ahead of the concept.
    assert_eq!(results.len(), 3);
    assert_eq!(results.items[0].score, 1.0);
    assert_eq!(results.items[1].score, 1.0);
    assert!(results.items[2].score < 1.0);

    // No key appears twice.
    let mut keys: Vec<&str> = results.items.iter().map(|i| i.key.as_str()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 3);
}

#[tokio::test]
async fn hybrid_degrades_when_semantic_branch_misses_deadline() {
    let mut config = test_config();
    config.router.execute_timeout_ms = 100;
    let h = create_test_gateway_with(config, None, Vec::new()).await;
    let query_text =
        "show me laptops from inventory where price > 1000 similar to developer picks";

    h.vectors.set_search_delay(Duration::from_millis(400));
    h.relational.push_rows(vec![
        row(&[("id", json!(1)), ("name", json!("a"))]),
        row(&[("id", json!(2)), ("name", json!("b"))]),
        row(&[("id", json!(3)), ("name", json!("c"))]),
    ]);

    let (results, route) = h
        .gateway
        .query("t1", query_text, QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(route.kind, QueryKind::Hybrid);
    assert!(route.degraded);
    assert_eq!(results.len(), 3);
    let partial = route.partial_error.expect("partial error recorded");
    assert!(partial.contains("deadline exceeded"), "got: {}", partial);
    assert!(partial.contains("semantic"), "got: {}", partial);
}

#[tokio::test]
async fn hybrid_fails_with_combined_error_when_both_branches_fail() {
    let mut config = test_config();
    config.router.execute_timeout_ms = 100;
    let h = create_test_gateway_with(config, None, Vec::new()).await;

    h.relational.set_failing(true);
    h.vectors.set_search_delay(Duration::from_millis(400));

    let err = h
        .gateway
        .query(
            "t1",
            "show me laptops from inventory where price > 1000 similar to developer picks",
            QueryOptions::default(),
        )
        .await
        .unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains("also failed"), "got: {}", msg);
}

#[tokio::test]
async fn every_execute_writes_exactly_one_query_log_entry() {
    let h = create_test_gateway().await;

    // Success.
    h.gateway
        .query("t1", "SELECT 1", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(query_log_count(&h.pool).await, 1);

    // Input error.
    let err = h
        .gateway
        .query("t1", "   ", QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::EmptyQuery));
    assert_eq!(query_log_count(&h.pool).await, 2);

    // Unknown tenant.
    let err = h
        .gateway
        .query("ghost", "SELECT 1", QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownTenant(_)));
    assert_eq!(query_log_count(&h.pool).await, 3);
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let h = create_test_gateway().await;
    h.relational
        .push_rows(vec![row(&[("id", json!(1)), ("name", json!("only"))])]);

    let (first, route1) = h
        .gateway
        .query("t1", "SELECT * FROM products", QueryOptions::default())
        .await
        .unwrap();
    assert!(!route1.cached);
    assert_eq!(first.len(), 1);
    assert_eq!(h.relational.call_count(), 1);

    let (second, route2) = h
        .gateway
        .query("t1", "SELECT * FROM products", QueryOptions::default())
        .await
        .unwrap();
    assert!(route2.cached);
    assert_eq!(second.len(), 1);
    // The engine was not contacted again.
    assert_eq!(h.relational.call_count(), 1);

    // Both calls were logged.
    assert_eq!(query_log_count(&h.pool).await, 2);
}

#[tokio::test]
async fn bypass_cache_skips_memoization() {
    let h = create_test_gateway().await;
    h.relational.push_rows(vec![row(&[("id", json!(1))])]);
    h.relational.push_rows(vec![row(&[("id", json!(1))])]);

    let opts = QueryOptions {
        bypass_cache: true,
        ..Default::default()
    };
    h.gateway
        .query("t1", "SELECT * FROM t", opts.clone())
        .await
        .unwrap();
    h.gateway.query("t1", "SELECT * FROM t", opts).await.unwrap();
    assert_eq!(h.relational.call_count(), 2);
}

#[tokio::test]
async fn explain_classifies_without_executing() {
    let h = create_test_gateway().await;

    let route = h
        .gateway
        .explain_query("t1", "SELECT * FROM orders")
        .await
        .unwrap();
    assert_eq!(route.kind, QueryKind::Sql);
    assert_eq!(route.confidence, 1.0);
    assert_eq!(h.relational.call_count(), 0);
    assert_eq!(
        h.vectors
            .search_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn preferred_layer_hint_overrides_classification() {
    let h = create_test_gateway().await;
    h.relational.push_rows(vec![row(&[("id", json!(1))])]);

    let opts = QueryOptions {
        preferred: Some(QueryKind::Sql),
        ..Default::default()
    };
    let (_, route) = h
        .gateway
        .query("t1", "find things similar to other things", opts)
        .await
        .unwrap();
    assert_eq!(route.kind, QueryKind::Sql);
    assert_eq!(route.confidence, 1.0);
}
