// tests/quota_test.rs
// Quota gate: sliding windows, monthly counters, capacity checks.

mod common;

use common::*;
use chrono::{Datelike, Utc};
use serde_json::json;

use conceptgate::concepts::ConceptDraft;
use conceptgate::error::GatewayError;
use conceptgate::quota::TenantLimits;
use conceptgate::router::QueryOptions;

fn limits(tenant: &str) -> TenantLimits {
    TenantLimits::unlimited(tenant)
}

#[tokio::test]
async fn eleventh_query_in_the_minute_is_rejected() {
    let h = create_test_gateway().await;
    let mut plan = limits("t1");
    plan.queries_per_minute = 10;
    h.gateway.set_tenant_limits(&plan).await.unwrap();

    let before = Utc::now();
    for i in 0..10 {
        h.relational.push_rows(vec![row(&[("id", json!(i))])]);
        h.gateway
            .query("t1", &format!("SELECT * FROM t WHERE id = {}", i), QueryOptions::default())
            .await
            .unwrap_or_else(|e| panic!("query {} should pass: {}", i, e));
    }

    let err = h
        .gateway
        .query("t1", "SELECT * FROM t WHERE id = 11", QueryOptions::default())
        .await
        .unwrap_err();

    match err {
        GatewayError::QuotaExceeded { resource, reset_at } => {
            assert_eq!(resource, "queries_per_minute");
            assert!(reset_at > before);
            assert!(reset_at <= before + chrono::Duration::seconds(61));
        }
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }

    // Admitted calls never exceed the limit within the window.
    let usage = h.gateway.usage("t1").await.unwrap();
    assert_eq!(usage.queries_this_month, 10);
}

#[tokio::test]
async fn monthly_query_budget_is_enforced() {
    let h = create_test_gateway().await;
    let mut plan = limits("t1");
    plan.queries_per_month = 3;
    h.gateway.set_tenant_limits(&plan).await.unwrap();

    for i in 0..3 {
        h.gateway
            .query("t1", &format!("SELECT {}", i), QueryOptions::default())
            .await
            .unwrap();
    }

    let err = h
        .gateway
        .query("t1", "SELECT 99", QueryOptions::default())
        .await
        .unwrap_err();
    match err {
        GatewayError::QuotaExceeded { resource, reset_at } => {
            assert_eq!(resource, "queries_per_month");
            // The window rolls at the next calendar month boundary.
            assert!(reset_at > Utc::now());
            assert_eq!(reset_at.day0(), 0);
        }
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_tenant_is_rejected_up_front() {
    let h = create_test_gateway().await;

    let err = h
        .gateway
        .query("nobody", "SELECT 1", QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownTenant(_)));
}

#[tokio::test]
async fn concept_capacity_is_checked_before_creation() {
    let h = create_test_gateway().await;
    let mut plan = limits("t1");
    plan.concepts = 2;
    h.gateway.set_tenant_limits(&plan).await.unwrap();

    for name in ["one", "two"] {
        h.gateway
            .create_concept(
                "t1",
                ConceptDraft {
                    name: name.into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let err = h
        .gateway
        .create_concept(
            "t1",
            ConceptDraft {
                name: "three".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        GatewayError::QuotaExceeded { resource, .. } => assert_eq!(resource, "concepts"),
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }

    // The rejected create left no partial writes.
    assert_eq!(h.gateway.concepts().count("t1").await.unwrap(), 2);
    assert_eq!(h.vectors.len(), 2);
}

#[tokio::test]
async fn storage_capacity_is_checked_before_creation() {
    let h = create_test_gateway().await;
    let mut plan = limits("t1");
    plan.storage_bytes = 64;
    h.gateway.set_tenant_limits(&plan).await.unwrap();

    let err = h
        .gateway
        .create_concept(
            "t1",
            ConceptDraft {
                name: "big".into(),
                description: "x".repeat(200),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        GatewayError::QuotaExceeded { resource, .. } => assert_eq!(resource, "storage"),
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }
}

#[tokio::test]
async fn tenants_do_not_share_windows() {
    let h = create_test_gateway().await;
    let mut t1 = limits("t1");
    t1.queries_per_minute = 1;
    h.gateway.set_tenant_limits(&t1).await.unwrap();
    let mut t2 = limits("t2");
    t2.queries_per_minute = 1;
    h.gateway.set_tenant_limits(&t2).await.unwrap();

    h.gateway
        .query("t1", "SELECT 1", QueryOptions::default())
        .await
        .unwrap();
    assert!(h
        .gateway
        .query("t1", "SELECT 2", QueryOptions::default())
        .await
        .is_err());

    // A different tenant is unaffected.
    h.gateway
        .query("t2", "SELECT 1", QueryOptions::default())
        .await
        .unwrap();
}
