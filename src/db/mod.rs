// src/db/mod.rs
// Metadata schema bootstrap for the gateway

use crate::error::GatewayResult;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

/// Connect to the metadata database and initialize the schema.
pub async fn connect(url: &str, max_connections: u32) -> GatewayResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Initialize the database schema. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> GatewayResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS concepts (
            id TEXT PRIMARY KEY,
            tenant TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            vector TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            usage_count INTEGER NOT NULL DEFAULT 0,
            strength REAL NOT NULL DEFAULT 0.0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_concepts_tenant
        ON concepts(tenant);

        CREATE INDEX IF NOT EXISTS idx_concepts_updated_at
        ON concepts(updated_at);

        CREATE TABLE IF NOT EXISTS concept_relations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant TEXT NOT NULL,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            strength REAL NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(source_id, target_id, relation_type)
        );

        CREATE INDEX IF NOT EXISTS idx_relations_source
        ON concept_relations(source_id);

        CREATE INDEX IF NOT EXISTS idx_relations_target
        ON concept_relations(target_id);

        CREATE TABLE IF NOT EXISTS query_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant TEXT NOT NULL,
            query_text TEXT NOT NULL,
            kind TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0.0,
            cached INTEGER NOT NULL DEFAULT 0,
            degraded INTEGER NOT NULL DEFAULT 0,
            error_code TEXT,
            sql_latency_ms INTEGER,
            semantic_latency_ms INTEGER,
            total_latency_ms INTEGER NOT NULL DEFAULT 0,
            result_count INTEGER NOT NULL DEFAULT 0,
            fingerprint TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_query_log_tenant
        ON query_log(tenant, created_at DESC);

        CREATE TABLE IF NOT EXISTS tenant_limits (
            tenant TEXT PRIMARY KEY,
            concepts INTEGER NOT NULL,
            queries_per_month INTEGER NOT NULL,
            api_calls_per_month INTEGER NOT NULL,
            storage_bytes INTEGER NOT NULL,
            queries_per_minute INTEGER NOT NULL,
            api_calls_per_second INTEGER NOT NULL,
            max_phase INTEGER NOT NULL DEFAULT 4,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_counters (
            tenant TEXT NOT NULL,
            resource TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant, resource, window_start)
        );

        CREATE TABLE IF NOT EXISTS evolution_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            phase INTEGER NOT NULL,
            concept_ratio REAL NOT NULL,
            counters TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            direction TEXT NOT NULL,
            scope TEXT NOT NULL,
            last_updated_at INTEGER NOT NULL DEFAULT 0,
            last_id TEXT NOT NULL DEFAULT '',
            row_hash TEXT NOT NULL DEFAULT '',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (direction, scope)
        );

        CREATE TABLE IF NOT EXISTS sync_index (
            source_key TEXT PRIMARY KEY,
            concept_id TEXT NOT NULL,
            row_hash TEXT NOT NULL,
            synced_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_quarantine (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_key TEXT NOT NULL,
            table_name TEXT NOT NULL,
            concept_id TEXT,
            relational_row TEXT NOT NULL,
            concept_snapshot TEXT,
            reason TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS query_cache (
            cache_key TEXT PRIMARY KEY,
            response TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            last_accessed INTEGER NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .execute(pool)
    .await?;

    info!("Gateway metadata schema initialized");
    Ok(())
}
