// src/providers/cache.rs

//! Query result caching.
//!
//! Results are memoized by fingerprint with a TTL. The cache is never
//! authoritative: a miss or a backend error simply falls through to the
//! engines.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use super::QueryCache;
use crate::error::GatewayResult;
use crate::utils::now_ms;

/// SQLite-backed query cache.
pub struct SqliteQueryCache {
    db: SqlitePool,
    enabled: bool,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: i64,
    pub total_hits: i64,
    pub avg_access_count: f64,
}

impl SqliteQueryCache {
    pub fn new(db: SqlitePool, enabled: bool) -> Self {
        Self { db, enabled }
    }

    /// Remove expired entries. Returns the number evicted.
    pub async fn cleanup_expired(&self) -> GatewayResult<u64> {
        let result = sqlx::query("DELETE FROM query_cache WHERE expires_at < ?")
            .bind(now_ms())
            .execute(&self.db)
            .await?;

        let evicted = result.rows_affected();
        if evicted > 0 {
            debug!("Evicted {} expired cache entries", evicted);
        }
        Ok(evicted)
    }

    pub async fn stats(&self) -> GatewayResult<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total_entries,
                COALESCE(SUM(access_count), 0) as total_hits,
                COALESCE(AVG(access_count), 0.0) as avg_access
            FROM query_cache
            "#,
        )
        .fetch_one(&self.db)
        .await?;

        Ok(CacheStats {
            total_entries: row.get("total_entries"),
            total_hits: row.get("total_hits"),
            avg_access_count: row.get("avg_access"),
        })
    }
}

#[async_trait]
impl QueryCache for SqliteQueryCache {
    async fn get(&self, key: &str) -> GatewayResult<Option<Value>> {
        if !self.enabled {
            return Ok(None);
        }

        let now = now_ms();
        let row = sqlx::query("SELECT response, expires_at FROM query_cache WHERE cache_key = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: i64 = row.get("expires_at");
        if expires_at < now {
            // Stale entry; drop it rather than serving it.
            sqlx::query("DELETE FROM query_cache WHERE cache_key = ?")
                .bind(key)
                .execute(&self.db)
                .await?;
            return Ok(None);
        }

        let response: String = row.get("response");
        let value: Value = serde_json::from_str(&response)?;

        // Access tracking is advisory; losing it is harmless.
        if let Err(e) = sqlx::query(
            "UPDATE query_cache SET last_accessed = ?, access_count = access_count + 1 WHERE cache_key = ?",
        )
        .bind(now)
        .bind(key)
        .execute(&self.db)
        .await
        {
            warn!("Failed to record cache access: {}", e);
        }

        debug!("Cache hit for {}", key);
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: &Value, ttl_seconds: i64) -> GatewayResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let now = now_ms();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO query_cache
                (cache_key, response, created_at, expires_at, last_accessed, access_count)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(now)
        .bind(now + ttl_seconds * 1000)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
