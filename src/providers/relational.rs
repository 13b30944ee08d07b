// src/providers/relational.rs
// SQLite-backed relational store adapter

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as SqlxRow, SqlitePool};
use tracing::debug;

use super::{RelationalResult, RelationalStore, Row};
use crate::error::GatewayResult;

/// Relational engine adapter over a SQLite pool. The gateway treats the
/// engine as external; this adapter only forwards statements and decodes
/// rows into opaque column maps.
pub struct SqliteRelationalStore {
    pool: SqlitePool,
}

impl SqliteRelationalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn is_row_returning(sql: &str) -> bool {
        let head = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        matches!(head.as_str(), "select" | "with" | "explain" | "pragma")
    }

    /// Decode a dynamically-typed SQLite row into a JSON column map.
    fn decode_row(row: &SqliteRow) -> Row {
        let mut map = Row::new();
        for (i, column) in row.columns().iter().enumerate() {
            let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
                v.map(Value::from).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
                v.map(Value::from).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
                v.map(Value::from).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
                v.map(Value::from).unwrap_or(Value::Null)
            } else {
                // Blobs and anything else the router has no use for.
                Value::Null
            };
            map.insert(column.name().to_string(), value);
        }
        map
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

#[async_trait]
impl RelationalStore for SqliteRelationalStore {
    async fn execute(&self, sql: &str, params: &[Value]) -> GatewayResult<RelationalResult> {
        debug!("Relational execute: {}", sql);

        if Self::is_row_returning(sql) {
            let rows = bind_params(sqlx::query(sql), params)
                .fetch_all(&self.pool)
                .await?;
            Ok(RelationalResult {
                rows: rows.iter().map(Self::decode_row).collect(),
                rows_affected: 0,
            })
        } else {
            let result = bind_params(sqlx::query(sql), params)
                .execute(&self.pool)
                .await?;
            Ok(RelationalResult {
                rows: Vec::new(),
                rows_affected: result.rows_affected(),
            })
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
