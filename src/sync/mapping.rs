// src/sync/mapping.rs
// Per-table mapping rules for the bidirectional synchronizer

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::Row;

/// How a conflict is resolved when both sides changed since the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newer `updated_at` wins. The default.
    LastWriterWins,
    PreferRelational,
    PreferConcept,
    /// Stage the conflict in the quarantine list; apply nothing.
    Manual,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::LastWriterWins
    }
}

/// Declares how rows of one relational table map onto concepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRule {
    pub tenant: String,
    pub table: String,
    pub primary_key: String,
    pub name_column: String,
    pub description_column: Option<String>,
    /// Columns copied into concept metadata on the forward pass.
    #[serde(default)]
    pub metadata_columns: Vec<String>,
    /// Whitelist of columns the backward pass may write. Backward writes
    /// never touch anything else.
    #[serde(default)]
    pub writeback_columns: Vec<String>,
    /// Column holding the row's last-modified time (unix milliseconds).
    #[serde(default = "default_updated_at_column")]
    pub updated_at_column: String,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Whether the backward pass may create rows that do not exist yet.
    #[serde(default)]
    pub create_rows: bool,
}

fn default_updated_at_column() -> String {
    "updated_at".to_string()
}

impl MappingRule {
    /// Deterministic key tying a concept back to its relational row.
    pub fn source_key(&self, pk: &str) -> String {
        format!("{}:{}", self.table, pk)
    }

    pub fn row_pk(&self, row: &Row) -> Option<String> {
        row.get(&self.primary_key).map(value_to_key)
    }

    pub fn row_updated_at(&self, row: &Row) -> i64 {
        row.get(&self.updated_at_column)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    pub fn row_name(&self, row: &Row) -> String {
        row.get(&self.name_column)
            .map(value_to_display)
            .unwrap_or_default()
    }

    pub fn row_description(&self, row: &Row) -> String {
        self.description_column
            .as_ref()
            .and_then(|col| row.get(col))
            .map(value_to_display)
            .unwrap_or_default()
    }
}

fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
