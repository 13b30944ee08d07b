// src/router/merge.rs

//! Cross-engine result merging for hybrid queries.
//!
//! SQL rows carry a normalized score of 1.0; concepts keep their cosine
//! similarity. Deduplication is by stable key: rows by primary key,
//! concepts by id, with a concept's source_key collapsing it onto the row
//! it mirrors.

use crate::error::GatewayError;

use super::ResultItem;

/// Deduplicate and interleave both branches by normalized score,
/// descending. The sort is stable, so ties keep their arrival order with
/// the relational branch first.
pub fn merge_branches(sql: Vec<ResultItem>, semantic: Vec<ResultItem>) -> Vec<ResultItem> {
    let mut merged: Vec<ResultItem> = Vec::with_capacity(sql.len() + semantic.len());
    let mut seen = std::collections::HashSet::new();

    // Relational rows get priority in deduplication.
    for item in sql.into_iter().chain(semantic.into_iter()) {
        if seen.insert(item.key.clone()) {
            merged.push(item);
        }
    }

    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

/// Attach the slower failure to the first-arrived one. Only the primary's
/// classification survives; the secondary is kept as context.
pub fn combine_failures(primary: GatewayError, secondary: &GatewayError) -> GatewayError {
    let suffix = format!("also failed: {}", secondary);
    match primary {
        GatewayError::UpstreamUnavailable(msg) => {
            GatewayError::UpstreamUnavailable(format!("{} ({})", msg, suffix))
        }
        GatewayError::DeadlineExceeded(msg) => {
            GatewayError::DeadlineExceeded(format!("{} ({})", msg, suffix))
        }
        GatewayError::Internal(msg) => GatewayError::Internal(format!("{} ({})", msg, suffix)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::QueryKind;
    use serde_json::json;

    fn item(source: QueryKind, key: &str, score: f32) -> ResultItem {
        ResultItem {
            source,
            key: key.to_string(),
            score,
            data: json!({"key": key}),
        }
    }

    #[test]
    fn merge_dedupes_and_sorts_descending() {
        let sql = vec![
            item(QueryKind::Sql, "row:1", 1.0),
            item(QueryKind::Sql, "row:2", 1.0),
        ];
        let semantic = vec![
            item(QueryKind::Semantic, "concept:a", 0.92),
            // Mirrors row 1 via source_key; the row wins.
            item(QueryKind::Semantic, "row:1", 0.88),
            item(QueryKind::Semantic, "concept:b", 0.40),
        ];

        let merged = merge_branches(sql, semantic);
        let keys: Vec<&str> = merged.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["row:1", "row:2", "concept:a", "concept:b"]);

        // No key appears twice and scores are non-increasing.
        for pair in merged.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn sql_rows_keep_relative_order_on_ties() {
        let sql = vec![
            item(QueryKind::Sql, "row:first", 1.0),
            item(QueryKind::Sql, "row:second", 1.0),
        ];
        let merged = merge_branches(sql, Vec::new());
        assert_eq!(merged[0].key, "row:first");
        assert_eq!(merged[1].key, "row:second");
    }
}
