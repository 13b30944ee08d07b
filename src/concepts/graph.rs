// src/concepts/graph.rs

//! Relation management and graph traversal for the concept store.
//!
//! The relation graph is not a DAG; `related_to` edges can form cycles, so
//! traversal always runs against a visited set.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;
use tracing::debug;

use super::store::ConceptStore;
use super::types::{Concept, Relation, RelationType, Subgraph};
use crate::error::{GatewayError, GatewayResult};
use crate::utils::now_ms;

/// Graph traversal never goes deeper than this.
pub const MAX_TRAVERSAL_DEPTH: usize = 3;

impl ConceptStore {
    /// Add (or restrengthen) a directed typed edge. At most one edge of a
    /// given type exists per ordered pair.
    pub async fn add_relation(
        &self,
        tenant: &str,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
        strength: f32,
    ) -> GatewayResult<Relation> {
        if !(strength > 0.0 && strength <= 1.0) {
            return Err(GatewayError::invalid_relation(format!(
                "strength must be in (0, 1], got {}",
                strength
            )));
        }
        if source_id == target_id {
            return Err(GatewayError::invalid_relation(
                "source and target must differ",
            ));
        }
        for id in [source_id, target_id] {
            if self.get(tenant, id).await.is_err() {
                return Err(GatewayError::invalid_relation(format!(
                    "endpoint {} does not exist",
                    id
                )));
            }
        }

        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO concept_relations (tenant, source_id, target_id, relation_type, strength, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, target_id, relation_type)
            DO UPDATE SET strength = excluded.strength
            "#,
        )
        .bind(tenant)
        .bind(source_id)
        .bind(target_id)
        .bind(relation_type.as_str())
        .bind(strength as f64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.recompute_strength(tenant, source_id).await?;
        self.refresh_neighbor_strengths(tenant, &[target_id.to_string()])
            .await;

        debug!(
            "Added relation {} -{}-> {} ({})",
            source_id, relation_type, target_id, strength
        );

        Ok(Relation {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relation_type,
            strength,
            created_at: now,
        })
    }

    pub async fn remove_relation(
        &self,
        tenant: &str,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
    ) -> GatewayResult<()> {
        let result = sqlx::query(
            "DELETE FROM concept_relations WHERE tenant = ? AND source_id = ? AND target_id = ? AND relation_type = ?",
        )
        .bind(tenant)
        .bind(source_id)
        .bind(target_id)
        .bind(relation_type.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::not_found(format!(
                "relation {} -{}-> {}",
                source_id, relation_type, target_id
            )));
        }

        self.refresh_neighbor_strengths(
            tenant,
            &[source_id.to_string(), target_id.to_string()],
        )
        .await;
        Ok(())
    }

    /// Breadth-first neighborhood up to `depth` (clamped to 3). Traversal is
    /// undirected over the edge set, deterministic by
    /// `(concept_id asc, relation_type asc)`, cycles suppressed by a visited
    /// set.
    pub async fn neighbors(
        &self,
        tenant: &str,
        root: &str,
        depth: usize,
    ) -> GatewayResult<Subgraph> {
        let depth = depth.min(MAX_TRAVERSAL_DEPTH);
        let root_concept = self.get(tenant, root).await?;

        let mut visited: HashSet<String> = HashSet::from([root.to_string()]);
        let mut seen_edges: HashSet<(String, String, &'static str)> = HashSet::new();
        let mut nodes: Vec<Concept> = vec![root_concept];
        let mut edges: Vec<Relation> = Vec::new();
        let mut frontier = vec![root.to_string()];

        for _ in 0..depth {
            let mut next: Vec<String> = Vec::new();

            for id in &frontier {
                let mut adjacent = self.incident_relations(id).await?;
                adjacent.sort_by(|a, b| {
                    let a_other = other_endpoint(a, id);
                    let b_other = other_endpoint(b, id);
                    a_other
                        .cmp(b_other)
                        .then(a.relation_type.as_str().cmp(b.relation_type.as_str()))
                });

                for relation in adjacent {
                    let edge_key = (
                        relation.source_id.clone(),
                        relation.target_id.clone(),
                        relation.relation_type.as_str(),
                    );
                    if seen_edges.insert(edge_key) {
                        edges.push(relation.clone());
                    }

                    let other = other_endpoint(&relation, id).to_string();
                    if visited.insert(other.clone()) {
                        match self.get(tenant, &other).await {
                            Ok(concept) => {
                                nodes.push(concept);
                                next.push(other);
                            }
                            // Dangling endpoint or cross-tenant edge; skip.
                            Err(GatewayError::NotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            next.sort();
            next.dedup();
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        Ok(Subgraph {
            root: Some(root.to_string()),
            nodes,
            edges,
        })
    }

    /// Merge the loser into the winner: every relation touching the loser is
    /// redirected to the winner, duplicate edges collapse with the higher
    /// strength, and the loser is deleted.
    pub async fn merge(
        &self,
        tenant: &str,
        loser_id: &str,
        winner_id: &str,
    ) -> GatewayResult<Concept> {
        if loser_id == winner_id {
            return Err(GatewayError::invalid_relation(
                "cannot merge a concept into itself",
            ));
        }

        let (_g1, _g2) = self.locks.acquire_pair(loser_id, winner_id).await;

        let loser = self.get(tenant, loser_id).await?;
        self.get(tenant, winner_id).await?;
        let loser_neighbors = self.neighbor_ids(loser_id).await?;

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT * FROM concept_relations WHERE source_id = ? OR target_id = ?",
        )
        .bind(loser_id)
        .bind(loser_id)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            let relation = relation_from_row(row)?;
            let new_source = if relation.source_id == loser_id {
                winner_id
            } else {
                relation.source_id.as_str()
            };
            let new_target = if relation.target_id == loser_id {
                winner_id
            } else {
                relation.target_id.as_str()
            };
            if new_source == new_target {
                // A loser<->winner edge collapses away entirely.
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO concept_relations (tenant, source_id, target_id, relation_type, strength, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(source_id, target_id, relation_type)
                DO UPDATE SET strength = MAX(strength, excluded.strength)
                "#,
            )
            .bind(tenant)
            .bind(new_source)
            .bind(new_target)
            .bind(relation.relation_type.as_str())
            .bind(relation.strength as f64)
            .bind(relation.created_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM concept_relations WHERE source_id = ? OR target_id = ?")
            .bind(loser_id)
            .bind(loser_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM concepts WHERE id = ? AND tenant = ?")
            .bind(loser_id)
            .bind(tenant)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE concepts SET usage_count = usage_count + ?, updated_at = ? WHERE id = ? AND tenant = ?")
            .bind(loser.usage_count)
            .bind(now_ms())
            .bind(winner_id)
            .bind(tenant)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.delete_vector(loser_id).await?;
        self.recompute_strength(tenant, winner_id).await?;
        self.refresh_neighbor_strengths(tenant, &loser_neighbors).await;

        debug!("Merged concept {} into {}", loser_id, winner_id);
        self.get(tenant, winner_id).await
    }

    /// The whole graph for a tenant, nodes ordered by id.
    pub async fn full_graph(&self, tenant: &str) -> GatewayResult<Subgraph> {
        let node_rows = sqlx::query("SELECT * FROM concepts WHERE tenant = ? ORDER BY id")
            .bind(tenant)
            .fetch_all(&self.pool)
            .await?;
        let nodes = node_rows
            .iter()
            .map(super::store::concept_from_row)
            .collect::<GatewayResult<Vec<_>>>()?;

        let edge_rows = sqlx::query(
            "SELECT * FROM concept_relations WHERE tenant = ? ORDER BY source_id, target_id, relation_type",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;
        let edges = edge_rows
            .iter()
            .map(relation_from_row)
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Subgraph {
            root: None,
            nodes,
            edges,
        })
    }

    pub(super) async fn incident_relations(&self, id: &str) -> GatewayResult<Vec<Relation>> {
        let rows = sqlx::query(
            "SELECT * FROM concept_relations WHERE source_id = ? OR target_id = ?",
        )
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(relation_from_row).collect()
    }
}

fn other_endpoint<'a>(relation: &'a Relation, id: &str) -> &'a str {
    if relation.source_id == id {
        &relation.target_id
    } else {
        &relation.source_id
    }
}

pub(super) fn relation_from_row(row: &SqliteRow) -> GatewayResult<Relation> {
    let type_str: String = row.get("relation_type");
    Ok(Relation {
        source_id: row.get("source_id"),
        target_id: row.get("target_id"),
        relation_type: type_str.parse()?,
        strength: row.get::<f64, _>("strength") as f32,
        created_at: row.get("created_at"),
    })
}
