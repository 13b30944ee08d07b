// src/sync/mod.rs

//! Bidirectional synchronizer between the relational layer and the concept
//! layer.
//!
//! Two unidirectional pipelines run under one lifecycle: forward extracts
//! concepts from changed relational rows; backward writes concept deltas to
//! whitelisted columns. Checkpoints advance monotonically and survive
//! restarts; re-seeing an applied `(source_key, row_hash)` is a no-op.

pub mod mapping;

pub use mapping::{ConflictPolicy, MappingRule};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row as SqlxRow, SqlitePool};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::concepts::{
    Concept, ConceptDraft, ConceptPatch, ConceptStore, META_MAPPING_RULE, META_SOURCE_KEY,
};
use crate::config::SyncConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{RelationalStore, Row};
use crate::utils::{now_ms, sha256_hex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Forward,
    Backward,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

/// Persisted resume point for one pipeline scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub direction: String,
    pub scope: String,
    pub last_updated_at: i64,
    pub last_id: String,
    pub row_hash: String,
}

/// Result of one synchronizer run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub quarantined: usize,
}

/// Operator-facing snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub forward_checkpoints: Vec<Checkpoint>,
    pub backward_checkpoint: Option<Checkpoint>,
    /// Concepts waiting for the backward pass.
    pub pending: i64,
    pub quarantine_count: i64,
    pub batch_size: usize,
    pub running: bool,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    concept_id: String,
    row_hash: String,
    synced_at: i64,
}

struct Backpressure {
    batch_size: usize,
    clean_streak: u32,
}

pub struct Synchronizer {
    pool: SqlitePool,
    relational: Arc<dyn RelationalStore>,
    concepts: Arc<ConceptStore>,
    rules: Vec<MappingRule>,
    config: SyncConfig,
    backpressure: Mutex<Backpressure>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Synchronizer {
    pub fn new(
        pool: SqlitePool,
        relational: Arc<dyn RelationalStore>,
        concepts: Arc<ConceptStore>,
        rules: Vec<MappingRule>,
        config: SyncConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let batch_size = config.batch_cap;
        Self {
            pool,
            relational,
            concepts,
            rules,
            config,
            backpressure: Mutex::new(Backpressure {
                batch_size,
                clean_streak: 0,
            }),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Spawn the periodic background task. The synchronizer owns its own
    /// task and never holds a concept store write lock across an external
    /// call.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sync = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(sync.config.interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                "Synchronizer started (interval {}s, {} mapping rules)",
                sync.config.interval_secs,
                sync.rules.len()
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = sync.run_once(SyncDirection::Forward).await {
                            warn!("Forward sync run failed: {}", e);
                        }
                        if let Err(e) = sync.run_once(SyncDirection::Backward).await {
                            warn!("Backward sync run failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Synchronizer shutting down");
                        break;
                    }
                }
            }
            sync.running.store(false, Ordering::SeqCst);
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run one pipeline to completion (all pending batches).
    pub async fn run_once(&self, direction: SyncDirection) -> GatewayResult<SyncReport> {
        match direction {
            SyncDirection::Forward => self.run_forward().await,
            SyncDirection::Backward => self.run_backward().await,
        }
    }

    pub async fn status(&self) -> GatewayResult<SyncStatus> {
        let mut forward_checkpoints = Vec::new();
        for rule in &self.rules {
            if let Some(cp) = self.load_checkpoint("forward", &rule.table).await? {
                forward_checkpoints.push(cp);
            }
        }
        let backward_checkpoint = self.load_checkpoint("backward", "concepts").await?;

        let backward_cursor = backward_checkpoint
            .as_ref()
            .map(|cp| cp.last_updated_at)
            .unwrap_or(0);
        let pending_row =
            sqlx::query("SELECT COUNT(*) as n FROM concepts WHERE updated_at > ?")
                .bind(backward_cursor)
                .fetch_one(&self.pool)
                .await?;
        let quarantine_row =
            sqlx::query("SELECT COUNT(*) as n FROM sync_quarantine WHERE resolved = 0")
                .fetch_one(&self.pool)
                .await?;

        Ok(SyncStatus {
            forward_checkpoints,
            backward_checkpoint,
            pending: pending_row.get("n"),
            quarantine_count: quarantine_row.get("n"),
            batch_size: self.backpressure.lock().batch_size,
            running: self.running.load(Ordering::SeqCst),
        })
    }

    // =====================================
    // Forward: relational -> concept
    // =====================================

    async fn run_forward(&self) -> GatewayResult<SyncReport> {
        let mut report = SyncReport::default();
        for rule in &self.rules {
            loop {
                let batch = self.forward_batch(rule).await?;
                report.scanned += batch.scanned;
                report.applied += batch.applied;
                report.skipped += batch.skipped;
                report.failed += batch.failed;
                report.quarantined += batch.quarantined;
                self.apply_backpressure(&batch);
                crate::metrics::record_sync_batch("forward", batch.applied, batch.failed);

                let full_batch = batch.scanned >= self.backpressure.lock().batch_size;
                if !full_batch || batch.failed > 0 {
                    break;
                }
            }
        }
        debug!(
            "Forward sync: {} applied, {} skipped, {} failed, {} quarantined",
            report.applied, report.skipped, report.failed, report.quarantined
        );
        Ok(report)
    }

    async fn forward_batch(&self, rule: &MappingRule) -> GatewayResult<SyncReport> {
        let mut report = SyncReport::default();
        let batch_size = self.backpressure.lock().batch_size;
        let checkpoint = self
            .load_checkpoint("forward", &rule.table)
            .await?
            .unwrap_or_default();

        // The pk cursor is compared as text so integer and string keys
        // behave the same.
        let sql = format!(
            "SELECT * FROM {table} WHERE {up} > ? OR ({up} = ? AND CAST({pk} AS TEXT) > ?) ORDER BY {up} ASC, CAST({pk} AS TEXT) ASC LIMIT {limit}",
            table = rule.table,
            up = rule.updated_at_column,
            pk = rule.primary_key,
            limit = batch_size,
        );
        let params = [
            Value::from(checkpoint.last_updated_at),
            Value::from(checkpoint.last_updated_at),
            Value::from(checkpoint.last_id.clone()),
        ];

        let rows = tokio::time::timeout(
            Duration::from_millis(self.config.batch_timeout_ms),
            self.relational.execute(&sql, &params),
        )
        .await
        .map_err(|_| GatewayError::deadline("sync batch read"))??
        .rows;

        report.scanned = rows.len();
        let mut committed: Option<Checkpoint> = None;
        let mut failed_yet = false;

        for row in rows {
            let Some(pk) = rule.row_pk(&row) else {
                warn!("Row in {} missing primary key {}", rule.table, rule.primary_key);
                report.failed += 1;
                failed_yet = true;
                continue;
            };
            let source_key = rule.source_key(&pk);
            let row_hash = canonical_row_hash(&row);
            let row_updated_at = rule.row_updated_at(&row);

            let advance = |committed: &mut Option<Checkpoint>| {
                *committed = Some(Checkpoint {
                    direction: "forward".into(),
                    scope: rule.table.clone(),
                    last_updated_at: row_updated_at,
                    last_id: pk.clone(),
                    row_hash: row_hash.clone(),
                });
            };

            let index = self.load_index(&source_key).await?;

            // Idempotence: an already-applied (source_key, row_hash) is a no-op.
            if let Some(entry) = &index {
                if entry.row_hash == row_hash {
                    report.skipped += 1;
                    if !failed_yet {
                        advance(&mut committed);
                    }
                    continue;
                }
            }

            match self.apply_forward(rule, &row, &source_key, &row_hash, index).await {
                Ok(ForwardOutcome::Applied) => {
                    report.applied += 1;
                    if !failed_yet {
                        advance(&mut committed);
                    }
                }
                Ok(ForwardOutcome::Skipped) => {
                    report.skipped += 1;
                    if !failed_yet {
                        advance(&mut committed);
                    }
                }
                Ok(ForwardOutcome::Quarantined) => {
                    report.quarantined += 1;
                    if !failed_yet {
                        advance(&mut committed);
                    }
                }
                Err(e) => {
                    warn!("Forward sync failed for {}: {}", source_key, e);
                    report.failed += 1;
                    failed_yet = true;
                }
            }
        }

        // The checkpoint only ever covers the contiguous committed prefix;
        // rows past the first failure are re-seen on the next run and the
        // sync index makes re-application a no-op.
        if let Some(cp) = committed {
            self.save_checkpoint(&cp).await?;
        }

        Ok(report)
    }

    async fn apply_forward(
        &self,
        rule: &MappingRule,
        row: &Row,
        source_key: &str,
        row_hash: &str,
        index: Option<IndexEntry>,
    ) -> GatewayResult<ForwardOutcome> {
        let name = rule.row_name(row);
        if name.trim().is_empty() {
            return Err(GatewayError::internal(format!(
                "row {} has no usable name",
                source_key
            )));
        }
        let description = rule.row_description(row);

        let existing = match &index {
            Some(entry) => match self.concepts.get(&rule.tenant, &entry.concept_id).await {
                Ok(concept) => Some(concept),
                // The concept was deleted out from under the index; recreate.
                Err(GatewayError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        // Conflict: both sides changed since the last sync.
        if let (Some(entry), Some(concept)) = (&index, &existing) {
            if concept.updated_at > entry.synced_at {
                match rule.conflict_policy {
                    ConflictPolicy::LastWriterWins => {
                        if rule.row_updated_at(row) < concept.updated_at {
                            // Concept is newer; mark the row content as seen
                            // but keep the old synced_at so the backward pass
                            // still aligns the row.
                            self.save_index_at(source_key, &concept.id, row_hash, entry.synced_at)
                                .await?;
                            return Ok(ForwardOutcome::Skipped);
                        }
                    }
                    ConflictPolicy::PreferRelational => {}
                    ConflictPolicy::PreferConcept => {
                        self.save_index_at(source_key, &concept.id, row_hash, entry.synced_at)
                            .await?;
                        return Ok(ForwardOutcome::Skipped);
                    }
                    ConflictPolicy::Manual => {
                        self.quarantine(rule, source_key, Some(concept), row, "both sides changed")
                            .await?;
                        return Ok(ForwardOutcome::Quarantined);
                    }
                }
            }
        }

        let mut metadata = existing
            .as_ref()
            .map(|c| c.metadata.clone())
            .unwrap_or_default();
        metadata.insert(META_SOURCE_KEY.to_string(), Value::from(source_key));
        metadata.insert(META_MAPPING_RULE.to_string(), Value::from(rule.table.clone()));
        for column in &rule.metadata_columns {
            if let Some(value) = row.get(column) {
                metadata.insert(column.clone(), value.clone());
            }
        }

        let concept_id = match existing {
            Some(concept) => {
                self.concepts
                    .update(
                        &rule.tenant,
                        &concept.id,
                        ConceptPatch {
                            name: Some(name),
                            description: Some(description),
                            metadata: Some(metadata),
                        },
                    )
                    .await?;
                concept.id
            }
            None => {
                let created = self
                    .concepts
                    .create(
                        &rule.tenant,
                        ConceptDraft {
                            id: None,
                            name,
                            description,
                            metadata,
                            vector: None,
                        },
                    )
                    .await?;
                created.id
            }
        };

        self.save_index(source_key, &concept_id, row_hash).await?;
        Ok(ForwardOutcome::Applied)
    }

    // =====================================
    // Backward: concept -> relational
    // =====================================

    async fn run_backward(&self) -> GatewayResult<SyncReport> {
        let mut report = SyncReport::default();
        loop {
            let batch = self.backward_batch().await?;
            report.scanned += batch.scanned;
            report.applied += batch.applied;
            report.skipped += batch.skipped;
            report.failed += batch.failed;
            report.quarantined += batch.quarantined;
            self.apply_backpressure(&batch);
            crate::metrics::record_sync_batch("backward", batch.applied, batch.failed);

            let full_batch = batch.scanned >= self.backpressure.lock().batch_size;
            if !full_batch || batch.failed > 0 {
                break;
            }
        }
        debug!(
            "Backward sync: {} applied, {} skipped, {} failed",
            report.applied, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn backward_batch(&self) -> GatewayResult<SyncReport> {
        let mut report = SyncReport::default();
        let batch_size = self.backpressure.lock().batch_size;
        let checkpoint = self
            .load_checkpoint("backward", "concepts")
            .await?
            .unwrap_or_default();

        let rows = sqlx::query(
            "SELECT * FROM concepts WHERE updated_at > ? OR (updated_at = ? AND id > ?) ORDER BY updated_at ASC, id ASC LIMIT ?",
        )
        .bind(checkpoint.last_updated_at)
        .bind(checkpoint.last_updated_at)
        .bind(&checkpoint.last_id)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        report.scanned = rows.len();
        let mut committed: Option<Checkpoint> = None;
        let mut failed_yet = false;

        for row in &rows {
            let concept = crate::concepts::store::concept_from_row(row)?;
            let outcome = self.apply_backward(&concept).await;

            match outcome {
                Ok(applied) => {
                    match applied {
                        BackwardOutcome::Applied => report.applied += 1,
                        BackwardOutcome::Skipped => report.skipped += 1,
                        BackwardOutcome::Quarantined => report.quarantined += 1,
                    }
                    if !failed_yet {
                        committed = Some(Checkpoint {
                            direction: "backward".into(),
                            scope: "concepts".into(),
                            last_updated_at: concept.updated_at,
                            last_id: concept.id.clone(),
                            row_hash: String::new(),
                        });
                    }
                }
                Err(e) => {
                    warn!("Backward sync failed for concept {}: {}", concept.id, e);
                    report.failed += 1;
                    failed_yet = true;
                }
            }
        }

        if let Some(cp) = committed {
            self.save_checkpoint(&cp).await?;
        }

        Ok(report)
    }

    async fn apply_backward(&self, concept: &Concept) -> GatewayResult<BackwardOutcome> {
        // Only concepts carrying a source_key flow backward.
        let Some(source_key) = concept.source_key().map(str::to_string) else {
            return Ok(BackwardOutcome::Skipped);
        };
        let Some((table, pk)) = source_key.split_once(':') else {
            return Ok(BackwardOutcome::Skipped);
        };
        let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.table == table && r.tenant == concept.tenant)
        else {
            return Ok(BackwardOutcome::Skipped);
        };
        if rule.writeback_columns.is_empty() {
            return Ok(BackwardOutcome::Skipped);
        }

        // A change that came in through the forward pass is already in sync.
        let index = self.load_index(&source_key).await?;
        if let Some(entry) = &index {
            if entry.synced_at >= concept.updated_at {
                return Ok(BackwardOutcome::Skipped);
            }
        }

        let select = format!(
            "SELECT * FROM {} WHERE {} = ? LIMIT 1",
            rule.table, rule.primary_key
        );
        let existing = self
            .relational
            .execute(&select, &[Value::from(pk)])
            .await?
            .rows
            .into_iter()
            .next();

        let Some(current_row) = existing else {
            if !rule.create_rows {
                return Ok(BackwardOutcome::Skipped);
            }
            self.insert_row(rule, pk, concept).await?;
            self.save_index(&source_key, &concept.id, "").await?;
            return Ok(BackwardOutcome::Applied);
        };

        // Conflict: the row also changed since the last sync.
        let row_hash = canonical_row_hash(&current_row);
        let row_changed = index
            .as_ref()
            .map(|entry| entry.row_hash != row_hash)
            .unwrap_or(false);
        if row_changed {
            match rule.conflict_policy {
                ConflictPolicy::LastWriterWins => {
                    if rule.row_updated_at(&current_row) > concept.updated_at {
                        return Ok(BackwardOutcome::Skipped);
                    }
                }
                ConflictPolicy::PreferRelational => return Ok(BackwardOutcome::Skipped),
                ConflictPolicy::PreferConcept => {}
                ConflictPolicy::Manual => {
                    self.quarantine(rule, &source_key, Some(concept), &current_row, "both sides changed")
                        .await?;
                    return Ok(BackwardOutcome::Quarantined);
                }
            }
        }

        self.update_row(rule, pk, concept).await?;

        // Re-read to record the row state this write produced.
        let after = self
            .relational
            .execute(&select, &[Value::from(pk)])
            .await?
            .rows
            .into_iter()
            .next();
        let new_hash = after.map(|r| canonical_row_hash(&r)).unwrap_or_default();
        self.save_index(&source_key, &concept.id, &new_hash).await?;

        Ok(BackwardOutcome::Applied)
    }

    /// Write only declared columns; the whitelist is the contract.
    fn writeback_values(&self, rule: &MappingRule, concept: &Concept) -> Vec<(String, Value)> {
        rule.writeback_columns
            .iter()
            .filter_map(|column| {
                if *column == rule.name_column {
                    Some((column.clone(), Value::from(concept.name.clone())))
                } else if Some(column) == rule.description_column.as_ref() {
                    Some((column.clone(), Value::from(concept.description.clone())))
                } else if rule.metadata_columns.contains(column) {
                    concept
                        .metadata
                        .get(column)
                        .map(|v| (column.clone(), v.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    async fn update_row(
        &self,
        rule: &MappingRule,
        pk: &str,
        concept: &Concept,
    ) -> GatewayResult<()> {
        let values = self.writeback_values(rule, concept);
        if values.is_empty() {
            return Ok(());
        }

        let assignments = values
            .iter()
            .map(|(col, _)| format!("{} = ?", col))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {}, {} = ? WHERE {} = ?",
            rule.table, assignments, rule.updated_at_column, rule.primary_key
        );

        let mut params: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
        params.push(Value::from(self.relational.now().timestamp_millis()));
        params.push(Value::from(pk));

        self.relational.execute(&sql, &params).await?;
        Ok(())
    }

    async fn insert_row(
        &self,
        rule: &MappingRule,
        pk: &str,
        concept: &Concept,
    ) -> GatewayResult<()> {
        let mut values = self.writeback_values(rule, concept);
        values.push((
            rule.updated_at_column.clone(),
            Value::from(self.relational.now().timestamp_millis()),
        ));

        let columns = std::iter::once(rule.primary_key.as_str())
            .chain(values.iter().map(|(c, _)| c.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; values.len() + 1].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            rule.table, columns, placeholders
        );

        let mut params: Vec<Value> = vec![Value::from(pk)];
        params.extend(values.into_iter().map(|(_, v)| v));

        self.relational.execute(&sql, &params).await?;
        Ok(())
    }

    // =====================================
    // Shared plumbing
    // =====================================

    fn apply_backpressure(&self, batch: &SyncReport) {
        if batch.scanned == 0 {
            return;
        }
        let mut state = self.backpressure.lock();
        let ratio = batch.failed as f32 / batch.scanned as f32;

        if ratio > self.config.failure_threshold {
            let halved = (state.batch_size / 2).max(self.config.min_batch);
            if halved < state.batch_size {
                warn!(
                    "Sync backpressure: failure ratio {:.2}, batch {} -> {}",
                    ratio, state.batch_size, halved
                );
                state.batch_size = halved;
            }
            state.clean_streak = 0;
        } else if batch.failed == 0 {
            state.clean_streak += 1;
            if state.clean_streak >= self.config.recovery_windows
                && state.batch_size < self.config.batch_cap
            {
                let doubled = (state.batch_size * 2).min(self.config.batch_cap);
                debug!(
                    "Sync backpressure recovered: batch {} -> {}",
                    state.batch_size, doubled
                );
                state.batch_size = doubled;
                state.clean_streak = 0;
            }
        } else {
            state.clean_streak = 0;
        }
    }

    async fn quarantine(
        &self,
        rule: &MappingRule,
        source_key: &str,
        concept: Option<&Concept>,
        row: &Row,
        reason: &str,
    ) -> GatewayResult<()> {
        // One unresolved entry per source_key; re-runs must not pile up.
        let existing = sqlx::query(
            "SELECT id FROM sync_quarantine WHERE source_key = ? AND resolved = 0",
        )
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO sync_quarantine
                (source_key, table_name, concept_id, relational_row, concept_snapshot, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source_key)
        .bind(&rule.table)
        .bind(concept.map(|c| c.id.clone()))
        .bind(Value::Object(row.clone()).to_string())
        .bind(concept.map(|c| serde_json::to_string(c).unwrap_or_default()))
        .bind(reason)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        info!("Quarantined sync conflict for {}", source_key);
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        direction: &str,
        scope: &str,
    ) -> GatewayResult<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM sync_checkpoints WHERE direction = ? AND scope = ?",
        )
        .bind(direction)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Checkpoint {
            direction: r.get("direction"),
            scope: r.get("scope"),
            last_updated_at: r.get("last_updated_at"),
            last_id: r.get("last_id"),
            row_hash: r.get("row_hash"),
        }))
    }

    /// Checkpoint advance is monotonic: an older cursor never overwrites a
    /// newer one.
    async fn save_checkpoint(&self, cp: &Checkpoint) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (direction, scope, last_updated_at, last_id, row_hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(direction, scope) DO UPDATE SET
                last_updated_at = excluded.last_updated_at,
                last_id = excluded.last_id,
                row_hash = excluded.row_hash,
                updated_at = excluded.updated_at
            WHERE excluded.last_updated_at > last_updated_at
               OR (excluded.last_updated_at = last_updated_at AND excluded.last_id >= last_id)
            "#,
        )
        .bind(&cp.direction)
        .bind(&cp.scope)
        .bind(cp.last_updated_at)
        .bind(&cp.last_id)
        .bind(&cp.row_hash)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_index(&self, source_key: &str) -> GatewayResult<Option<IndexEntry>> {
        let row = sqlx::query("SELECT * FROM sync_index WHERE source_key = ?")
            .bind(source_key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| IndexEntry {
            concept_id: r.get("concept_id"),
            row_hash: r.get("row_hash"),
            synced_at: r.get("synced_at"),
        }))
    }

    async fn save_index(
        &self,
        source_key: &str,
        concept_id: &str,
        row_hash: &str,
    ) -> GatewayResult<()> {
        self.save_index_at(source_key, concept_id, row_hash, now_ms())
            .await
    }

    async fn save_index_at(
        &self,
        source_key: &str,
        concept_id: &str,
        row_hash: &str,
        synced_at: i64,
    ) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_index (source_key, concept_id, row_hash, synced_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_key) DO UPDATE SET
                concept_id = excluded.concept_id,
                row_hash = excluded.row_hash,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(source_key)
        .bind(concept_id)
        .bind(row_hash)
        .bind(synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

enum ForwardOutcome {
    Applied,
    Skipped,
    Quarantined,
}

enum BackwardOutcome {
    Applied,
    Skipped,
    Quarantined,
}

/// Order-independent hash of a row's content.
fn canonical_row_hash(row: &Row) -> String {
    let sorted: BTreeMap<&String, &Value> = row.iter().collect();
    let serialized = serde_json::to_string(&sorted).unwrap_or_default();
    sha256_hex(serialized.as_bytes())
}
