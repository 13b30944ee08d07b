// src/quota/mod.rs

//! Per-tenant quota gate on the query path.
//!
//! Minute and second windows use token buckets (continuous refill); monthly
//! windows use fixed calendar UTC boundaries backed by counters in the
//! metadata database. Admissions for the same (tenant, resource) are
//! serialized; tenants never contend with each other.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::utils::{now_ms, KeyedLocks};

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Resources the gate admits or measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Query,
    ApiCall,
    Concepts,
    Storage,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::ApiCall => "api_call",
            Self::Concepts => "concepts",
            Self::Storage => "storage",
        }
    }
}

/// Plan limits for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantLimits {
    pub tenant: String,
    pub concepts: i64,
    pub queries_per_month: i64,
    pub api_calls_per_month: i64,
    pub storage_bytes: i64,
    pub queries_per_minute: u32,
    pub api_calls_per_second: u32,
    pub max_phase: u8,
}

impl TenantLimits {
    pub fn unlimited(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            concepts: i64::MAX,
            queries_per_month: i64::MAX,
            api_calls_per_month: i64::MAX,
            storage_bytes: i64::MAX,
            queries_per_minute: u32::MAX,
            api_calls_per_second: u32::MAX,
            max_phase: 4,
        }
    }
}

/// Current-window usage, for operator dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub tenant: String,
    pub queries_this_month: i64,
    pub api_calls_this_month: i64,
    pub queries_per_month_limit: i64,
    pub api_calls_per_month_limit: i64,
    pub month_resets_at: DateTime<Utc>,
}

pub struct QuotaGate {
    pool: SqlitePool,
    clock: DefaultClock,
    /// Token buckets keyed by (tenant, resource); rebuilt when the limit
    /// changes.
    buckets: RwLock<HashMap<(String, &'static str), (u32, Arc<DirectLimiter>)>>,
    locks: KeyedLocks,
}

impl QuotaGate {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: DefaultClock::default(),
            buckets: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    /// Admit one unit of `resource` for `tenant`, incrementing counters
    /// atomically. A rejection carries the resource label and the earliest
    /// retry time.
    pub async fn admit(&self, tenant: &str, resource: Resource) -> GatewayResult<()> {
        let limits = self.load_limits(tenant).await?;

        let (monthly_limit, monthly_label, rate, rate_label) = match resource {
            Resource::Query => (
                limits.queries_per_month,
                "queries_per_month",
                RateWindow::PerMinute(limits.queries_per_minute),
                "queries_per_minute",
            ),
            Resource::ApiCall => (
                limits.api_calls_per_month,
                "api_calls_per_month",
                RateWindow::PerSecond(limits.api_calls_per_second),
                "api_calls_per_second",
            ),
            other => {
                return Err(GatewayError::internal(format!(
                    "{} is a capacity resource, not an admission resource",
                    other.as_str()
                )))
            }
        };

        // Serialize concurrent admits on the same (tenant, resource) so the
        // check-then-increment pair stays atomic.
        let lock_key = format!("{}::{}", tenant, resource.as_str());
        let _guard = self.locks.acquire(&lock_key).await;

        let window_start = month_start(Utc::now());
        let count = self
            .window_count(tenant, resource.as_str(), window_start.timestamp())
            .await?;
        if count >= monthly_limit {
            crate::metrics::record_quota_rejection(monthly_label);
            return Err(GatewayError::QuotaExceeded {
                resource: monthly_label.to_string(),
                reset_at: next_month_start(window_start),
            });
        }

        // Token bucket consumes on check; nothing to roll back if it rejects
        // because the monthly counter has not been incremented yet.
        let limiter = self.bucket(tenant, rate_label, rate)?;
        if let Err(not_until) = limiter.check() {
            let wait = not_until.wait_time_from(self.clock.now());
            let reset_at = Utc::now()
                + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
            crate::metrics::record_quota_rejection(rate_label);
            debug!(
                "Rate limit hit for tenant {} on {} (retry in {:?})",
                tenant, rate_label, wait
            );
            return Err(GatewayError::QuotaExceeded {
                resource: rate_label.to_string(),
                reset_at,
            });
        }

        self.increment_window(tenant, resource.as_str(), window_start.timestamp())
            .await?;
        Ok(())
    }

    /// Capacity check for bulk resources: `current + delta <= limit`.
    pub async fn check_capacity(
        &self,
        tenant: &str,
        resource: Resource,
        current: i64,
        delta: i64,
    ) -> GatewayResult<()> {
        let limits = self.load_limits(tenant).await?;
        let limit = match resource {
            Resource::Concepts => limits.concepts,
            Resource::Storage => limits.storage_bytes,
            other => {
                return Err(GatewayError::internal(format!(
                    "{} is not a capacity resource",
                    other.as_str()
                )))
            }
        };

        if current + delta > limit {
            warn!(
                "Tenant {} over {} capacity: {} + {} > {}",
                tenant,
                resource.as_str(),
                current,
                delta,
                limit
            );
            return Err(GatewayError::QuotaExceeded {
                resource: resource.as_str().to_string(),
                reset_at: next_month_start(month_start(Utc::now())),
            });
        }
        Ok(())
    }

    pub async fn usage(&self, tenant: &str) -> GatewayResult<QuotaUsage> {
        let limits = self.load_limits(tenant).await?;
        let window_start = month_start(Utc::now());
        let ts = window_start.timestamp();

        Ok(QuotaUsage {
            tenant: tenant.to_string(),
            queries_this_month: self.window_count(tenant, "query", ts).await?,
            api_calls_this_month: self.window_count(tenant, "api_call", ts).await?,
            queries_per_month_limit: limits.queries_per_month,
            api_calls_per_month_limit: limits.api_calls_per_month,
            month_resets_at: next_month_start(window_start),
        })
    }

    pub async fn load_limits(&self, tenant: &str) -> GatewayResult<TenantLimits> {
        let row = sqlx::query("SELECT * FROM tenant_limits WHERE tenant = ?")
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(GatewayError::UnknownTenant(tenant.to_string()));
        };

        Ok(TenantLimits {
            tenant: tenant.to_string(),
            concepts: row.get("concepts"),
            queries_per_month: row.get("queries_per_month"),
            api_calls_per_month: row.get("api_calls_per_month"),
            storage_bytes: row.get("storage_bytes"),
            queries_per_minute: row.get::<i64, _>("queries_per_minute") as u32,
            api_calls_per_second: row.get::<i64, _>("api_calls_per_second") as u32,
            max_phase: row.get::<i64, _>("max_phase") as u8,
        })
    }

    pub async fn set_limits(&self, limits: &TenantLimits) -> GatewayResult<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO tenant_limits
                (tenant, concepts, queries_per_month, api_calls_per_month, storage_bytes,
                 queries_per_minute, api_calls_per_second, max_phase, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant) DO UPDATE SET
                concepts = excluded.concepts,
                queries_per_month = excluded.queries_per_month,
                api_calls_per_month = excluded.api_calls_per_month,
                storage_bytes = excluded.storage_bytes,
                queries_per_minute = excluded.queries_per_minute,
                api_calls_per_second = excluded.api_calls_per_second,
                max_phase = excluded.max_phase,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&limits.tenant)
        .bind(limits.concepts)
        .bind(limits.queries_per_month)
        .bind(limits.api_calls_per_month)
        .bind(limits.storage_bytes)
        .bind(limits.queries_per_minute as i64)
        .bind(limits.api_calls_per_second as i64)
        .bind(limits.max_phase as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn bucket(
        &self,
        tenant: &str,
        label: &'static str,
        rate: RateWindow,
    ) -> GatewayResult<Arc<DirectLimiter>> {
        let limit = rate.limit();
        let key = (tenant.to_string(), label);

        if let Some((cached_limit, limiter)) = self.buckets.read().get(&key) {
            if *cached_limit == limit {
                return Ok(limiter.clone());
            }
        }

        let quota = match rate {
            RateWindow::PerMinute(n) => Quota::per_minute(
                NonZeroU32::new(n).ok_or_else(|| GatewayError::internal("invalid rate limit"))?,
            ),
            RateWindow::PerSecond(n) => Quota::per_second(
                NonZeroU32::new(n).ok_or_else(|| GatewayError::internal("invalid rate limit"))?,
            ),
        };
        let limiter = Arc::new(GovRateLimiter::direct(quota));
        self.buckets
            .write()
            .insert(key, (limit, limiter.clone()));
        Ok(limiter)
    }

    async fn window_count(
        &self,
        tenant: &str,
        resource: &str,
        window_start: i64,
    ) -> GatewayResult<i64> {
        let row = sqlx::query(
            "SELECT count FROM usage_counters WHERE tenant = ? AND resource = ? AND window_start = ?",
        )
        .bind(tenant)
        .bind(resource)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("count")).unwrap_or(0))
    }

    async fn increment_window(
        &self,
        tenant: &str,
        resource: &str,
        window_start: i64,
    ) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_counters (tenant, resource, window_start, count)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(tenant, resource, window_start) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(tenant)
        .bind(resource)
        .bind(window_start)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RateWindow {
    PerMinute(u32),
    PerSecond(u32),
}

impl RateWindow {
    fn limit(&self) -> u32 {
        match self {
            Self::PerMinute(n) | Self::PerSecond(n) => *n,
        }
    }
}

/// First instant of the month containing `now`, UTC.
fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// First instant of the following month, UTC.
fn next_month_start(window_start: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if window_start.month() == 12 {
        (window_start.year() + 1, 1)
    } else {
        (window_start.year(), window_start.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(window_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_windows_roll_over_at_calendar_boundaries() {
        let t = Utc.with_ymd_and_hms(2025, 12, 15, 10, 30, 0).single().unwrap();
        let start = month_start(t);
        assert_eq!(start.month(), 12);
        assert_eq!(start.day(), 1);
        let next = next_month_start(start);
        assert_eq!(next.year(), 2026);
        assert_eq!(next.month(), 1);
    }
}
