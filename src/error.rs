// src/error.rs
// Error types for the gateway core

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Gateway error taxonomy. Input and quota errors short-circuit; upstream
/// errors are retried internally before being surfaced.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("empty query")]
    EmptyQuery,

    #[error("quota exceeded for {resource}, resets at {reset_at}")]
    QuotaExceeded {
        resource: String,
        reset_at: DateTime<Utc>,
    },

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid relation: {0}")]
    InvalidRelation(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("sync conflict on {0}")]
    SyncConflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    pub fn deadline(msg: impl Into<String>) -> Self {
        Self::DeadlineExceeded(msg.into())
    }

    pub fn invalid_relation(msg: impl Into<String>) -> Self {
        Self::InvalidRelation(msg.into())
    }

    /// Stable error code used in query logs and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyQuery => "empty_query",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::UnknownTenant(_) => "unknown_tenant",
            Self::NotFound(_) => "not_found",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::InvalidRelation(_) => "invalid_relation",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::SyncConflict(_) => "sync_conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the internal retry budget applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            other => Self::UpstreamUnavailable(format!("metadata backend: {}", other)),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", e))
    }
}

/// Gateway result type used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;
