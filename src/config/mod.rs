// src/config/mod.rs
// Central configuration for the gateway core

pub mod helpers;

use serde::{Deserialize, Serialize};

use helpers::{env_opt, env_or, env_parsed_or};

/// Main configuration structure - composes all domain configs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    pub qdrant: QdrantConfig,
    pub embedding: EmbeddingConfig,
    pub router: RouterConfig,
    pub intent: IntentConfig,
    pub sync: SyncConfig,
    pub evolution: EvolutionConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        // Don't panic if .env doesn't exist (for production)
        dotenv::dotenv().ok();

        Self {
            database: DatabaseConfig::from_env(),
            qdrant: QdrantConfig::from_env(),
            embedding: EmbeddingConfig::from_env(),
            router: RouterConfig::from_env(),
            intent: IntentConfig::from_env(),
            sync: SyncConfig::from_env(),
            evolution: EvolutionConfig::from_env(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            qdrant: QdrantConfig::default(),
            embedding: EmbeddingConfig::default(),
            router: RouterConfig::default(),
            intent: IntentConfig::default(),
            sync: SyncConfig::default(),
            evolution: EvolutionConfig::default(),
        }
    }
}

/// Metadata database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_or("CONCEPTGATE_DATABASE_URL", "sqlite://conceptgate.db"),
            max_connections: env_parsed_or("CONCEPTGATE_SQLITE_MAX_CONNECTIONS", 5),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://conceptgate.db".into(),
            max_connections: 5,
        }
    }
}

/// Vector backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    /// Vector dimension is constant within a deployment.
    pub vector_dim: usize,
}

impl QdrantConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_or("QDRANT_URL", "http://localhost:6334"),
            collection: env_or("QDRANT_COLLECTION", "conceptgate_concepts"),
            vector_dim: env_parsed_or("CONCEPTGATE_VECTOR_DIM", 384),
        }
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".into(),
            collection: "conceptgate_concepts".into(),
            vector_dim: 384,
        }
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub dim: usize,
    pub timeout_ms: u64,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env_opt("OPENAI_API_KEY"),
            model: env_or("CONCEPTGATE_EMBEDDING_MODEL", "text-embedding-3-small"),
            dim: env_parsed_or("CONCEPTGATE_VECTOR_DIM", 384),
            timeout_ms: env_parsed_or("CONCEPTGATE_EMBEDDING_TIMEOUT_MS", 2000),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "text-embedding-3-small".into(),
            dim: 384,
            timeout_ms: 2000,
        }
    }
}

/// Query router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-request deadline for Execute.
    pub execute_timeout_ms: u64,
    /// Deadline for a semantic search call.
    pub semantic_timeout_ms: u64,
    pub default_k: usize,
    pub default_threshold: f32,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: i64,
}

impl RouterConfig {
    pub fn from_env() -> Self {
        Self {
            execute_timeout_ms: env_parsed_or("CONCEPTGATE_EXECUTE_TIMEOUT_MS", 5000),
            semantic_timeout_ms: env_parsed_or("CONCEPTGATE_SEMANTIC_TIMEOUT_MS", 2000),
            default_k: env_parsed_or("CONCEPTGATE_DEFAULT_K", 10),
            default_threshold: env_parsed_or("CONCEPTGATE_DEFAULT_THRESHOLD", 0.3),
            cache_enabled: env_parsed_or("CONCEPTGATE_CACHE_ENABLED", true),
            cache_ttl_seconds: env_parsed_or("CONCEPTGATE_CACHE_TTL_SECONDS", 300),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            execute_timeout_ms: 5000,
            semantic_timeout_ms: 2000,
            default_k: 10,
            default_threshold: 0.3,
            cache_enabled: true,
            cache_ttl_seconds: 300,
        }
    }
}

/// Intent analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Hard deadline for the optional LLM tier.
    pub llm_timeout_ms: u64,
    /// The LLM replaces the deterministic decision only when its confidence
    /// exceeds the deterministic one by at least this margin.
    pub llm_margin: f32,
    pub semantic_cutoff: f32,
    pub sql_cutoff: f32,
}

impl IntentConfig {
    pub fn from_env() -> Self {
        Self {
            llm_timeout_ms: env_parsed_or("CONCEPTGATE_LLM_TIMEOUT_MS", 300),
            llm_margin: env_parsed_or("CONCEPTGATE_LLM_MARGIN", 0.15),
            semantic_cutoff: env_parsed_or("CONCEPTGATE_SEMANTIC_CUTOFF", 0.7),
            sql_cutoff: env_parsed_or("CONCEPTGATE_SQL_CUTOFF", 0.3),
        }
    }
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            llm_timeout_ms: 300,
            llm_margin: 0.15,
            semantic_cutoff: 0.7,
            sql_cutoff: 0.3,
        }
    }
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Soft cap on batch size; backpressure halves it and recovers back up.
    pub batch_cap: usize,
    pub min_batch: usize,
    pub batch_timeout_ms: u64,
    /// Failed-item share above which a window counts as degraded.
    pub failure_threshold: f32,
    /// Consecutive clean windows before the batch size doubles back up.
    pub recovery_windows: u32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            interval_secs: env_parsed_or("CONCEPTGATE_SYNC_INTERVAL_SECS", 60),
            batch_cap: env_parsed_or("CONCEPTGATE_SYNC_BATCH_CAP", 500),
            min_batch: env_parsed_or("CONCEPTGATE_SYNC_MIN_BATCH", 25),
            batch_timeout_ms: env_parsed_or("CONCEPTGATE_SYNC_BATCH_TIMEOUT_MS", 10_000),
            failure_threshold: env_parsed_or("CONCEPTGATE_SYNC_FAILURE_THRESHOLD", 0.2),
            recovery_windows: env_parsed_or("CONCEPTGATE_SYNC_RECOVERY_WINDOWS", 5),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_cap: 500,
            min_batch: 25,
            batch_timeout_ms: 10_000,
            failure_threshold: 0.2,
            recovery_windows: 5,
        }
    }
}

/// Evolution tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Rolling observation window; older entries are discarded.
    pub window_size: usize,
    pub min_semantic_confidence: f32,
    /// p95 semantic latency must stay under multiplier * p95 sql latency...
    pub latency_multiplier: f64,
    /// ...or under this absolute ceiling.
    pub latency_ceiling_ms: u64,
    pub min_queries_between_phases: u64,
}

impl EvolutionConfig {
    pub fn from_env() -> Self {
        Self {
            window_size: env_parsed_or("CONCEPTGATE_EVOLUTION_WINDOW", 1000),
            min_semantic_confidence: env_parsed_or("CONCEPTGATE_EVOLUTION_MIN_CONFIDENCE", 0.70),
            latency_multiplier: env_parsed_or("CONCEPTGATE_EVOLUTION_LATENCY_MULTIPLIER", 2.0),
            latency_ceiling_ms: env_parsed_or("CONCEPTGATE_EVOLUTION_LATENCY_CEILING_MS", 500),
            min_queries_between_phases: env_parsed_or("CONCEPTGATE_EVOLUTION_MIN_QUERIES", 1000),
        }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            min_semantic_confidence: 0.70,
            latency_multiplier: 2.0,
            latency_ceiling_ms: 500,
            min_queries_between_phases: 1000,
        }
    }
}
