// src/lib.rs

//! Evolutionary hybrid database gateway.
//!
//! Sits in front of a relational engine and a vector engine and presents a
//! single query surface for structured queries and natural-language
//! prompts. Per call it decides which engine (or both) executes, merges the
//! results, and feeds observability into an evolution tracker that shifts
//! the routing bias toward the semantic path over time.

pub mod api;
pub mod concepts;
pub mod config;
pub mod db;
pub mod error;
pub mod evolution;
pub mod intent;
pub mod metrics;
pub mod providers;
pub mod quota;
pub mod router;
pub mod sync;
pub mod utils;

// Export commonly used items
pub use api::{Gateway, GatewayProviders};
pub use concepts::{Concept, ConceptDraft, ConceptPatch, ConceptStore, RelationType};
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use intent::QueryKind;
pub use quota::TenantLimits;
pub use router::{QueryOptions, ResultSet, RouteInfo};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install a default tracing subscriber. Embedding transports usually bring
/// their own; this is for standalone use and examples.
pub fn init_tracing(level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
