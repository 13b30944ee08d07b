// src/intent/mod.rs

//! Intent analysis: classifies a query as sql / semantic / hybrid.
//!
//! The deterministic tier is always available. An optional LLM tier runs
//! under a hard deadline and only replaces the deterministic decision when
//! it is clearly more confident; on timeout or error the deterministic
//! result stands.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::IntentConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::IntentProvider;

lazy_static! {
    /// Queries that open with a SQL verb are SQL, full stop.
    static ref SQL_HEAD: Regex =
        Regex::new(r"(?i)^\s*(select|insert|update|delete|with|create|drop|alter|explain)\b")
            .expect("invalid SQL head regex");
    /// `like` followed by a literal is the SQL operator, not a similarity ask.
    static ref SQL_LIKE: Regex = Regex::new(r#"(?i)\blike\s+['"]"#).expect("invalid LIKE regex");
}

const SQL_TOKENS: &[&str] = &[
    "from", "where", "join", "group by", "order by", "limit", "=", "<", ">",
];

const SEMANTIC_TOKENS: &[&str] = &[
    "similar", "related", "about", "might", "probably", "seems", "find", "show me", "who", "what",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Sql,
    Semantic,
    Hybrid,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing decision with the analyzer's confidence and rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDecision {
    pub kind: QueryKind,
    pub confidence: f32,
    pub reasoning: String,
}

pub struct IntentAnalyzer {
    config: IntentConfig,
    llm: Option<Arc<dyn IntentProvider>>,
}

impl IntentAnalyzer {
    pub fn new(config: IntentConfig, llm: Option<Arc<dyn IntentProvider>>) -> Self {
        Self { config, llm }
    }

    /// Classify `query`. `concept_ratio` is the evolution bias applied to the
    /// semantic weight; `hint` short-circuits the classifier entirely.
    pub async fn analyze(
        &self,
        query: &str,
        hint: Option<QueryKind>,
        concept_ratio: f64,
    ) -> GatewayResult<IntentDecision> {
        if query.trim().is_empty() {
            return Err(GatewayError::EmptyQuery);
        }

        if let Some(kind) = hint {
            return Ok(IntentDecision {
                kind,
                confidence: 1.0,
                reasoning: "caller-preferred layer".into(),
            });
        }

        let deterministic = self.classify_deterministic(query, concept_ratio);

        let Some(llm) = &self.llm else {
            return Ok(deterministic);
        };

        // The LLM tier is advisory and raced against a hard deadline.
        match tokio::time::timeout(
            Duration::from_millis(self.config.llm_timeout_ms),
            llm.classify(query),
        )
        .await
        {
            Ok(Ok(llm_intent))
                if llm_intent.confidence >= deterministic.confidence + self.config.llm_margin =>
            {
                debug!(
                    "LLM intent {} ({:.2}) overrides deterministic {} ({:.2})",
                    llm_intent.kind,
                    llm_intent.confidence,
                    deterministic.kind,
                    deterministic.confidence
                );
                Ok(IntentDecision {
                    kind: llm_intent.kind,
                    confidence: llm_intent.confidence.clamp(0.0, 1.0),
                    reasoning: llm_intent.reason,
                })
            }
            Ok(Ok(_)) => Ok(deterministic),
            Ok(Err(e)) => {
                debug!("LLM intent tier failed, using deterministic: {}", e);
                Ok(deterministic)
            }
            Err(_) => {
                debug!("LLM intent tier timed out, using deterministic");
                Ok(deterministic)
            }
        }
    }

    /// The deterministic tier: strong-SQL head test, then disjoint keyword
    /// scans with the evolution bias folded into the semantic weight.
    pub fn classify_deterministic(&self, query: &str, concept_ratio: f64) -> IntentDecision {
        if SQL_HEAD.is_match(query) {
            return IntentDecision {
                kind: QueryKind::Sql,
                confidence: 1.0,
                reasoning: "query starts with a SQL statement keyword".into(),
            };
        }

        let lowered = query.to_lowercase();
        let sql_like = SQL_LIKE.find_iter(&lowered).count();
        let sql_hits = count_hits(&lowered, SQL_TOKENS) + sql_like;
        // "like" reads as a similarity ask unless it is followed by a literal.
        let semantic_like = count_hits(&lowered, &["like"]).saturating_sub(sql_like);
        let semantic_hits = count_hits(&lowered, SEMANTIC_TOKENS) + semantic_like;

        let s = semantic_hits as f64 / (sql_hits as f64 + semantic_hits as f64 + f64::EPSILON);

        // Evolution bias: scale the semantic weight and re-normalize. This is
        // how a phase change shifts routing without a code change.
        let weighted_semantic = s * (1.0 + concept_ratio);
        let weighted_sql = 1.0 - s;
        let biased = weighted_semantic / (weighted_semantic + weighted_sql);

        let (kind, confidence, reasoning) = if biased >= self.config.semantic_cutoff as f64 {
            (
                QueryKind::Semantic,
                biased,
                format!(
                    "semantic keywords dominate ({} semantic vs {} sql)",
                    semantic_hits, sql_hits
                ),
            )
        } else if biased <= self.config.sql_cutoff as f64 && sql_hits >= 1 {
            (
                QueryKind::Sql,
                1.0 - biased,
                format!(
                    "sql keywords dominate ({} sql vs {} semantic)",
                    sql_hits, semantic_hits
                ),
            )
        } else {
            (
                QueryKind::Hybrid,
                0.5 + (biased - 0.5).abs(),
                format!(
                    "mixed signals ({} sql, {} semantic)",
                    sql_hits, semantic_hits
                ),
            )
        };

        IntentDecision {
            kind,
            confidence: (confidence as f32).clamp(0.0, 1.0),
            reasoning,
        }
    }
}

fn count_hits(lowered: &str, tokens: &[&str]) -> usize {
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let padded = format!(" {} ", words.join(" "));

    tokens
        .iter()
        .map(|token| {
            if token.chars().any(|c| c.is_alphabetic()) {
                // Word tokens match on word boundaries, so "whatever" never
                // counts as "what".
                padded.matches(&format!(" {} ", token)).count()
            } else {
                lowered.matches(token).count()
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> IntentAnalyzer {
        IntentAnalyzer::new(IntentConfig::default(), None)
    }

    #[test]
    fn sql_statement_head_is_sql_with_full_confidence() {
        let decision =
            analyzer().classify_deterministic("  SELECT name FROM products WHERE price < 100", 0.1);
        assert_eq!(decision.kind, QueryKind::Sql);
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn similarity_language_is_semantic() {
        let decision = analyzer()
            .classify_deterministic("find products similar to noise-cancelling headphones", 0.1);
        assert_eq!(decision.kind, QueryKind::Semantic);
        assert!(decision.confidence >= 0.7);
    }

    #[test]
    fn mixed_signals_go_hybrid() {
        let decision = analyzer()
            .classify_deterministic("show me rows from orders about late deliveries where status = open", 0.1);
        assert_eq!(decision.kind, QueryKind::Hybrid);
        assert!(decision.confidence >= 0.5);
    }

    #[test]
    fn sql_like_literal_counts_as_sql() {
        let decision =
            analyzer().classify_deterministic("name like 'foo%' from users where active = 1", 0.1);
        assert_eq!(decision.kind, QueryKind::Sql);
    }

    #[test]
    fn higher_concept_ratio_shifts_toward_semantic() {
        let a = analyzer();
        // Three semantic hits against two sql hits: hybrid at phase 1 bias,
        // semantic once the ratio reaches 1.0.
        let query = "find laptops similar to developer picks about coding from inventory where stock";
        let low = a.classify_deterministic(query, 0.1);
        let high = a.classify_deterministic(query, 1.0);
        assert_eq!(low.kind, QueryKind::Hybrid);
        assert_eq!(high.kind, QueryKind::Semantic);
    }
}
