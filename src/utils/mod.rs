// src/utils/mod.rs
// Shared utilities: keyed async locks, hashing, time helpers

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-key async locks. Used to serialize writes to the same concept id and
/// admissions for the same (tenant, resource) pair. Different keys proceed
/// independently.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock();
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Acquire locks for two keys in a stable order (avoids lock-order
    /// inversion when two tasks merge the same pair in opposite directions).
    pub async fn acquire_pair(&self, a: &str, b: &str) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        if a <= b {
            let first = self.acquire(a).await;
            let second = self.acquire(b).await;
            (first, second)
        } else {
            let first = self.acquire(b).await;
            let second = self.acquire(a).await;
            (first, second)
        }
    }
}

/// Hex-encoded SHA-256 of the input.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lowercase and collapse runs of whitespace, for cache fingerprints.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_query("  SELECT *\n  FROM t "), "select * from t");
    }

    #[tokio::test]
    async fn keyed_locks_are_independent_per_key() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("a").await;
        // A different key must not block.
        let _b = locks.acquire("b").await;
    }
}
