use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::Position;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored row moved past `expected` since it was read.
    #[error("stored version changed (expected {expected})")]
    Conflict { expected: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistence contract for the position ledger. The ledger writes through
/// on every successful in-memory update; `expected_version` carries the
/// optimistic concurrency check down to storage.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// All positions that were open or closing at last shutdown.
    async fn load(&self) -> anyhow::Result<Vec<Position>>;

    /// Persist one position. `expected_version` is the version the caller
    /// read; the stored row must still be at it (new rows pass 0).
    async fn save(&self, position: &Position, expected_version: i64) -> Result<(), StoreError>;

    /// Record a processed signal id. Returns `false` if it was already
    /// recorded — the caller drops the duplicate.
    async fn record_signal(&self, signal_id: &str) -> anyhow::Result<bool>;
}

/// Non-persisting store for dry-run mode and tests. Signal ids are still
/// tracked so idempotent ingestion behaves identically.
#[derive(Default)]
pub struct MemoryStore {
    seen_signals: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load(&self) -> anyhow::Result<Vec<Position>> {
        Ok(Vec::new())
    }

    async fn save(&self, _position: &Position, _expected_version: i64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_signal(&self, signal_id: &str) -> anyhow::Result<bool> {
        let mut seen = self.seen_signals.lock().await;
        Ok(seen.insert(signal_id.to_string()))
    }
}
