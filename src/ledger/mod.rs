pub mod pg_store;
pub mod store;

pub use pg_store::PgLedgerStore;
pub use store::{LedgerStore, MemoryStore, StoreError};

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Position, PositionStatus};

/// Positions are keyed by (wallet, market_id): at most one may be open or
/// closing per key at a time.
pub type PositionKey = (String, String);

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The position moved since it was read; re-read and retry.
    #[error("version conflict on {wallet}/{market_id}: expected {expected}")]
    VersionConflict {
        wallet: String,
        market_id: String,
        expected: i64,
    },

    #[error("ledger persistence failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// Single source of truth for mirrored positions: an in-memory working set
/// with optimistic versioning, written through to a [`LedgerStore`] on every
/// successful update. All mutation goes through [`PositionLedger::upsert`],
/// which holds the write lock across the store write so concurrent writers
/// serialize here rather than racing in storage.
pub struct PositionLedger {
    positions: RwLock<HashMap<PositionKey, Position>>,
    store: Arc<dyn LedgerStore>,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load the working set from storage at startup.
    pub async fn hydrate(store: Arc<dyn LedgerStore>) -> anyhow::Result<Self> {
        let loaded = store.load().await?;
        let mut positions = HashMap::with_capacity(loaded.len());
        for pos in loaded {
            if pos.is_active() {
                positions.insert(pos.key(), pos);
            }
        }
        tracing::info!(count = positions.len(), "Ledger hydrated from store");
        Ok(Self {
            positions: RwLock::new(positions),
            store,
        })
    }

    pub async fn get(&self, wallet: &str, market_id: &str) -> Option<Position> {
        let positions = self.positions.read().await;
        positions
            .get(&(wallet.to_string(), market_id.to_string()))
            .cloned()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Option<Position> {
        let positions = self.positions.read().await;
        positions.values().find(|p| p.id == id).cloned()
    }

    /// Write a position with an optimistic version check.
    ///
    /// `expected_version` must equal the version the caller read (0 for a
    /// position that does not exist yet). On success the stored version is
    /// `expected_version + 1` and the saved snapshot is returned. Closed
    /// positions are archived out of the working set after their final save.
    pub async fn upsert(
        &self,
        mut position: Position,
        expected_version: i64,
    ) -> Result<Position, LedgerError> {
        let key = position.key();
        let mut positions = self.positions.write().await;

        let current_version = positions.get(&key).map(|p| p.version).unwrap_or(0);
        if current_version != expected_version {
            return Err(LedgerError::VersionConflict {
                wallet: key.0,
                market_id: key.1,
                expected: expected_version,
            });
        }

        position.version = expected_version + 1;

        match self.store.save(&position, expected_version).await {
            Ok(()) => {}
            Err(StoreError::Conflict { expected }) => {
                return Err(LedgerError::VersionConflict {
                    wallet: key.0,
                    market_id: key.1,
                    expected,
                });
            }
            Err(StoreError::Other(e)) => return Err(LedgerError::Store(e)),
        }

        if position.status == PositionStatus::Closed {
            positions.remove(&key);
        } else {
            positions.insert(key, position.clone());
        }

        Ok(position)
    }

    /// Snapshot of every open or closing position, for the risk loop.
    pub async fn list_open_or_closing(&self) -> Vec<Position> {
        let positions = self.positions.read().await;
        positions.values().cloned().collect()
    }

    /// Budget committed across all open/closing positions.
    pub async fn total_budget_committed(&self) -> Decimal {
        let positions = self.positions.read().await;
        positions.values().map(|p| p.budget_committed).sum()
    }

    /// Budget committed to one tracked wallet's mirrors.
    pub async fn budget_committed_for(&self, wallet: &str) -> Decimal {
        let positions = self.positions.read().await;
        positions
            .values()
            .filter(|p| p.wallet == wallet)
            .map(|p| p.budget_committed)
            .sum()
    }

    /// Record a signal id. `false` means it was already processed and the
    /// event must be dropped.
    pub async fn record_signal(&self, signal_id: &str) -> Result<bool, LedgerError> {
        self.store
            .record_signal(signal_id)
            .await
            .map_err(LedgerError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> PositionLedger {
        PositionLedger::new(Arc::new(MemoryStore::new()))
    }

    fn open_position(wallet: &str, market: &str) -> Position {
        Position::open(wallet, market, Decimal::new(20, 2), Decimal::new(90, 2))
    }

    #[tokio::test]
    async fn insert_then_update_bumps_version() {
        let ledger = ledger();
        let pos = open_position("0xw", "m1");

        let saved = ledger.upsert(pos, 0).await.unwrap();
        assert_eq!(saved.version, 1);

        let mut read = ledger.get("0xw", "m1").await.unwrap();
        read.owned_size = Decimal::from(10);
        let saved = ledger.upsert(read, 1).await.unwrap();
        assert_eq!(saved.version, 2);
    }

    #[tokio::test]
    async fn stale_write_is_rejected() {
        let ledger = ledger();
        let pos = open_position("0xw", "m1");
        let saved = ledger.upsert(pos, 0).await.unwrap();

        // Writer A and B both read version 1; A wins, B must conflict.
        let mut a = saved.clone();
        a.owned_size = Decimal::from(5);
        ledger.upsert(a, 1).await.unwrap();

        let mut b = saved;
        b.owned_size = Decimal::from(7);
        let err = ledger.upsert(b, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::VersionConflict { .. }));

        // The winning write survived.
        assert_eq!(
            ledger.get("0xw", "m1").await.unwrap().owned_size,
            Decimal::from(5)
        );
    }

    #[tokio::test]
    async fn double_open_same_key_conflicts() {
        let ledger = ledger();
        ledger.upsert(open_position("0xw", "m1"), 0).await.unwrap();

        let err = ledger.upsert(open_position("0xw", "m1"), 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn closed_positions_leave_the_working_set() {
        let ledger = ledger();
        let saved = ledger.upsert(open_position("0xw", "m1"), 0).await.unwrap();

        let mut closing = saved;
        closing.status = PositionStatus::Closed;
        closing.closed_at = Some(chrono::Utc::now());
        ledger.upsert(closing, 1).await.unwrap();

        assert!(ledger.get("0xw", "m1").await.is_none());
        assert!(ledger.list_open_or_closing().await.is_empty());

        // The key is free again for a fresh position.
        assert!(ledger.upsert(open_position("0xw", "m1"), 0).await.is_ok());
    }

    #[tokio::test]
    async fn budget_sums_by_wallet_and_total() {
        let ledger = ledger();

        let mut a = open_position("0xa", "m1");
        a.budget_committed = Decimal::from(100);
        ledger.upsert(a, 0).await.unwrap();

        let mut b = open_position("0xa", "m2");
        b.budget_committed = Decimal::from(50);
        ledger.upsert(b, 0).await.unwrap();

        let mut c = open_position("0xb", "m3");
        c.budget_committed = Decimal::from(25);
        ledger.upsert(c, 0).await.unwrap();

        assert_eq!(ledger.total_budget_committed().await, Decimal::from(175));
        assert_eq!(ledger.budget_committed_for("0xa").await, Decimal::from(150));
        assert_eq!(ledger.budget_committed_for("0xb").await, Decimal::from(25));
    }

    #[tokio::test]
    async fn record_signal_is_idempotent() {
        let ledger = ledger();
        assert!(ledger.record_signal("sig-1").await.unwrap());
        assert!(!ledger.record_signal("sig-1").await.unwrap());
    }
}
