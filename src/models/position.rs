use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a mirrored position. Transitions are monotone:
/// `Open → Closing → Closed`. Closing is entered at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closing" => Some(PositionStatus::Closing),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mirrored position in one market, keyed by (wallet, market_id).
///
/// `owned_size` and `budget_committed` are mutated only on confirmed fills,
/// by the execution engine; `version` is bumped by the ledger on every
/// successful write and drives optimistic concurrency control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub wallet: String,
    pub market_id: String,
    pub owned_size: Decimal,
    pub avg_entry_price: Decimal,
    pub budget_committed: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub status: PositionStatus,
    pub needs_review: bool,
    pub realized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Position {
    pub fn open(
        wallet: &str,
        market_id: &str,
        stop_loss_pct: Decimal,
        take_profit_pct: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet: wallet.to_string(),
            market_id: market_id.to_string(),
            owned_size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            budget_committed: Decimal::ZERO,
            stop_loss_pct,
            take_profit_pct,
            status: PositionStatus::Open,
            needs_review: false,
            realized_pnl: Decimal::ZERO,
            opened_at: Utc::now(),
            closed_at: None,
            version: 0,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.wallet.clone(), self.market_id.clone())
    }

    /// Return on investment at `current_price`, or `None` when there is no
    /// meaningful entry price to measure against.
    pub fn roi(&self, current_price: Decimal) -> Option<Decimal> {
        if self.avg_entry_price.is_zero() {
            return None;
        }
        Some((current_price - self.avg_entry_price) / self.avg_entry_price)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::Closing)
    }
}
