pub mod auth;
pub mod clob;
pub mod sim;

pub use clob::LiveExchange;
pub use sim::SimulatedExchange;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Side;

/// Smallest size increment the exchange accepts: 0.01 shares.
pub const SIZE_DECIMALS: u32 = 2;

/// Floor a size to the exchange increment. Never rounds up — overshooting
/// the increment would overspend budget.
pub fn floor_to_tick(size: Decimal) -> Decimal {
    size.max(Decimal::ZERO).trunc_with_scale(SIZE_DECIMALS)
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network failure, timeout, 5xx — safe to retry.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The exchange refused this specific order (bad size, no funds, market
    /// closed). The order will not succeed as-is, but the session is fine.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Credentials are bad. Fatal for the whole engine: nothing can be
    /// placed until the operator intervenes.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ExchangeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Auth(_))
    }
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    /// Buy offers, best (highest) price first.
    pub bids: Vec<DepthLevel>,
    /// Sell offers, best (lowest) price first.
    pub asks: Vec<DepthLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
    Rejected,
}

/// Outcome of one order submission, as confirmed by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
    pub status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Capability interface to the order-book exchange. Two implementations:
/// [`LiveExchange`] against the real API and [`SimulatedExchange`] for
/// dry-run and tests. The engines are agnostic to which one they hold.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Current market depth for one market.
    async fn get_order_book(&self, market_id: &str) -> Result<OrderBook, ExchangeError>;

    /// Place a limit order and wait for its fill confirmation.
    async fn place_order(
        &self,
        market_id: &str,
        side: Side,
        size: Decimal,
        price_limit: Decimal,
    ) -> Result<OrderResult, ExchangeError>;

    /// Available quote-currency balance.
    async fn get_balance(&self) -> Result<Decimal, ExchangeError>;
}
