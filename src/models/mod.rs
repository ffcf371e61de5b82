pub mod position;
pub mod wallet;

pub use position::{Position, PositionStatus};
pub use wallet::WalletTarget;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "0" => Some(Side::Buy),
            "SELL" | "1" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// TradeEvent — core pipeline message
// ---------------------------------------------------------------------------

/// A trade observed on a tracked wallet. Delivery is at-least-once; consumers
/// deduplicate on `signal_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub source_wallet: String,
    pub market_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
    pub signal_id: String,
}

impl TradeEvent {
    /// Derive the stable signal id for an observed exchange activity row.
    ///
    /// The id must be identical for every redelivery of the same underlying
    /// event, so it hashes only fields the exchange reports, not the time we
    /// happened to observe them.
    pub fn derive_signal_id(
        wallet: &str,
        market_id: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
        traded_at: DateTime<Utc>,
        tx_hash: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(wallet.as_bytes());
        hasher.update(b"|");
        hasher.update(market_id.as_bytes());
        hasher.update(b"|");
        hasher.update(side.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(size.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(price.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(traded_at.timestamp_millis().to_string().as_bytes());
        if let Some(tx) = tx_hash {
            hasher.update(b"|");
            hasher.update(tx.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trade: wallet={} market={} side={} size={} price={}",
            &self.source_wallet[..8.min(self.source_wallet.len())],
            &self.market_id[..8.min(self.market_id.len())],
            self.side,
            self.size,
            self.price,
        )
    }
}
