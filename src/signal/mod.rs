use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::models::{Side, TradeEvent, WalletTarget};

// ---------------------------------------------------------------------------
// Activity feed client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ActivityClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// One row from the wallet activity feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiActivity {
    #[serde(rename = "type")]
    pub activity_type: Option<String>,
    pub side: Option<String>,
    pub size: Option<Decimal>,
    pub price: Option<Decimal>,
    pub market: Option<String>,
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

/// Thin client for the public data API's per-wallet activity feed.
#[derive(Debug, Clone)]
pub struct ActivityClient {
    http: Client,
    base_url: String,
}

impl ActivityClient {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Most recent activity rows for a wallet, newest first.
    pub async fn get_wallet_activity(
        &self,
        wallet: &str,
        limit: u32,
    ) -> Result<Vec<ApiActivity>, ActivityClientError> {
        let url = format!("{}/activity", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("user", wallet),
                ("limit", &limit.to_string()),
                ("sortBy", "timestamp"),
                ("sortDirection", "desc"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let rows: Vec<ApiActivity> = resp.json().await?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Poll each tracked wallet's activity feed and emit new trades as
/// [`TradeEvent`]s. Delivery is at-least-once: the same underlying trade may
/// be emitted twice across reconnects, so consumers deduplicate on
/// `signal_id`.
pub async fn run_signal_poller(
    client: ActivityClient,
    targets: Vec<WalletTarget>,
    tx: mpsc::Sender<TradeEvent>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    tracing::info!(
        wallet_count = targets.len(),
        interval_secs = poll_interval.as_secs(),
        "Signal poller started"
    );

    // Start the cutoff at now so only trades made after startup mirror.
    let mut last_seen: HashMap<String, DateTime<Utc>> = targets
        .iter()
        .map(|t| (t.address.clone(), Utc::now()))
        .collect();

    loop {
        sleep(poll_interval).await;

        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        for target in &targets {
            let rows = match client.get_wallet_activity(&target.address, 10).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::debug!(
                        error = %e,
                        wallet = %target.display_name(),
                        "Activity fetch failed"
                    );
                    continue;
                }
            };

            let cutoff = last_seen
                .get(&target.address)
                .copied()
                .unwrap_or_else(Utc::now);
            let mut latest = cutoff;

            for row in &rows {
                let Some(event) = convert_activity(&target.address, row) else {
                    continue;
                };
                if event.observed_at <= cutoff {
                    continue;
                }
                if event.observed_at > latest {
                    latest = event.observed_at;
                }

                tracing::info!(
                    wallet = %target.display_name(),
                    market = %event.market_id,
                    side = %event.side,
                    size = %event.size,
                    price = %event.price,
                    "Whale trade detected"
                );

                if let Err(e) = tx.send(event).await {
                    tracing::error!(error = %e, "Failed to send trade event to engine");
                    return;
                }
            }

            if latest > cutoff {
                last_seen.insert(target.address.clone(), latest);
            }
        }
    }

    tracing::info!("Signal poller stopped");
}

/// Map one activity row to a [`TradeEvent`]; `None` for non-trade rows or
/// rows missing the fields we mirror on.
fn convert_activity(wallet: &str, row: &ApiActivity) -> Option<TradeEvent> {
    let kind = row.activity_type.as_deref().unwrap_or("").to_uppercase();
    if kind != "TRADE" && kind != "MATCH" {
        return None;
    }

    let side = Side::from_api_str(row.side.as_deref()?)?;
    let size = row.size.filter(|s| *s > Decimal::ZERO)?;
    let price = row.price.filter(|p| *p > Decimal::ZERO)?;
    let market_id = row.market.clone()?;
    let traded_at = DateTime::from_timestamp(row.timestamp?, 0)?;

    let signal_id = TradeEvent::derive_signal_id(
        wallet,
        &market_id,
        side,
        size,
        price,
        traded_at,
        row.transaction_hash.as_deref(),
    );

    Some(TradeEvent {
        source_wallet: wallet.to_string(),
        market_id,
        side,
        size,
        price,
        observed_at: traded_at,
        signal_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_row() -> ApiActivity {
        ApiActivity {
            activity_type: Some("TRADE".into()),
            side: Some("BUY".into()),
            size: Some(Decimal::from(1000)),
            price: Some(Decimal::new(50, 2)),
            market: Some("market-1".into()),
            timestamp: Some(1_700_000_000),
            transaction_hash: Some("0xabc".into()),
        }
    }

    #[test]
    fn converts_trade_rows() {
        let event = convert_activity("0xwhale", &trade_row()).unwrap();
        assert_eq!(event.source_wallet, "0xwhale");
        assert_eq!(event.market_id, "market-1");
        assert_eq!(event.side, Side::Buy);
        assert_eq!(event.size, Decimal::from(1000));
        assert_eq!(event.signal_id.len(), 64);
    }

    #[test]
    fn conversion_is_stable_across_redelivery() {
        let a = convert_activity("0xwhale", &trade_row()).unwrap();
        let b = convert_activity("0xwhale", &trade_row()).unwrap();
        assert_eq!(a.signal_id, b.signal_id);
    }

    #[test]
    fn skips_non_trade_rows() {
        let mut row = trade_row();
        row.activity_type = Some("REWARD".into());
        assert!(convert_activity("0xwhale", &row).is_none());

        let mut row = trade_row();
        row.size = Some(Decimal::ZERO);
        assert!(convert_activity("0xwhale", &row).is_none());

        let mut row = trade_row();
        row.market = None;
        assert!(convert_activity("0xwhale", &row).is_none());
    }
}
