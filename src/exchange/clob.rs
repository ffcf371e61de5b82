use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::Side;

use super::auth::ApiAuth;
use super::{DepthLevel, ExchangeError, ExchangePort, OrderBook, OrderResult, OrderStatus};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
struct WireLevel {
    price: Decimal,
    size: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct WireBook {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireOrderResponse {
    order_id: Option<String>,
    status: Option<String>,
    #[serde(default)]
    filled_size: Option<Decimal>,
    #[serde(default)]
    avg_price: Option<Decimal>,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireBalance {
    available: Decimal,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Live exchange adapter: signed REST calls against the CLOB API.
#[derive(Debug, Clone)]
pub struct LiveExchange {
    http: Client,
    auth: ApiAuth,
    base_url: String,
}

impl LiveExchange {
    pub fn new(http: Client, auth: ApiAuth, base_url: String) -> Self {
        Self {
            http,
            auth,
            base_url,
        }
    }

    fn signed_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<[(&'static str, String); 4], ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self
            .auth
            .sign(&timestamp, method, path, body)
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;

        Ok([
            ("X-API-KEY", self.auth.api_key.clone()),
            ("X-SIGNATURE", signature),
            ("X-TIMESTAMP", timestamp),
            ("X-PASSPHRASE", self.auth.passphrase.clone()),
        ])
    }

    fn classify_status(status: StatusCode, body: String) -> ExchangeError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Auth(body),
            s if s.is_client_error() => ExchangeError::Rejected(body),
            s => ExchangeError::Transient(format!("HTTP {s}: {body}")),
        }
    }
}

#[async_trait]
impl ExchangePort for LiveExchange {
    async fn get_order_book(&self, market_id: &str) -> Result<OrderBook, ExchangeError> {
        let path = format!("/book?market_id={market_id}");
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.http.get(&url);
        for (name, value) in self.signed_headers("GET", &path, "")? {
            req = req.header(name, value);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let book: WireBook = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("bad book payload: {e}")))?;

        Ok(OrderBook {
            bids: book
                .bids
                .into_iter()
                .map(|l| DepthLevel { price: l.price, size: l.size })
                .collect(),
            asks: book
                .asks
                .into_iter()
                .map(|l| DepthLevel { price: l.price, size: l.size })
                .collect(),
        })
    }

    async fn place_order(
        &self,
        market_id: &str,
        side: Side,
        size: Decimal,
        price_limit: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let path = "/orders";
        let url = format!("{}{}", self.base_url, path);
        let body = json!({
            "market_id": market_id,
            "side": side.to_string(),
            "size": size,
            "price": price_limit,
        })
        .to_string();

        let mut req = self.http.post(&url).body(body.clone());
        req = req.header("Content-Type", "application/json");
        for (name, value) in self.signed_headers("POST", path, &body)? {
            req = req.header(name, value);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, text));
        }

        let order: WireOrderResponse = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("bad order payload: {e}")))?;

        match order.status.as_deref() {
            Some("matched") | Some("filled") => Ok(OrderResult {
                order_id: order.order_id.unwrap_or_default(),
                filled_size: order.filled_size.unwrap_or(size),
                avg_price: order.avg_price.unwrap_or(price_limit),
                status: OrderStatus::Filled,
            }),
            other => Err(ExchangeError::Rejected(format!(
                "order not matched (status {:?}): {}",
                other,
                order.error_msg.unwrap_or_default()
            ))),
        }
    }

    async fn get_balance(&self) -> Result<Decimal, ExchangeError> {
        let path = "/balance";
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.http.get(&url);
        for (name, value) in self.signed_headers("GET", path, "")? {
            req = req.header(name, value);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let balance: WireBalance = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("bad balance payload: {e}")))?;

        Ok(balance.available)
    }
}
