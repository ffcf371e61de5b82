use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::models::Side;

use super::{DepthLevel, ExchangeError, ExchangePort, OrderBook, OrderResult, OrderStatus};

/// One holding on the simulated exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Holding {
    pub size: Decimal,
    pub avg_entry_price: Decimal,
}

/// An order the simulator accepted, kept for test assertions.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub market_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price_limit: Decimal,
}

struct SimInner {
    balance: Decimal,
    holdings: HashMap<String, Holding>,
    books: HashMap<String, OrderBook>,
    default_book: Option<OrderBook>,
    orders: Vec<PlacedOrder>,
    injected_failures: VecDeque<ExchangeError>,
    order_seq: u64,
}

/// In-memory exchange with the same port as the live adapter. Orders fill
/// immediately at their limit price; balance and holdings are tracked with
/// weighted-average entries so dry runs and tests see realistic accounting.
pub struct SimulatedExchange {
    inner: Mutex<SimInner>,
}

impl SimulatedExchange {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                balance: initial_balance,
                holdings: HashMap::new(),
                books: HashMap::new(),
                default_book: None,
                orders: Vec::new(),
                injected_failures: VecDeque::new(),
                order_seq: 0,
            }),
        }
    }

    /// Simulator that answers every unknown market with a plausible book,
    /// for dry-run mode where no depth has been scripted.
    pub fn with_default_book(initial_balance: Decimal) -> Self {
        let mut sim = Self::new(initial_balance);
        sim.inner.get_mut().default_book = Some(OrderBook {
            bids: vec![
                DepthLevel { price: Decimal::new(50, 2), size: Decimal::from(1000) },
                DepthLevel { price: Decimal::new(49, 2), size: Decimal::from(2000) },
            ],
            asks: vec![
                DepthLevel { price: Decimal::new(51, 2), size: Decimal::from(1000) },
                DepthLevel { price: Decimal::new(52, 2), size: Decimal::from(2000) },
            ],
        });
        sim
    }

    pub async fn set_order_book(&self, market_id: &str, book: OrderBook) {
        let mut inner = self.inner.lock().await;
        inner.books.insert(market_id.to_string(), book);
    }

    /// Queue an error returned by the next `place_order` call (FIFO).
    pub async fn inject_order_failure(&self, err: ExchangeError) {
        let mut inner = self.inner.lock().await;
        inner.injected_failures.push_back(err);
    }

    pub async fn balance(&self) -> Decimal {
        self.inner.lock().await.balance
    }

    pub async fn holding(&self, market_id: &str) -> Option<Holding> {
        self.inner.lock().await.holdings.get(market_id).copied()
    }

    pub async fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.inner.lock().await.orders.clone()
    }
}

#[async_trait]
impl ExchangePort for SimulatedExchange {
    async fn get_order_book(&self, market_id: &str) -> Result<OrderBook, ExchangeError> {
        let inner = self.inner.lock().await;
        if let Some(book) = inner.books.get(market_id) {
            return Ok(book.clone());
        }
        if let Some(book) = &inner.default_book {
            return Ok(book.clone());
        }
        Ok(OrderBook::default())
    }

    async fn place_order(
        &self,
        market_id: &str,
        side: Side,
        size: Decimal,
        price_limit: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let mut inner = self.inner.lock().await;

        if let Some(err) = inner.injected_failures.pop_front() {
            return Err(err);
        }

        let cost = size * price_limit;
        match side {
            Side::Buy => {
                if cost > inner.balance {
                    return Err(ExchangeError::Rejected(format!(
                        "insufficient funds: have {}, need {cost}",
                        inner.balance
                    )));
                }
                inner.balance -= cost;

                let holding = inner
                    .holdings
                    .entry(market_id.to_string())
                    .or_insert(Holding {
                        size: Decimal::ZERO,
                        avg_entry_price: Decimal::ZERO,
                    });
                let new_size = holding.size + size;
                holding.avg_entry_price =
                    (holding.avg_entry_price * holding.size + cost) / new_size;
                holding.size = new_size;
            }
            Side::Sell => {
                let held = inner.holdings.get(market_id).map(|h| h.size).unwrap_or(Decimal::ZERO);
                if held < size {
                    return Err(ExchangeError::Rejected(format!(
                        "not enough shares: have {held}, selling {size}"
                    )));
                }
                let left = held - size;
                if left.is_zero() {
                    inner.holdings.remove(market_id);
                } else if let Some(holding) = inner.holdings.get_mut(market_id) {
                    holding.size = left;
                }
                inner.balance += cost;
            }
        }

        inner.order_seq += 1;
        let order_id = format!("sim-{}", inner.order_seq);
        inner.orders.push(PlacedOrder {
            market_id: market_id.to_string(),
            side,
            size,
            price_limit,
        });

        tracing::debug!(
            order_id = %order_id,
            market = market_id,
            side = %side,
            size = %size,
            price = %price_limit,
            balance = %inner.balance,
            "Simulated order filled"
        );

        Ok(OrderResult {
            order_id,
            filled_size: size,
            avg_price: price_limit,
            status: OrderStatus::Filled,
        })
    }

    async fn get_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.inner.lock().await.balance)
    }
}
