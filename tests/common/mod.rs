#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use mirrorbot::engine::{DecisionConfig, DecisionEngine, DripExecutor, ExecutionConfig};
use mirrorbot::exchange::{DepthLevel, ExchangePort, OrderBook, SimulatedExchange};
use mirrorbot::ledger::{MemoryStore, PositionLedger};
use mirrorbot::models::{Position, PositionStatus, Side, TradeEvent, WalletTarget};

pub const WHALE: &str = "0xWHALE0000000000000000000000000000000001";

/// Everything a test scenario needs, wired the way main() wires it but with
/// the simulated exchange and the in-memory store.
pub struct TestRig {
    pub exchange: Arc<SimulatedExchange>,
    pub ledger: Arc<PositionLedger>,
    pub executor: Arc<DripExecutor>,
    pub engine: Arc<DecisionEngine>,
    pub halt: Arc<AtomicBool>,
}

/// Execution config with all waits shrunk so suites stay fast.
pub fn fast_execution_config() -> ExecutionConfig {
    ExecutionConfig {
        chunk_cooldown: Duration::from_millis(2),
        illiquid_backoff_base: Duration::from_millis(1),
        submit_backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        io_timeout: Duration::from_secs(1),
        ..ExecutionConfig::default()
    }
}

pub fn default_targets() -> Vec<WalletTarget> {
    vec![WalletTarget {
        address: WHALE.to_string(),
        label: Some("whale".into()),
        mirror_ratio: Decimal::new(1, 1), // 0.1
        budget_cap: None,
    }]
}

pub fn rig() -> TestRig {
    rig_with(
        default_targets(),
        DecisionConfig {
            global_budget_cap: Decimal::from(1_000),
            max_position_budget: Decimal::from(1_000),
            ..DecisionConfig::default()
        },
        fast_execution_config(),
        Decimal::from(10_000),
    )
}

pub fn rig_with(
    targets: Vec<WalletTarget>,
    decision: DecisionConfig,
    execution: ExecutionConfig,
    sim_balance: Decimal,
) -> TestRig {
    let exchange = Arc::new(SimulatedExchange::new(sim_balance));
    let port: Arc<dyn ExchangePort> = exchange.clone();
    let ledger = Arc::new(PositionLedger::new(Arc::new(MemoryStore::new())));
    let halt = Arc::new(AtomicBool::new(false));
    let executor = Arc::new(DripExecutor::new(
        port,
        ledger.clone(),
        execution,
        halt.clone(),
    ));
    let engine = Arc::new(DecisionEngine::new(
        ledger.clone(),
        executor.clone(),
        targets,
        decision,
        halt.clone(),
    ));
    TestRig {
        exchange,
        ledger,
        executor,
        engine,
        halt,
    }
}

pub fn book(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> OrderBook {
    fn levels(raw: &[(&str, &str)]) -> Vec<DepthLevel> {
        raw.iter()
            .map(|&(p, s)| DepthLevel {
                price: p.parse().unwrap(),
                size: s.parse().unwrap(),
            })
            .collect()
    }
    OrderBook {
        bids: levels(bids),
        asks: levels(asks),
    }
}

/// A buy observed on the whale wallet. `tag` makes the signal id unique.
pub fn buy_event(market: &str, size: &str, price: &str, tag: &str) -> TradeEvent {
    event(market, Side::Buy, size, price, tag)
}

pub fn sell_event(market: &str, size: &str, price: &str, tag: &str) -> TradeEvent {
    event(market, Side::Sell, size, price, tag)
}

fn event(market: &str, side: Side, size: &str, price: &str, tag: &str) -> TradeEvent {
    let size: Decimal = size.parse().unwrap();
    let price: Decimal = price.parse().unwrap();
    let observed_at = Utc::now();
    let signal_id = TradeEvent::derive_signal_id(
        WHALE,
        market,
        side,
        size,
        price,
        observed_at,
        Some(tag),
    );
    TradeEvent {
        source_wallet: WHALE.to_string(),
        market_id: market.to_string(),
        side,
        size,
        price,
        observed_at,
        signal_id,
    }
}

/// Insert a position directly into the ledger (and give the simulator the
/// matching shares so sells can fill).
pub async fn seed_position(
    rig: &TestRig,
    market: &str,
    owned: &str,
    entry: &str,
    status: PositionStatus,
) -> Position {
    let owned: Decimal = owned.parse().unwrap();
    let entry: Decimal = entry.parse().unwrap();

    rig.exchange
        .place_order(market, Side::Buy, owned, entry)
        .await
        .expect("seeding buy must fill");

    let mut pos = Position::open(
        WHALE,
        market,
        Decimal::new(20, 2),
        Decimal::new(90, 2),
    );
    pos.owned_size = owned;
    pos.avg_entry_price = entry;
    pos.budget_committed = owned * entry;
    pos.status = status;
    rig.ledger.upsert(pos, 0).await.expect("seed upsert")
}

/// Wait until no plan is in flight for the position (i.e. the spawned run
/// has been finalized and released).
pub async fn wait_for_plan_end(rig: &TestRig, position_id: Uuid) {
    for _ in 0..2_000 {
        if !rig.engine.has_active_plan(position_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("plan for {position_id} did not finish in time");
}
