mod common;

use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use mirrorbot::engine::{Decision, DecisionConfig, PlanOutcome, PlanRequest};
use mirrorbot::exchange::ExchangeError;
use mirrorbot::models::{PositionStatus, Side};

use common::*;

#[tokio::test]
async fn whale_buy_mirrors_in_liquidity_bounded_chunks() {
    // Whale buys 1000 @ 0.50, ratio 0.1 → our plan is 100 shares. The book
    // shows 120 visible within the limit, fraction 0.25 → 30 per chunk.
    let mut execution = fast_execution_config();
    execution.chunk_cooldown = Duration::from_millis(20);
    let rig = rig_with(
        default_targets(),
        DecisionConfig {
            global_budget_cap: Decimal::from(1_000),
            max_position_budget: Decimal::from(1_000),
            ..DecisionConfig::default()
        },
        execution,
        Decimal::from(10_000),
    );

    rig.exchange
        .set_order_book("market-a", book(&[], &[("0.51", "120")]))
        .await;

    let started = Instant::now();
    let decision = rig
        .engine
        .on_signal(&buy_event("market-a", "1000", "0.50", "tx-1"))
        .await
        .unwrap();

    let Decision::Buy { position_id, size } = decision else {
        panic!("expected a buy plan, got {decision:?}");
    };
    assert_eq!(size, Decimal::from(100));

    wait_for_plan_end(&rig, position_id).await;
    let elapsed = started.elapsed();

    // Four chunks: 30, 30, 30, 10.
    let orders = rig.exchange.placed_orders().await;
    let sizes: Vec<Decimal> = orders.iter().map(|o| o.size).collect();
    assert_eq!(
        sizes,
        vec![
            Decimal::from(30),
            Decimal::from(30),
            Decimal::from(30),
            Decimal::from(10)
        ]
    );

    // A cooldown separates consecutive chunks.
    assert!(
        elapsed >= Duration::from_millis(60),
        "expected three cooldowns between four chunks, finished in {elapsed:?}"
    );

    let pos = rig.ledger.get(WHALE, "market-a").await.unwrap();
    assert_eq!(pos.owned_size, Decimal::from(100));
    assert_eq!(pos.status, PositionStatus::Open);
    // Fills landed at the 0.55 limit; staged budget reconciled to actual cost.
    assert_eq!(pos.avg_entry_price, Decimal::new(55, 2));
    assert_eq!(pos.budget_committed, Decimal::from(55));
}

#[tokio::test]
async fn submitted_sizes_stay_on_the_exchange_increment() {
    let rig = rig();

    rig.exchange
        .set_order_book("market-b", book(&[], &[("0.47", "77.7")]))
        .await;

    // Mirror size floors to 33.33; chunk bounds floor to 19.42 then 13.91.
    let decision = rig
        .engine
        .on_signal(&buy_event("market-b", "333.33", "0.47", "tx-2"))
        .await
        .unwrap();
    let Decision::Buy { position_id, size } = decision else {
        panic!("expected a buy plan, got {decision:?}");
    };
    assert_eq!(size, Decimal::new(3333, 2));

    wait_for_plan_end(&rig, position_id).await;

    let orders = rig.exchange.placed_orders().await;
    assert!(!orders.is_empty());

    let mut remaining = size;
    for order in &orders {
        // size × 100 is an integer (2-decimal floor)…
        let scaled = order.size * Decimal::from(100);
        assert_eq!(scaled, scaled.trunc(), "size {} off the tick", order.size);
        // …and never exceeds what was left to fill.
        assert!(order.size <= remaining, "size {} exceeds remaining {remaining}", order.size);
        remaining -= order.size;
    }
    assert_eq!(remaining, Decimal::ZERO);
}

#[tokio::test]
async fn illiquid_book_stalls_the_plan() {
    let rig = rig();
    let pos = seed_position(&rig, "market-c", "100", "0.50", PositionStatus::Closing).await;

    // No book scripted for this market → empty depth every round.
    let handle = rig.executor.try_claim(pos.id, Side::Sell).await.unwrap();
    let report = rig
        .executor
        .execute(
            &PlanRequest {
                position_id: pos.id,
                wallet: pos.wallet.clone(),
                market_id: pos.market_id.clone(),
                side: Side::Sell,
                target_delta: pos.owned_size,
                limit_price: Decimal::new(1, 2),
            },
            &handle,
        )
        .await;

    assert_eq!(report.outcome, PlanOutcome::Stalled);
    assert_eq!(report.filled_size, Decimal::ZERO);

    // Nothing moved in the ledger.
    let after = rig.ledger.get_by_id(pos.id).await.unwrap();
    assert_eq!(after.owned_size, Decimal::from(100));
}

#[tokio::test]
async fn cancellation_keeps_fills_and_stops_new_chunks() {
    let mut execution = fast_execution_config();
    execution.chunk_cooldown = Duration::from_millis(50);
    let rig = rig_with(
        default_targets(),
        DecisionConfig::default(),
        execution,
        Decimal::from(10_000),
    );

    let pos = seed_position(&rig, "market-d", "100", "0.50", PositionStatus::Closing).await;
    // 40 visible → 10 per chunk → ten chunks if left alone.
    rig.exchange
        .set_order_book("market-d", book(&[("0.48", "40")], &[]))
        .await;

    let handle = rig.executor.try_claim(pos.id, Side::Sell).await.unwrap();
    let req = PlanRequest {
        position_id: pos.id,
        wallet: pos.wallet.clone(),
        market_id: pos.market_id.clone(),
        side: Side::Sell,
        target_delta: pos.owned_size,
        limit_price: Decimal::new(40, 2),
    };

    let executor = rig.executor.clone();
    let task = {
        let req = req.clone();
        let handle = handle.clone();
        tokio::spawn(async move { executor.execute(&req, &handle).await })
    };

    // Let at least one chunk fill, then cancel between chunks.
    for _ in 0..1_000 {
        let sells = rig
            .exchange
            .placed_orders()
            .await
            .iter()
            .filter(|o| o.side == Side::Sell)
            .count();
        if sells >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.cancel();

    let report = task.await.unwrap();
    rig.executor.release(pos.id).await;

    assert_eq!(report.outcome, PlanOutcome::Cancelled);
    assert!(report.filled_size > Decimal::ZERO);
    assert!(report.filled_size < Decimal::from(100));

    // The ledger reflects exactly what filled, nothing more.
    let after = rig.ledger.get_by_id(pos.id).await.unwrap();
    assert_eq!(after.owned_size, Decimal::from(100) - report.filled_size);
}

#[tokio::test]
async fn exhausted_submissions_abort_the_chunk_but_keep_the_plan_state() {
    let rig = rig();
    let pos = seed_position(&rig, "market-e", "100", "0.50", PositionStatus::Closing).await;
    rig.exchange
        .set_order_book("market-e", book(&[("0.48", "400")], &[]))
        .await;

    // Every submission attempt fails (max_chunk_attempts = 4).
    for _ in 0..4 {
        rig.exchange
            .inject_order_failure(ExchangeError::Transient("exchange flapping".into()))
            .await;
    }

    let handle = rig.executor.try_claim(pos.id, Side::Sell).await.unwrap();
    let report = rig
        .executor
        .execute(
            &PlanRequest {
                position_id: pos.id,
                wallet: pos.wallet.clone(),
                market_id: pos.market_id.clone(),
                side: Side::Sell,
                target_delta: pos.owned_size,
                limit_price: Decimal::new(40, 2),
            },
            &handle,
        )
        .await;
    rig.executor.release(pos.id).await;

    assert_eq!(report.outcome, PlanOutcome::ChunkFailed);
    assert_eq!(report.filled_size, Decimal::ZERO);

    // owned_size untouched — the remaining plan is preserved for a retry.
    let after = rig.ledger.get_by_id(pos.id).await.unwrap();
    assert_eq!(after.owned_size, Decimal::from(100));
    assert_eq!(after.status, PositionStatus::Closing);
}

#[tokio::test]
async fn transient_failures_within_budget_still_fill() {
    let rig = rig();
    let pos = seed_position(&rig, "market-f", "20", "0.50", PositionStatus::Closing).await;
    rig.exchange
        .set_order_book("market-f", book(&[("0.48", "80")], &[]))
        .await;

    // Two failures, then success on the third attempt.
    for _ in 0..2 {
        rig.exchange
            .inject_order_failure(ExchangeError::Transient("exchange flapping".into()))
            .await;
    }

    let handle = rig.executor.try_claim(pos.id, Side::Sell).await.unwrap();
    let report = rig
        .executor
        .execute(
            &PlanRequest {
                position_id: pos.id,
                wallet: pos.wallet.clone(),
                market_id: pos.market_id.clone(),
                side: Side::Sell,
                target_delta: pos.owned_size,
                limit_price: Decimal::new(40, 2),
            },
            &handle,
        )
        .await;
    rig.executor.release(pos.id).await;

    assert_eq!(report.outcome, PlanOutcome::Completed);
    assert_eq!(report.filled_size, Decimal::from(20));
}
