mod common;

use std::time::Duration;

use rust_decimal::Decimal;

use mirrorbot::engine::{evaluate_pass, ExitReason, RiskLoopConfig};
use mirrorbot::models::{PositionStatus, Side};

use common::*;

fn fast_risk_config() -> RiskLoopConfig {
    RiskLoopConfig {
        interval: Duration::from_millis(10),
        io_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn stop_loss_fires_exactly_at_the_boundary() {
    let rig = rig();
    let pos = seed_position(&rig, "market-a", "100", "0.50", PositionStatus::Open).await;

    // Entry 0.50, stop-loss 20% → a 0.40 mark is exactly on the boundary.
    rig.exchange
        .set_order_book("market-a", book(&[("0.40", "800")], &[]))
        .await;

    let directives = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    assert_eq!(directives.len(), 1);
    assert_eq!(directives[0].reason, ExitReason::StopLoss);
    assert_eq!(directives[0].roi, Decimal::new(-20, 2));

    // While the close is in flight (or already done) the next pass must not
    // emit a second directive for the same crossing.
    let again = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    assert!(again.is_empty());

    wait_for_plan_end(&rig, pos.id).await;

    // Stop-loss dumped the entire position.
    assert!(rig.ledger.get_by_id(pos.id).await.is_none());
    let sold: Decimal = rig
        .exchange
        .placed_orders()
        .await
        .iter()
        .filter(|o| o.side == Side::Sell)
        .map(|o| o.size)
        .sum();
    assert_eq!(sold, Decimal::from(100));
}

#[tokio::test]
async fn take_profit_fires_at_its_boundary() {
    let rig = rig();
    let pos = seed_position(&rig, "market-a", "100", "0.50", PositionStatus::Open).await;

    // Take-profit 90% → 0.95 mark is exactly on the boundary.
    rig.exchange
        .set_order_book("market-a", book(&[("0.95", "800")], &[]))
        .await;

    let directives = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    assert_eq!(directives.len(), 1);
    assert_eq!(directives[0].reason, ExitReason::TakeProfit);

    wait_for_plan_end(&rig, pos.id).await;
    assert!(rig.ledger.get_by_id(pos.id).await.is_none());
}

#[tokio::test]
async fn within_thresholds_nothing_happens() {
    let rig = rig();
    let pos = seed_position(&rig, "market-a", "100", "0.50", PositionStatus::Open).await;
    rig.exchange
        .set_order_book("market-a", book(&[("0.45", "800")], &[]))
        .await;

    let directives = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    assert!(directives.is_empty());

    let after = rig.ledger.get_by_id(pos.id).await.unwrap();
    assert_eq!(after.status, PositionStatus::Open);
    assert_eq!(after.owned_size, Decimal::from(100));
}

#[tokio::test]
async fn missing_market_data_skips_the_position_for_the_cycle() {
    let rig = rig();
    let pos = seed_position(&rig, "market-a", "100", "0.50", PositionStatus::Open).await;
    // No book scripted → no bids → stale data.

    let directives = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    assert!(directives.is_empty());

    let after = rig.ledger.get_by_id(pos.id).await.unwrap();
    assert_eq!(after.status, PositionStatus::Open);
    assert!(!rig.engine.has_active_plan(pos.id).await);
}

#[tokio::test]
async fn interrupted_close_resumes_for_exactly_the_remaining_size() {
    let rig = rig();

    // A crash left this position CLOSING with 37.5 still owned and no plan
    // in flight. The ledger's owned_size is the source of truth.
    let pos = seed_position(&rig, "market-a", "37.5", "0.50", PositionStatus::Closing).await;
    rig.exchange
        .set_order_book("market-a", book(&[("0.48", "400")], &[]))
        .await;

    let directives = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    // Resumes are repairs, not fresh threshold crossings.
    assert!(directives.is_empty());

    wait_for_plan_end(&rig, pos.id).await;

    // Sold exactly what was left — not the original plan's target.
    let sold: Decimal = rig
        .exchange
        .placed_orders()
        .await
        .iter()
        .filter(|o| o.side == Side::Sell)
        .map(|o| o.size)
        .sum();
    assert_eq!(sold, Decimal::new(375, 1));
    assert!(rig.ledger.get_by_id(pos.id).await.is_none());
}

#[tokio::test]
async fn flagged_positions_are_left_for_the_operator() {
    let rig = rig();
    let seeded = seed_position(&rig, "market-a", "100", "0.50", PositionStatus::Closing).await;

    let mut flagged = seeded.clone();
    let expected = flagged.version;
    flagged.needs_review = true;
    rig.ledger.upsert(flagged, expected).await.unwrap();

    rig.exchange
        .set_order_book("market-a", book(&[("0.40", "800")], &[]))
        .await;

    let directives = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    assert!(directives.is_empty());
    assert!(!rig.engine.has_active_plan(seeded.id).await);
}

#[tokio::test]
async fn halted_engine_still_evaluates_but_places_nothing() {
    let rig = rig();
    let pos = seed_position(&rig, "market-a", "100", "0.50", PositionStatus::Open).await;
    rig.exchange
        .set_order_book("market-a", book(&[("0.40", "800")], &[]))
        .await;
    rig.halt.store(true, std::sync::atomic::Ordering::Relaxed);

    // The crossing is still observed and logged…
    let directives = evaluate_pass(&rig.engine, rig.exchange.as_ref(), &fast_risk_config()).await;
    assert_eq!(directives.len(), 1);

    // …but no plan was created and nothing was sold.
    assert!(!rig.engine.has_active_plan(pos.id).await);
    let sells = rig
        .exchange
        .placed_orders()
        .await
        .iter()
        .filter(|o| o.side == Side::Sell)
        .count();
    assert_eq!(sells, 0);
}
