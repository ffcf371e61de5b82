use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::exchange::ExchangePort;
use crate::models::PositionStatus;

use super::decision::{DecisionEngine, ExitReason};

#[derive(Debug, Clone)]
pub struct RiskLoopConfig {
    /// Pause between evaluation passes.
    pub interval: Duration,
    /// Per-call timeout on order-book reads.
    pub io_timeout: Duration,
}

impl Default for RiskLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// A threshold crossing the loop acted on.
#[derive(Debug, Clone)]
pub struct ExitDirective {
    pub position_id: Uuid,
    pub reason: ExitReason,
    pub roi: Decimal,
    pub mark_price: Decimal,
}

/// Run the protective-exit loop until shutdown. Each pass re-reads the
/// ledger, marks every open position against the current best bid, and
/// requests a full close when ROI crosses a stop-loss or take-profit
/// threshold. Closing positions with no in-flight plan are re-driven, which
/// makes the loop self-healing after a crash.
pub async fn run_risk_loop(
    engine: Arc<DecisionEngine>,
    exchange: Arc<dyn ExchangePort>,
    config: RiskLoopConfig,
    shutdown: Arc<AtomicBool>,
) {
    let mut ticker = interval(config.interval);
    tracing::info!(interval_secs = config.interval.as_secs(), "Risk loop started");

    loop {
        ticker.tick().await;

        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        evaluate_pass(&engine, exchange.as_ref(), &config).await;
    }

    tracing::info!("Risk loop stopped");
}

/// One evaluation pass over every open/closing position. Returns the
/// directives that were emitted, for observability and tests.
pub async fn evaluate_pass(
    engine: &Arc<DecisionEngine>,
    exchange: &dyn ExchangePort,
    config: &RiskLoopConfig,
) -> Vec<ExitDirective> {
    let positions = engine.ledger().list_open_or_closing().await;
    gauge!("open_positions").set(positions.len() as f64);
    gauge!("budget_committed").set(
        engine
            .ledger()
            .total_budget_committed()
            .await
            .to_f64()
            .unwrap_or(0.0),
    );

    // Mark the account balance each pass; read-only, failures are noise.
    match timeout(config.io_timeout, exchange.get_balance()).await {
        Ok(Ok(balance)) => {
            gauge!("exchange_balance").set(balance.to_f64().unwrap_or(0.0));
        }
        Ok(Err(e)) => tracing::debug!(error = %e, "Balance fetch failed"),
        Err(_) => tracing::debug!("Balance fetch timed out"),
    }

    let mut directives = Vec::new();

    for snapshot in &positions {
        // Re-read: a plan may have updated the position since the listing.
        let Some(pos) = engine.ledger().get_by_id(snapshot.id).await else {
            continue;
        };

        if pos.needs_review {
            tracing::debug!(position_id = %pos.id, "Position awaiting manual review — skipping");
            continue;
        }

        if engine.has_active_plan(pos.id).await {
            tracing::debug!(position_id = %pos.id, "Plan in flight — skipping");
            continue;
        }

        let mark = match timeout(config.io_timeout, exchange.get_order_book(&pos.market_id)).await
        {
            Ok(Ok(book)) => book.best_bid(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, market = %pos.market_id, "Order book fetch failed");
                None
            }
            Err(_) => {
                tracing::warn!(market = %pos.market_id, "Order book fetch timed out");
                None
            }
        };

        // No fresh price → stale market data: skip this cycle, don't fail.
        let Some(bid) = mark else {
            counter!("stale_market_data_total").increment(1);
            tracing::debug!(
                position_id = %pos.id,
                market = %pos.market_id,
                "No fresh price — skipped this cycle"
            );
            continue;
        };

        if pos.status == PositionStatus::Closing {
            // Interrupted close-out (e.g. after a restart): re-request a plan
            // for exactly what is still owned.
            tracing::info!(
                position_id = %pos.id,
                market = %pos.market_id,
                remaining = %pos.owned_size,
                "Resuming interrupted close"
            );
            if let Err(e) = engine
                .request_close(pos.id, ExitReason::Resume, Some(bid))
                .await
            {
                tracing::error!(error = %e, position_id = %pos.id, "Failed to resume close");
            }
            continue;
        }

        let Some(roi) = pos.roi(bid) else {
            continue;
        };

        let reason = if roi <= -pos.stop_loss_pct {
            Some(ExitReason::StopLoss)
        } else if roi >= pos.take_profit_pct {
            Some(ExitReason::TakeProfit)
        } else {
            None
        };

        let Some(reason) = reason else {
            tracing::debug!(
                position_id = %pos.id,
                market = %pos.market_id,
                entry = %pos.avg_entry_price,
                mark = %bid,
                roi = %roi,
                "Position within thresholds"
            );
            continue;
        };

        counter!("exit_directives_total").increment(1);
        tracing::warn!(
            position_id = %pos.id,
            market = %pos.market_id,
            entry = %pos.avg_entry_price,
            mark = %bid,
            roi = %roi,
            reason = reason.as_str(),
            "Threshold crossed — closing position"
        );

        directives.push(ExitDirective {
            position_id: pos.id,
            reason,
            roi,
            mark_price: bid,
        });

        if let Err(e) = engine.request_close(pos.id, reason, Some(bid)).await {
            tracing::error!(error = %e, position_id = %pos.id, "Failed to request close");
        }
    }

    directives
}
