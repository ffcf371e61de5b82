use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::exchange::floor_to_tick;
use crate::ledger::{LedgerError, PositionLedger};
use crate::models::{Position, PositionStatus, Side, TradeEvent, WalletTarget};

use super::execution::{DripExecutor, ExecutionReport, PlanHandle, PlanOutcome, PlanRequest};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Total budget committable across all open/closing positions.
    pub global_budget_cap: Decimal,
    /// Budget committable to any single position.
    pub max_position_budget: Decimal,
    pub default_stop_loss_pct: Decimal,
    pub default_take_profit_pct: Decimal,
    /// How far above the observed price a staged buy may fill.
    pub buy_slippage_allowance: Decimal,
    /// Hard ceiling on any buy limit price.
    pub max_price: Decimal,
    /// Absolute floor for forced exits (stop-loss dumps).
    pub dump_price_floor: Decimal,
    /// Ordinary closes accept fills down to this fraction of the mark.
    pub sell_floor_fraction: Decimal,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            global_budget_cap: Decimal::from(1_000),
            max_position_budget: Decimal::from(250),
            default_stop_loss_pct: Decimal::new(20, 2),   // 20%
            default_take_profit_pct: Decimal::new(90, 2), // 90%
            buy_slippage_allowance: Decimal::new(5, 2),
            max_price: Decimal::new(99, 2),
            dump_price_floor: Decimal::new(1, 2),
            sell_floor_fraction: Decimal::new(90, 2), // 0.90
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Outcome of policy evaluation for one signal. These are values, not
/// errors: rejections are logged decisions, and only infrastructure
/// failures surface as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A buy plan was staged and spawned.
    Buy { position_id: Uuid, size: Decimal },
    /// A sell plan was staged and spawned.
    Sell { position_id: Uuid, size: Decimal },
    /// Signal id already processed; event dropped.
    Duplicate,
    /// Budget caps leave no room for this buy.
    BudgetExceeded { needed: Decimal, available: Decimal },
    /// Valid signal, nothing to do.
    Ignored(&'static str),
    /// Position or engine state forbids the action.
    Rejected(&'static str),
}

/// Why a close was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// A closing position with no in-flight plan is being re-driven.
    Resume,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Resume => "resume",
        }
    }
}

type MarketKey = (String, String);

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Portfolio policy: turns signals into staged ledger mutations plus drip
/// plans, and owns plan finalization. Signal handling for the same
/// (wallet, market) is serialized through a keyed mutex; different markets
/// proceed in parallel.
pub struct DecisionEngine {
    ledger: Arc<PositionLedger>,
    executor: Arc<DripExecutor>,
    targets: HashMap<String, WalletTarget>,
    config: DecisionConfig,
    market_locks: Mutex<HashMap<MarketKey, Arc<Mutex<()>>>>,
    /// Whale position per (wallet, market) as observed from the signal
    /// stream; denominator for proportional sell sizing.
    whale_exposure: Mutex<HashMap<MarketKey, Decimal>>,
    /// Serializes budget check + staging across markets; without it two
    /// concurrent buys could both pass the cap check and overcommit.
    budget_gate: Mutex<()>,
    halt: Arc<AtomicBool>,
}

impl DecisionEngine {
    pub fn new(
        ledger: Arc<PositionLedger>,
        executor: Arc<DripExecutor>,
        targets: Vec<WalletTarget>,
        config: DecisionConfig,
        halt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ledger,
            executor,
            targets: targets
                .into_iter()
                .map(|t| (t.address.clone(), t))
                .collect(),
            config,
            market_locks: Mutex::new(HashMap::new()),
            whale_exposure: Mutex::new(HashMap::new()),
            budget_gate: Mutex::new(()),
            halt,
        }
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Relaxed)
    }

    pub async fn has_active_plan(&self, position_id: Uuid) -> bool {
        self.executor.has_active_plan(position_id).await
    }

    /// Evaluate one incoming trade signal.
    pub async fn on_signal(self: &Arc<Self>, event: &TradeEvent) -> anyhow::Result<Decision> {
        // Idempotent ingestion: duplicates are dropped, not errors.
        if !self.ledger.record_signal(&event.signal_id).await? {
            counter!("duplicate_signals_total").increment(1);
            tracing::debug!(
                signal_id = %event.signal_id,
                wallet = %event.source_wallet,
                "Duplicate signal dropped"
            );
            return Ok(Decision::Duplicate);
        }

        let Some(target) = self.targets.get(&event.source_wallet).cloned() else {
            return Ok(Decision::Ignored("wallet not tracked"));
        };

        let reduction_fraction = self.update_whale_exposure(event).await;

        // Serialize per (wallet, market); other markets stay concurrent.
        let lock = self.market_lock(&event.source_wallet, &event.market_id).await;
        let _guard = lock.lock().await;

        let decision = match event.side {
            Side::Buy => self.handle_buy(event, &target).await?,
            Side::Sell => self.handle_sell(event, &target, reduction_fraction).await?,
        };

        tracing::info!(
            wallet = %event.source_wallet,
            market = %event.market_id,
            side = %event.side,
            decision = ?decision,
            "Signal decided"
        );
        Ok(decision)
    }

    /// Request a full close of a position (risk exits and self-healing).
    /// Re-entrant requests merge: while a plan is in flight this is a no-op.
    /// `mark` is the current best bid, when the caller has one; stop-loss
    /// exits dump to the configured floor regardless.
    pub async fn request_close(
        self: &Arc<Self>,
        position_id: Uuid,
        reason: ExitReason,
        mark: Option<Decimal>,
    ) -> anyhow::Result<Decision> {
        let price_floor = match reason {
            ExitReason::StopLoss => self.config.dump_price_floor,
            ExitReason::TakeProfit | ExitReason::Resume => mark
                .map(|m| (m * self.config.sell_floor_fraction).trunc_with_scale(2))
                .filter(|f| *f > Decimal::ZERO)
                .unwrap_or(self.config.dump_price_floor)
                .max(self.config.dump_price_floor),
        };

        let Some(pos) = self.ledger.get_by_id(position_id).await else {
            return Ok(Decision::Ignored("position gone"));
        };

        let lock = self.market_lock(&pos.wallet, &pos.market_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock; the snapshot above may be stale.
        let Some(pos) = self.ledger.get(&pos.wallet, &pos.market_id).await else {
            return Ok(Decision::Ignored("position gone"));
        };
        if pos.id != position_id {
            return Ok(Decision::Ignored("position was replaced"));
        }
        if pos.needs_review {
            return Ok(Decision::Rejected("position flagged for manual review"));
        }

        if pos.owned_size.is_zero() {
            // Nothing left to sell; make sure the state machine lands.
            if pos.status == PositionStatus::Closing && !self.executor.has_active_plan(pos.id).await
            {
                self.archive_position(&pos).await;
            }
            return Ok(Decision::Ignored("nothing left to close"));
        }

        if self.is_halted() {
            tracing::warn!(
                position_id = %position_id,
                reason = reason.as_str(),
                "Exit directive logged but engine is halted — no order placed"
            );
            return Ok(Decision::Rejected("engine halted"));
        }

        let Some(handle) = self.executor.try_claim(pos.id, Side::Sell).await else {
            return Ok(Decision::Ignored("close already in flight"));
        };

        let pos = match self.transition_closing(&pos.wallet, &pos.market_id).await {
            Ok(pos) => pos,
            Err(e) => {
                self.executor.release(position_id).await;
                return Err(e.into());
            }
        };

        let size = pos.owned_size;
        tracing::info!(
            position_id = %pos.id,
            market = %pos.market_id,
            reason = reason.as_str(),
            size = %size,
            floor = %price_floor,
            "Close plan requested"
        );

        self.spawn_plan(
            PlanRequest {
                position_id: pos.id,
                wallet: pos.wallet.clone(),
                market_id: pos.market_id.clone(),
                side: Side::Sell,
                target_delta: size,
                limit_price: price_floor,
            },
            handle,
            Decimal::ZERO,
        );

        Ok(Decision::Sell {
            position_id: pos.id,
            size,
        })
    }

    // -- signal handlers ----------------------------------------------------

    async fn handle_buy(
        self: &Arc<Self>,
        event: &TradeEvent,
        target: &WalletTarget,
    ) -> anyhow::Result<Decision> {
        if self.is_halted() {
            return Ok(Decision::Rejected("engine halted"));
        }

        let size = floor_to_tick(event.size * target.mirror_ratio);
        if size.is_zero() {
            return Ok(Decision::Ignored("mirror size rounds to zero"));
        }

        // Stage budget at the worst price a chunk may fill at, so confirmed
        // fills can never overrun the committed amount.
        let price_cap = (event.price + self.config.buy_slippage_allowance).min(self.config.max_price);
        let cost = size * price_cap;

        let existing = self.ledger.get(&event.source_wallet, &event.market_id).await;

        if let Some(pos) = &existing {
            if pos.status == PositionStatus::Closing {
                return Ok(Decision::Rejected("position closing — buys rejected"));
            }
        }

        // Check and stage under one gate so parallel buys in other markets
        // can't overcommit the shared caps between our check and our write.
        let _budget = self.budget_gate.lock().await;

        if let Some(decision) = self
            .check_budget(target, existing.as_ref().map(|p| p.budget_committed), cost)
            .await
        {
            return Ok(decision);
        }

        match existing {
            Some(pos) => {
                // Top-up buy on an open position.
                let Some(handle) = self.executor.try_claim(pos.id, Side::Buy).await else {
                    return Ok(Decision::Rejected("plan already in flight"));
                };
                let staged = match self.stage_buy_budget(&pos.wallet, &pos.market_id, cost).await {
                    Ok(p) => p,
                    Err(e) => {
                        self.executor.release(pos.id).await;
                        return Err(e.into());
                    }
                };
                self.spawn_plan(
                    PlanRequest {
                        position_id: staged.id,
                        wallet: staged.wallet.clone(),
                        market_id: staged.market_id.clone(),
                        side: Side::Buy,
                        target_delta: size,
                        limit_price: price_cap,
                    },
                    handle,
                    cost,
                );
                Ok(Decision::Buy {
                    position_id: staged.id,
                    size,
                })
            }
            None => {
                let mut pos = Position::open(
                    &event.source_wallet,
                    &event.market_id,
                    self.config.default_stop_loss_pct,
                    self.config.default_take_profit_pct,
                );
                pos.budget_committed = cost;
                let saved = self.ledger.upsert(pos, 0).await?;

                let Some(handle) = self.executor.try_claim(saved.id, Side::Buy).await else {
                    return Ok(Decision::Rejected("plan already in flight"));
                };

                self.spawn_plan(
                    PlanRequest {
                        position_id: saved.id,
                        wallet: saved.wallet.clone(),
                        market_id: saved.market_id.clone(),
                        side: Side::Buy,
                        target_delta: size,
                        limit_price: price_cap,
                    },
                    handle,
                    cost,
                );
                Ok(Decision::Buy {
                    position_id: saved.id,
                    size,
                })
            }
        }
    }

    async fn handle_sell(
        self: &Arc<Self>,
        event: &TradeEvent,
        target: &WalletTarget,
        reduction_fraction: Option<Decimal>,
    ) -> anyhow::Result<Decision> {
        let Some(pos) = self.ledger.get(&event.source_wallet, &event.market_id).await else {
            return Ok(Decision::Ignored("no mirrored position"));
        };

        // Size to the whale's observed reduction; without an observed
        // denominator (cold start) fall back to mirror-ratio sizing. Never
        // forces the position below zero.
        let proposed = match reduction_fraction {
            Some(fraction) => pos.owned_size * fraction,
            None => event.size * target.mirror_ratio,
        };
        let size = floor_to_tick(proposed.min(pos.owned_size));
        if size.is_zero() {
            return Ok(Decision::Ignored("sell size rounds to zero"));
        }

        if self.is_halted() {
            return Ok(Decision::Rejected("engine halted"));
        }

        let Some(handle) = self.executor.try_claim(pos.id, Side::Sell).await else {
            // Whale reversed against an in-flight buy: stop buying. A
            // concurrent close just merges.
            if self.executor.active_plan_side(pos.id).await == Some(Side::Buy) {
                self.executor.cancel_plan(pos.id).await;
                return Ok(Decision::Rejected("whale reversed — buy plan cancelled"));
            }
            return Ok(Decision::Ignored("close already in flight"));
        };

        let pos = match self.transition_closing(&pos.wallet, &pos.market_id).await {
            Ok(pos) => pos,
            Err(e) => {
                self.executor.release(pos.id).await;
                return Err(e.into());
            }
        };

        let floor = (event.price * self.config.sell_floor_fraction)
            .trunc_with_scale(2)
            .max(self.config.dump_price_floor);

        self.spawn_plan(
            PlanRequest {
                position_id: pos.id,
                wallet: pos.wallet.clone(),
                market_id: pos.market_id.clone(),
                side: Side::Sell,
                target_delta: size,
                limit_price: floor,
            },
            handle,
            Decimal::ZERO,
        );

        Ok(Decision::Sell {
            position_id: pos.id,
            size,
        })
    }

    // -- helpers ------------------------------------------------------------

    /// Track observed whale exposure. For sells, returns the fraction of the
    /// whale's position this sale reduced, when a denominator is known.
    async fn update_whale_exposure(&self, event: &TradeEvent) -> Option<Decimal> {
        let key = (event.source_wallet.clone(), event.market_id.clone());
        let mut exposure = self.whale_exposure.lock().await;
        let prev = exposure.get(&key).copied().unwrap_or(Decimal::ZERO);
        match event.side {
            Side::Buy => {
                exposure.insert(key, prev + event.size);
                None
            }
            Side::Sell => {
                exposure.insert(key, (prev - event.size).max(Decimal::ZERO));
                if prev > Decimal::ZERO {
                    Some((event.size / prev).min(Decimal::ONE))
                } else {
                    None
                }
            }
        }
    }

    async fn check_budget(
        &self,
        target: &WalletTarget,
        position_committed: Option<Decimal>,
        cost: Decimal,
    ) -> Option<Decision> {
        let total = self.ledger.total_budget_committed().await;
        if total + cost > self.config.global_budget_cap {
            counter!("budget_rejections_total").increment(1);
            let available = (self.config.global_budget_cap - total).max(Decimal::ZERO);
            tracing::warn!(
                wallet = %target.address,
                needed = %cost,
                available = %available,
                "Global budget cap reached — buy rejected"
            );
            return Some(Decision::BudgetExceeded {
                needed: cost,
                available,
            });
        }

        if let Some(cap) = target.budget_cap {
            let wallet_total = self.ledger.budget_committed_for(&target.address).await;
            if wallet_total + cost > cap {
                counter!("budget_rejections_total").increment(1);
                let available = (cap - wallet_total).max(Decimal::ZERO);
                tracing::warn!(
                    wallet = %target.address,
                    needed = %cost,
                    available = %available,
                    "Per-wallet budget cap reached — buy rejected"
                );
                return Some(Decision::BudgetExceeded {
                    needed: cost,
                    available,
                });
            }
        }

        let committed = position_committed.unwrap_or(Decimal::ZERO);
        if committed + cost > self.config.max_position_budget {
            counter!("budget_rejections_total").increment(1);
            let available = (self.config.max_position_budget - committed).max(Decimal::ZERO);
            tracing::warn!(
                wallet = %target.address,
                needed = %cost,
                available = %available,
                "Position budget cap reached — buy rejected"
            );
            return Some(Decision::BudgetExceeded {
                needed: cost,
                available,
            });
        }

        None
    }

    async fn market_lock(&self, wallet: &str, market_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.market_locks.lock().await;
        locks
            .entry((wallet.to_string(), market_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Add staged budget to an open position, retrying on version conflicts.
    async fn stage_buy_budget(
        &self,
        wallet: &str,
        market_id: &str,
        cost: Decimal,
    ) -> Result<Position, LedgerError> {
        for _ in 0..4 {
            let Some(mut pos) = self.ledger.get(wallet, market_id).await else {
                return Err(LedgerError::Store(anyhow::anyhow!(
                    "position disappeared while staging budget"
                )));
            };
            let expected = pos.version;
            pos.budget_committed += cost;
            match self.ledger.upsert(pos, expected).await {
                Ok(saved) => return Ok(saved),
                Err(LedgerError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Store(anyhow::anyhow!(
            "persistent version conflicts while staging budget"
        )))
    }

    /// Move a position to Closing (idempotent), retrying on conflicts.
    async fn transition_closing(
        &self,
        wallet: &str,
        market_id: &str,
    ) -> Result<Position, LedgerError> {
        for _ in 0..4 {
            let Some(mut pos) = self.ledger.get(wallet, market_id).await else {
                return Err(LedgerError::Store(anyhow::anyhow!(
                    "position disappeared while entering close"
                )));
            };
            if pos.status == PositionStatus::Closing {
                return Ok(pos);
            }
            let expected = pos.version;
            pos.status = PositionStatus::Closing;
            match self.ledger.upsert(pos, expected).await {
                Ok(saved) => return Ok(saved),
                Err(LedgerError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Store(anyhow::anyhow!(
            "persistent version conflicts while entering close"
        )))
    }

    fn spawn_plan(self: &Arc<Self>, request: PlanRequest, handle: PlanHandle, staged_cost: Decimal) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let report = engine.executor.execute(&request, &handle).await;
            engine.finish_plan(&request, staged_cost, &report).await;
            engine.executor.release(request.position_id).await;
        });
    }

    /// Reconcile the position after its plan reached a terminal state.
    async fn finish_plan(&self, request: &PlanRequest, staged_cost: Decimal, report: &ExecutionReport) {
        for _ in 0..8 {
            let Some(mut pos) = self.ledger.get_by_id(request.position_id).await else {
                tracing::warn!(position_id = %request.position_id, "Plan finished for unknown position");
                return;
            };
            let expected = pos.version;

            match request.side {
                Side::Buy => {
                    // Release whatever staged budget the fills never used.
                    let unused = (staged_cost - report.filled_cost).max(Decimal::ZERO);
                    pos.budget_committed = (pos.budget_committed - unused).max(Decimal::ZERO);
                    if pos.owned_size.is_zero() && pos.status == PositionStatus::Open {
                        // Opening plan never filled: archive the empty shell.
                        pos.status = PositionStatus::Closed;
                        pos.closed_at = Some(Utc::now());
                    }
                }
                Side::Sell => {
                    if report.outcome == PlanOutcome::Stalled {
                        pos.needs_review = true;
                        counter!("positions_flagged_total").increment(1);
                    }
                    if pos.owned_size.is_zero() && pos.status == PositionStatus::Closing {
                        pos.status = PositionStatus::Closed;
                        pos.closed_at = Some(Utc::now());
                    }
                }
            }

            match self.ledger.upsert(pos.clone(), expected).await {
                Ok(_) => {
                    tracing::info!(
                        position_id = %request.position_id,
                        market = %request.market_id,
                        outcome = ?report.outcome,
                        filled = %report.filled_size,
                        owned = %pos.owned_size,
                        status = %pos.status,
                        "Plan finalized"
                    );
                    return;
                }
                Err(LedgerError::VersionConflict { .. }) => continue,
                Err(e) => {
                    tracing::error!(error = %e, position_id = %request.position_id, "Failed to finalize plan");
                    return;
                }
            }
        }
        tracing::error!(
            position_id = %request.position_id,
            "Giving up on plan finalization after repeated version conflicts"
        );
    }

    /// Final transition for an empty closing position.
    async fn archive_position(&self, pos: &Position) {
        let mut closed = pos.clone();
        let expected = closed.version;
        closed.status = PositionStatus::Closed;
        closed.closed_at = Some(Utc::now());
        if let Err(e) = self.ledger.upsert(closed, expected).await {
            tracing::warn!(error = %e, position_id = %pos.id, "Failed to archive empty position");
        }
    }
}

// ---------------------------------------------------------------------------
// Signal consumer loop
// ---------------------------------------------------------------------------

/// Drain the signal channel into the decision engine until shutdown.
pub async fn run_decision_loop(
    engine: Arc<DecisionEngine>,
    mut rx: mpsc::Receiver<TradeEvent>,
    shutdown: Arc<AtomicBool>,
) {
    tracing::info!("Decision loop started");

    while let Some(event) = rx.recv().await {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        counter!("trade_events_total").increment(1);
        if let Err(e) = engine.on_signal(&event).await {
            tracing::error!(
                error = %e,
                wallet = %event.source_wallet,
                market = %event.market_id,
                "Signal processing failed"
            );
        }
    }

    tracing::info!("Decision loop stopped");
}
