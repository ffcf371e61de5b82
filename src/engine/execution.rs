use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::exchange::{floor_to_tick, ExchangePort, OrderBook};
use crate::ledger::{LedgerError, PositionLedger};
use crate::models::Side;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Fraction of visible depth one chunk may consume (bounds slippage).
    pub liquidity_fraction: Decimal,
    /// How many book levels count as "visible" depth.
    pub depth_levels: usize,
    /// Pause between chunks so we don't move the market against ourselves.
    pub chunk_cooldown: Duration,
    /// Consecutive empty-book/zero-bound rounds before the plan stalls.
    pub max_illiquid_retries: u32,
    /// Base delay when the book has no usable liquidity.
    pub illiquid_backoff_base: Duration,
    /// Submission attempts per chunk before the plan aborts.
    pub max_chunk_attempts: u32,
    /// Base delay between submission retries.
    pub submit_backoff_base: Duration,
    /// Cap for all exponential backoff delays.
    pub backoff_max: Duration,
    /// Per-call timeout on exchange I/O.
    pub io_timeout: Duration,
    /// Concurrent exchange requests across all plans; the exchange is a
    /// rate-limited resource.
    pub max_concurrent_requests: usize,
    /// How far above best ask a buy limit may reach.
    pub buy_slippage_allowance: Decimal,
    /// Hard ceiling on any buy limit price.
    pub max_price: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            liquidity_fraction: Decimal::new(25, 2), // 0.25
            depth_levels: 5,
            chunk_cooldown: Duration::from_secs(2),
            max_illiquid_retries: 6,
            illiquid_backoff_base: Duration::from_secs(2),
            max_chunk_attempts: 4,
            submit_backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            io_timeout: Duration::from_secs(10),
            max_concurrent_requests: 4,
            buy_slippage_allowance: Decimal::new(5, 2), // 0.05
            max_price: Decimal::new(99, 2),             // 0.99
        }
    }
}

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// Request for one chunked execution run against a single position.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub position_id: Uuid,
    pub wallet: String,
    pub market_id: String,
    pub side: Side,
    pub target_delta: Decimal,
    /// Price bound for every chunk: sells never fill below it, buys never
    /// above it. Staged budget is computed against this bound, so fills can
    /// never overrun what was committed.
    pub limit_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Filled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub size: Decimal,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    /// The whole target delta filled.
    Completed,
    /// Cancelled between chunks; fills already made stand.
    Cancelled,
    /// No usable liquidity for too many rounds (`ExecutionStalled`).
    Stalled,
    /// Submission retries exhausted on one chunk; the rest of the plan is
    /// preserved for a later re-trigger (`ChunkExecutionFailed`).
    ChunkFailed,
    /// Fatal auth failure; the engine stops creating plans.
    Halted,
}

/// What actually happened over the life of one plan.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub position_id: Uuid,
    pub side: Side,
    pub target_delta: Decimal,
    pub filled_size: Decimal,
    pub filled_cost: Decimal,
    pub chunks: Vec<ChunkRecord>,
    pub outcome: PlanOutcome,
}

/// Cooperative cancellation handle for an in-flight plan. Checked between
/// chunks only; an in-flight chunk always runs to its confirmation.
#[derive(Debug, Clone, Default)]
pub struct PlanHandle {
    cancelled: Arc<AtomicBool>,
}

impl PlanHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Chunk planning
// ---------------------------------------------------------------------------

/// Size and limit price for the next chunk, or `None` when the book offers
/// nothing usable this round.
fn plan_chunk(
    config: &ExecutionConfig,
    book: &OrderBook,
    side: Side,
    bound_price: Decimal,
    remaining: Decimal,
) -> Option<(Decimal, Decimal)> {
    match side {
        Side::Sell => {
            let visible: Decimal = book
                .bids
                .iter()
                .filter(|l| l.price >= bound_price)
                .take(config.depth_levels)
                .map(|l| l.size)
                .sum();
            let bound = floor_to_tick(visible * config.liquidity_fraction);
            let size = floor_to_tick(remaining.min(bound));
            if size.is_zero() {
                return None;
            }
            Some((size, bound_price))
        }
        Side::Buy => {
            let best_ask = book.best_ask()?;
            let limit = (best_ask + config.buy_slippage_allowance)
                .min(config.max_price)
                .min(bound_price);
            let visible: Decimal = book
                .asks
                .iter()
                .filter(|l| l.price <= limit)
                .take(config.depth_levels)
                .map(|l| l.size)
                .sum();
            let bound = floor_to_tick(visible * config.liquidity_fraction);
            let size = floor_to_tick(remaining.min(bound));
            if size.is_zero() {
                return None;
            }
            Some((size, limit))
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    (base * 2u32.saturating_pow(attempt)).min(max)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Chunked order executor. Realizes a target size delta as a sequence of
/// liquidity-bounded market-safe orders, one cooldown apart, and is the only
/// writer of `owned_size`/`budget_committed` while a plan is in flight.
pub struct DripExecutor {
    exchange: Arc<dyn ExchangePort>,
    ledger: Arc<PositionLedger>,
    config: ExecutionConfig,
    halt: Arc<AtomicBool>,
    plans: Mutex<HashMap<Uuid, (Side, PlanHandle)>>,
    /// Caps in-flight exchange requests across all plans.
    io_slots: Semaphore,
}

impl DripExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangePort>,
        ledger: Arc<PositionLedger>,
        config: ExecutionConfig,
        halt: Arc<AtomicBool>,
    ) -> Self {
        let io_slots = Semaphore::new(config.max_concurrent_requests);
        Self {
            exchange,
            ledger,
            config,
            halt,
            plans: Mutex::new(HashMap::new()),
            io_slots,
        }
    }

    /// Claim the single plan slot for a position. `None` means a plan is
    /// already in flight and the new request must merge or be rejected.
    pub async fn try_claim(&self, position_id: Uuid, side: Side) -> Option<PlanHandle> {
        let mut plans = self.plans.lock().await;
        if plans.contains_key(&position_id) {
            return None;
        }
        let handle = PlanHandle::default();
        plans.insert(position_id, (side, handle.clone()));
        Some(handle)
    }

    /// Release a position's plan slot once its run is fully finalized.
    pub async fn release(&self, position_id: Uuid) {
        self.plans.lock().await.remove(&position_id);
    }

    /// Request cooperative cancellation of an in-flight plan.
    pub async fn cancel_plan(&self, position_id: Uuid) -> bool {
        match self.plans.lock().await.get(&position_id) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn has_active_plan(&self, position_id: Uuid) -> bool {
        self.plans.lock().await.contains_key(&position_id)
    }

    /// Side of the plan currently holding a position's slot, if any.
    pub async fn active_plan_side(&self, position_id: Uuid) -> Option<Side> {
        self.plans.lock().await.get(&position_id).map(|(side, _)| *side)
    }

    /// Run one plan to a terminal outcome. The caller must have claimed the
    /// plan slot and releases it after handling the report.
    pub async fn execute(&self, req: &PlanRequest, handle: &PlanHandle) -> ExecutionReport {
        let started = Instant::now();
        let mut remaining = floor_to_tick(req.target_delta);
        let mut chunks: Vec<ChunkRecord> = Vec::new();
        let mut filled_size = Decimal::ZERO;
        let mut filled_cost = Decimal::ZERO;
        let mut illiquid_rounds: u32 = 0;
        let mut outcome = PlanOutcome::Completed;

        counter!("plans_started").increment(1);
        tracing::info!(
            position_id = %req.position_id,
            market = %req.market_id,
            side = %req.side,
            target = %remaining,
            "Drip plan started"
        );

        'plan: while remaining > Decimal::ZERO {
            if handle.is_cancelled() {
                outcome = PlanOutcome::Cancelled;
                break;
            }
            if self.halt.load(Ordering::Relaxed) {
                outcome = PlanOutcome::Halted;
                break;
            }

            // 1. Order-book depth, with a per-call timeout. Failures here
            //    count against the stall budget rather than aborting.
            let permit = self.io_slots.acquire().await.ok();
            let book = match timeout(
                self.config.io_timeout,
                self.exchange.get_order_book(&req.market_id),
            )
            .await
            {
                Ok(Ok(book)) => Some(book),
                Ok(Err(e)) if e.is_fatal() => {
                    tracing::error!(error = %e, market = %req.market_id, "Fatal exchange error — halting");
                    self.halt.store(true, Ordering::Relaxed);
                    outcome = PlanOutcome::Halted;
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, market = %req.market_id, "Order book fetch failed");
                    None
                }
                Err(_) => {
                    tracing::warn!(market = %req.market_id, "Order book fetch timed out");
                    None
                }
            };
            drop(permit);

            // 2. Liquidity-bounded chunk size.
            let planned = book.as_ref().and_then(|b| {
                plan_chunk(&self.config, b, req.side, req.limit_price, remaining)
            });

            let Some((chunk_size, limit_price)) = planned else {
                // 3. Illiquid round: back off, bounded.
                illiquid_rounds += 1;
                if illiquid_rounds > self.config.max_illiquid_retries {
                    tracing::warn!(
                        position_id = %req.position_id,
                        market = %req.market_id,
                        remaining = %remaining,
                        "Drip plan stalled — no usable liquidity"
                    );
                    counter!("plans_stalled").increment(1);
                    outcome = PlanOutcome::Stalled;
                    break;
                }
                sleep(backoff_delay(
                    self.config.illiquid_backoff_base,
                    illiquid_rounds - 1,
                    self.config.backoff_max,
                ))
                .await;
                continue;
            };
            illiquid_rounds = 0;

            // 4. Submit, with bounded exponential backoff per attempt.
            let mut attempt: u32 = 0;
            let fill = 'submit: loop {
                let permit = self.io_slots.acquire().await.ok();
                let submitted = timeout(
                    self.config.io_timeout,
                    self.exchange
                        .place_order(&req.market_id, req.side, chunk_size, limit_price),
                )
                .await;
                drop(permit);

                match submitted {
                    Ok(Ok(result)) if result.filled_size > Decimal::ZERO => {
                        break 'submit Some(result);
                    }
                    Ok(Ok(_)) => {
                        tracing::warn!(
                            market = %req.market_id,
                            size = %chunk_size,
                            "Order confirmed with zero fill"
                        );
                    }
                    Ok(Err(e)) if e.is_fatal() => {
                        tracing::error!(error = %e, market = %req.market_id, "Fatal exchange error — halting");
                        self.halt.store(true, Ordering::Relaxed);
                        outcome = PlanOutcome::Halted;
                        break 'submit None;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            error = %e,
                            market = %req.market_id,
                            attempt = attempt + 1,
                            "Chunk submission failed"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            market = %req.market_id,
                            attempt = attempt + 1,
                            "Chunk submission timed out"
                        );
                    }
                }

                attempt += 1;
                if attempt >= self.config.max_chunk_attempts {
                    counter!("chunks_failed").increment(1);
                    chunks.push(ChunkRecord {
                        size: chunk_size,
                        price: limit_price,
                        filled_at: Utc::now(),
                        status: ChunkStatus::Failed,
                    });
                    outcome = PlanOutcome::ChunkFailed;
                    break 'submit None;
                }
                sleep(backoff_delay(
                    self.config.submit_backoff_base,
                    attempt - 1,
                    self.config.backoff_max,
                ))
                .await;
            };

            let Some(fill) = fill else {
                break 'plan;
            };

            // Confirmed fill: only now do sizes move.
            let fill_size = fill.filled_size.min(chunk_size);
            filled_size += fill_size;
            filled_cost += fill_size * fill.avg_price;
            remaining -= fill_size;
            chunks.push(ChunkRecord {
                size: fill_size,
                price: fill.avg_price,
                filled_at: Utc::now(),
                status: ChunkStatus::Filled,
            });
            counter!("chunks_filled").increment(1);

            tracing::info!(
                position_id = %req.position_id,
                market = %req.market_id,
                chunk = chunks.len(),
                size = %fill_size,
                price = %fill.avg_price,
                remaining = %remaining,
                "Chunk filled"
            );

            self.apply_fill(req, fill_size, fill.avg_price).await;

            // 5. Cooldown before the next chunk.
            if remaining > Decimal::ZERO {
                sleep(self.config.chunk_cooldown).await;
            }
        }

        histogram!("plan_duration_seconds").record(started.elapsed().as_secs_f64());
        if outcome == PlanOutcome::Completed {
            counter!("plans_completed").increment(1);
            tracing::info!(
                position_id = %req.position_id,
                market = %req.market_id,
                filled = %filled_size,
                chunks = chunks.len(),
                "Drip plan completed"
            );
        } else {
            tracing::warn!(
                position_id = %req.position_id,
                market = %req.market_id,
                outcome = ?outcome,
                filled = %filled_size,
                target = %req.target_delta,
                "Drip plan ended early"
            );
        }

        ExecutionReport {
            position_id: req.position_id,
            side: req.side,
            target_delta: req.target_delta,
            filled_size,
            filled_cost,
            chunks,
            outcome,
        }
    }

    /// Fold one confirmed fill into the position. Version conflicts mean a
    /// concurrent staging write landed; re-read and reapply, bounded.
    async fn apply_fill(&self, req: &PlanRequest, fill_size: Decimal, fill_price: Decimal) {
        for _ in 0..8 {
            let Some(mut pos) = self.ledger.get_by_id(req.position_id).await else {
                tracing::error!(position_id = %req.position_id, "Position vanished mid-plan");
                return;
            };
            let expected = pos.version;

            match req.side {
                Side::Buy => {
                    let new_size = pos.owned_size + fill_size;
                    pos.avg_entry_price = (pos.avg_entry_price * pos.owned_size
                        + fill_price * fill_size)
                        / new_size;
                    pos.owned_size = new_size;
                }
                Side::Sell => {
                    let entry_cost = pos.avg_entry_price * fill_size;
                    pos.realized_pnl += (fill_price - pos.avg_entry_price) * fill_size;
                    pos.owned_size = (pos.owned_size - fill_size).max(Decimal::ZERO);
                    pos.budget_committed =
                        (pos.budget_committed - entry_cost).max(Decimal::ZERO);
                }
            }

            match self.ledger.upsert(pos, expected).await {
                Ok(_) => return,
                Err(LedgerError::VersionConflict { .. }) => continue,
                Err(e) => {
                    tracing::error!(error = %e, position_id = %req.position_id, "Failed to persist fill");
                    return;
                }
            }
        }
        tracing::error!(
            position_id = %req.position_id,
            "Giving up on fill persistence after repeated version conflicts"
        );
    }
}
