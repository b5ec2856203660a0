// =============================================================================
// Simple-Y Executor — single-sided range position with timeout / stop-loss
// =============================================================================
//
// State machine:
//
//   Init -> Opening -> InRange <-> OutOfRangeUp/Down -> Recentering
//                                              \-> Closing -> Done | Error
//
//   - above range longer than the upward timeout: close, swap X proceeds
//     back to Y, reopen at the new active bin (recenter),
//   - below range longer than the downward timeout, or past the stop-loss
//     offset for N consecutive ticks: close out with reason stop-loss,
//   - stop-loss always wins a tie against recentering,
//   - re-entering the range fully resets the out-of-range timer.
//
// Locking: internal state sits behind parking_lot mutexes that are never
// held across an await; the scheduler already guarantees ticks for one
// instance never interleave.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::amm::bins::{anchored_range, bin_price, in_range};
use crate::analytics::{LedgerEntry, PositionAnalytics, Snapshot};
use crate::error::{EngineError, ErrorKind};
use crate::events::TOPIC_SMART_STOP_LOSS;
use crate::retry::OpKind;
use crate::strategy::{ExecPhase, ExecutorContext, RecoverOutcome, SimpleYConfig, StrategyExecutor};
use crate::types::{CloseReason, Decision, Pool, Position, PositionSide, StrategyKind};

struct SimpleYState {
    phase: ExecPhase,
    position: Option<Position>,
    out_of_range_since: Option<Instant>,
    stop_loss_strikes: u32,
    close_reason: Option<CloseReason>,
    error_reason: Option<String>,
}

pub struct SimpleYExecutor {
    ctx: ExecutorContext,
    config: SimpleYConfig,
    state: Mutex<SimpleYState>,
    pool: Mutex<Option<Pool>>,
    analytics: Mutex<Option<PositionAnalytics>>,
    /// Ledger restored from storage before the pool (and thus decimals) is
    /// known; applied when analytics is constructed.
    pending_ledger: Mutex<Option<Vec<LedgerEntry>>>,
    last_snapshot: Mutex<Option<Snapshot>>,
}

impl SimpleYExecutor {
    pub fn new(ctx: ExecutorContext, config: SimpleYConfig) -> Self {
        Self {
            ctx,
            config,
            state: Mutex::new(SimpleYState {
                phase: ExecPhase::Init,
                position: None,
                out_of_range_since: None,
                stop_loss_strikes: 0,
                close_reason: None,
                error_reason: None,
            }),
            pool: Mutex::new(None),
            analytics: Mutex::new(None),
            pending_ledger: Mutex::new(None),
            last_snapshot: Mutex::new(None),
        }
    }

    fn cancelled(&self) -> bool {
        *self.ctx.cancel.borrow()
    }

    fn enter_error(&self, reason: String) {
        warn!(instance = %self.ctx.instance_id, reason = %reason, "executor entering error state");
        let mut state = self.state.lock();
        state.phase = ExecPhase::Error;
        state.error_reason = Some(reason);
    }

    /// Load the pool and build the per-instance analyzer once.
    async fn ensure_pool(&self) -> Result<Pool, EngineError> {
        if let Some(pool) = self.pool.lock().clone() {
            return Ok(pool);
        }

        let address = self
            .config
            .pool_address
            .parse()
            .map_err(|e| EngineError::Validation(format!("poolAddress: {e}")))?;
        let pool = self.ctx.amm.read_pool(&address).await?;

        {
            let mut analytics = self.analytics.lock();
            if analytics.is_none() {
                let mut built = PositionAnalytics::new(
                    pool.decimals_x,
                    pool.decimals_y,
                    self.ctx.analytics.clone(),
                );
                if let Some(entries) = self.pending_ledger.lock().take() {
                    built.restore_ledger(entries);
                }
                *analytics = Some(built);
            }
        }
        *self.pool.lock() = Some(pool.clone());
        Ok(pool)
    }

    fn price_at(&self, pool: &Pool, bin: i32) -> f64 {
        bin_price(bin, pool.bin_step, pool.decimals_x, pool.decimals_y)
    }

    /// Open the initial Y position at the current active bin.
    async fn open_initial(&self, pool: &Pool) -> Result<(), EngineError> {
        let amount = self.config.y_amount_raw;
        let width = self.config.bin_range;
        let slippage = self.config.slippage_bps;
        let amm = self.ctx.amm.clone();
        let pool_clone = pool.clone();

        let position = self
            .ctx
            .retry
            .execute_validated(
                &self.ctx.instance_id,
                OpKind::PositionCreate,
                None,
                &self.ctx.cancel,
                |_attempt| {
                    let amm = amm.clone();
                    let pool = pool_clone.clone();
                    async move {
                        let active = amm.read_active_bin(&pool).await?;
                        let (lower, upper) = anchored_range(PositionSide::Y, active, width);
                        amm.open_position(&pool, PositionSide::Y, amount, lower, upper, slippage)
                            .await
                    }
                },
                |position: &Position| {
                    if position.width() == width {
                        Ok(())
                    } else {
                        Err(EngineError::Internal(format!(
                            "opened width {} != configured {}",
                            position.width(),
                            width
                        )))
                    }
                },
            )
            .await?;

        let price = self.price_at(pool, position.lower_bin);
        if let Some(analytics) = self.analytics.lock().as_mut() {
            analytics.on_open(position.amount_x_raw, position.amount_y_raw, price);
        }

        info!(
            instance = %self.ctx.instance_id,
            position = %position.address,
            lower = position.lower_bin,
            upper = position.upper_bin,
            "initial position opened"
        );

        let mut state = self.state.lock();
        state.position = Some(position);
        state.phase = ExecPhase::InRange;
        state.out_of_range_since = None;
        state.stop_loss_strikes = 0;
        Ok(())
    }

    /// One observation + evaluation pass over the open position.
    async fn observe_and_evaluate(&self, pool: &Pool) -> Result<Decision, EngineError> {
        let position = match self.state.lock().position.clone() {
            Some(p) => p,
            None => return Ok(Decision::Hold),
        };

        let active = self.ctx.amm.read_active_bin(pool).await?;
        let price = self.price_at(pool, active);

        // Fresh fee figures come from the chain; amounts are what we
        // deposited.
        let (fees_x, fees_y) = match self
            .ctx
            .amm
            .read_positions_for_owner(pool, &self.ctx.owner)
            .await
        {
            Ok(on_chain) => on_chain
                .iter()
                .find(|p| p.address == position.address)
                .map(|p| (p.fees_x_raw, p.fees_y_raw))
                .unwrap_or((position.fees_x_raw, position.fees_y_raw)),
            Err(e) => {
                debug!(instance = %self.ctx.instance_id, error = %e, "fee refresh failed, using stale fees");
                (position.fees_x_raw, position.fees_y_raw)
            }
        };

        let snapshot = {
            let mut analytics = self.analytics.lock();
            let analytics = analytics
                .as_mut()
                .ok_or_else(|| EngineError::Internal("analytics missing".into()))?;
            analytics.tick(
                active,
                position.lower_bin,
                position.upper_bin,
                position.amount_x_raw,
                position.amount_y_raw,
                fees_x,
                fees_y,
                price,
            )
        };
        *self.last_snapshot.lock() = Some(snapshot);

        let mut state = self.state.lock();
        let lower = position.lower_bin;
        let upper = position.upper_bin;
        let now = Instant::now();

        // Stop-loss first: it wins any tie with recentering. Armed only
        // below the range, so a zero offset means "first bin under lower".
        let stop_bin = lower - self.config.stop_loss_bin_offset as i32;
        if active < lower && active <= stop_bin {
            state.stop_loss_strikes += 1;
            debug!(
                instance = %self.ctx.instance_id,
                active,
                stop_bin,
                strikes = state.stop_loss_strikes,
                required = self.config.stop_loss_count,
                "stop-loss armed"
            );
            if state.stop_loss_strikes >= self.config.stop_loss_count {
                state.close_reason = Some(CloseReason::StopLoss);
                return Ok(Decision::StopLoss);
            }
        } else {
            state.stop_loss_strikes = 0;
        }

        if in_range(active, lower, upper) {
            // Back in range: the out-of-range timer resets fully.
            state.phase = ExecPhase::InRange;
            state.out_of_range_since = None;
            return Ok(Decision::Hold);
        }

        if active > upper {
            let since = match (state.phase, state.out_of_range_since) {
                (ExecPhase::OutOfRangeUp, Some(since)) => since,
                _ => {
                    state.phase = ExecPhase::OutOfRangeUp;
                    state.out_of_range_since = Some(now);
                    now
                }
            };
            if now.duration_since(since).as_secs() >= self.config.upward_timeout_seconds {
                return Ok(Decision::RecenterUp);
            }
            return Ok(Decision::Hold);
        }

        // active < lower
        let since = match (state.phase, state.out_of_range_since) {
            (ExecPhase::OutOfRangeDown, Some(since)) => since,
            _ => {
                state.phase = ExecPhase::OutOfRangeDown;
                state.out_of_range_since = Some(now);
                now
            }
        };
        if now.duration_since(since).as_secs() >= self.config.downward_timeout_seconds {
            state.close_reason = Some(CloseReason::StopLoss);
            return Ok(Decision::StopLoss);
        }
        Ok(Decision::Hold)
    }

    /// Close, swap X proceeds back to Y, reopen at the new active bin.
    async fn recenter(&self) -> Result<(), EngineError> {
        self.state.lock().phase = ExecPhase::Recentering;
        let pool = self.ensure_pool().await?;

        let position = self
            .state
            .lock()
            .position
            .clone()
            .ok_or_else(|| EngineError::Internal("recenter without a position".into()))?;

        let result = self.recenter_inner(&pool, &position).await;
        if let Err(ref e) = result {
            if e.kind() != ErrorKind::Cancelled {
                self.enter_error(format!("recenter failed: {e}"));
            }
        }
        result
    }

    async fn recenter_inner(&self, pool: &Pool, position: &Position) -> Result<(), EngineError> {
        let slippage = self.config.slippage_bps;

        // 1. Close the out-of-range position.
        let amm = self.ctx.amm.clone();
        let pool_c = pool.clone();
        let pos_c = position.clone();
        let outcome = self
            .ctx
            .retry
            .execute(
                &self.ctx.instance_id,
                OpKind::PositionClose,
                &self.ctx.cancel,
                move |_| {
                    let amm = amm.clone();
                    let pool = pool_c.clone();
                    let position = pos_c.clone();
                    async move { amm.close_position(&pool, &position, slippage).await }
                },
            )
            .await?;

        let active = self.ctx.amm.read_active_bin(pool).await?;
        let close_price = self.price_at(pool, active);
        if let Some(analytics) = self.analytics.lock().as_mut() {
            analytics.on_close(
                outcome.x_raw_returned,
                outcome.y_raw_returned,
                outcome.fees_x_raw,
                outcome.fees_y_raw,
                close_price,
            );
        }
        self.state.lock().position = None;

        // 2. Swap any X proceeds back to Y.
        let x_total = outcome.x_raw_returned + outcome.fees_x_raw;
        let mut y_total = outcome.y_raw_returned + outcome.fees_y_raw;
        if x_total > 0 {
            y_total += self.swap_x_to_y(pool, x_total, OpKind::OutOfRangeHandler).await?;
        }

        // 3. Reopen a fresh Y position of the same width at the new active
        // bin with the full Y proceeds.
        let width = self.config.bin_range;
        let amm = self.ctx.amm.clone();
        let pool_c = pool.clone();
        let new_position = self
            .ctx
            .retry
            .execute(
                &self.ctx.instance_id,
                OpKind::PositionCreate,
                &self.ctx.cancel,
                move |_| {
                    let amm = amm.clone();
                    let pool = pool_c.clone();
                    async move {
                        let active = amm.read_active_bin(&pool).await?;
                        let (lower, upper) = anchored_range(PositionSide::Y, active, width);
                        amm.open_position(&pool, PositionSide::Y, y_total, lower, upper, slippage)
                            .await
                    }
                },
            )
            .await?;

        let reopen_price = self.price_at(pool, new_position.lower_bin);
        if let Some(analytics) = self.analytics.lock().as_mut() {
            analytics.on_redeploy(
                new_position.amount_x_raw,
                new_position.amount_y_raw,
                reopen_price,
            );
        }

        info!(
            instance = %self.ctx.instance_id,
            old_position = %position.address,
            new_position = %new_position.address,
            lower = new_position.lower_bin,
            upper = new_position.upper_bin,
            "recentered"
        );

        let mut state = self.state.lock();
        state.position = Some(new_position);
        state.phase = ExecPhase::InRange;
        state.out_of_range_since = None;
        state.stop_loss_strikes = 0;
        Ok(())
    }

    async fn swap_x_to_y(&self, pool: &Pool, x_amount: u64, op: OpKind) -> Result<u64, EngineError> {
        let swap = self.ctx.swap.clone();
        let slippage = self.config.slippage_bps;
        let input = pool.token_x_mint;
        let output = pool.token_y_mint;

        let outcome = self
            .ctx
            .retry
            .execute(&self.ctx.instance_id, op, &self.ctx.cancel, move |_| {
                let swap = swap.clone();
                async move {
                    // A fresh quote per attempt: an expired route never
                    // survives into the next try.
                    let quote = swap
                        .quote(&input, &output, x_amount, slippage, &serde_json::Value::Null)
                        .await?;
                    swap.execute(&quote).await
                }
            })
            .await?;

        if let Some(analytics) = self.analytics.lock().as_mut() {
            analytics.on_swap(x_amount, outcome.out_raw, outcome.effective_price);
        }
        Ok(outcome.out_raw)
    }

    /// Close out the position for `reason` and settle residual X to Y.
    async fn close_out(&self, reason: CloseReason) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            state.phase = ExecPhase::Closing;
            state.close_reason = Some(reason);
        }
        let pool = self.ensure_pool().await?;

        let position = self.state.lock().position.clone();
        let Some(position) = position else {
            self.state.lock().phase = ExecPhase::Done;
            return Ok(());
        };

        let result = self.close_out_inner(&pool, &position, reason).await;
        if let Err(ref e) = result {
            if e.kind() != ErrorKind::Cancelled {
                self.enter_error(format!("close failed: {e}"));
            }
        }
        result
    }

    async fn close_out_inner(
        &self,
        pool: &Pool,
        position: &Position,
        reason: CloseReason,
    ) -> Result<(), EngineError> {
        let op = match reason {
            CloseReason::StopLoss => OpKind::StopLoss,
            _ => OpKind::PositionCleanup,
        };

        if reason == CloseReason::StopLoss {
            let active = self.ctx.amm.read_active_bin(pool).await.unwrap_or(0);
            if let Some(analytics) = self.analytics.lock().as_mut() {
                analytics.on_stop_loss(active);
            }
        }

        let slippage = self.config.slippage_bps;
        let amm = self.ctx.amm.clone();
        let pool_c = pool.clone();
        let pos_c = position.clone();
        let bus = self.ctx.bus.clone();
        let instance_id = self.ctx.instance_id.clone();

        let close_result = self
            .ctx
            .retry
            .execute(&self.ctx.instance_id, op, &self.ctx.cancel, move |attempt| {
                let amm = amm.clone();
                let pool = pool_c.clone();
                let position = pos_c.clone();
                let bus = bus.clone();
                let instance_id = instance_id.clone();
                async move {
                    bus.publish(
                        TOPIC_SMART_STOP_LOSS,
                        serde_json::json!({
                            "instanceId": instance_id,
                            "reason": reason.to_string(),
                            "attempt": attempt,
                        }),
                    );
                    amm.close_position(&pool, &position, slippage).await
                }
            })
            .await;

        let outcome = match close_result {
            Ok(outcome) => outcome,
            // The position vanished between decision and close: another
            // attempt already settled it on chain.
            Err(EngineError::NotFound(msg)) => {
                warn!(instance = %self.ctx.instance_id, %msg, "position already gone at close");
                Default::default()
            }
            Err(e) => return Err(e),
        };

        let active = self.ctx.amm.read_active_bin(pool).await.unwrap_or(position.lower_bin);
        let price = self.price_at(pool, active);
        if let Some(analytics) = self.analytics.lock().as_mut() {
            analytics.on_close(
                outcome.x_raw_returned,
                outcome.y_raw_returned,
                outcome.fees_x_raw,
                outcome.fees_y_raw,
                price,
            );
        }

        // Residual X is swapped back to the principal side.
        let x_total = outcome.x_raw_returned + outcome.fees_x_raw;
        if x_total > 0 && reason == CloseReason::StopLoss {
            self.swap_x_to_y(pool, x_total, OpKind::StopLossTokenSwap)
                .await?;
        }

        info!(
            instance = %self.ctx.instance_id,
            position = %position.address,
            reason = %reason,
            "position closed out"
        );

        let mut state = self.state.lock();
        state.position = None;
        state.phase = ExecPhase::Done;
        Ok(())
    }
}

#[async_trait]
impl StrategyExecutor for SimpleYExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SimpleY
    }

    fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        let pool = self.ensure_pool().await?;

        let (_, y_balance) = self
            .ctx
            .amm
            .read_user_balance(&pool, &self.ctx.owner)
            .await?;
        if y_balance < self.config.y_amount_raw {
            // Stays in Init: the instance never opened anything.
            return Err(EngineError::Validation(format!(
                "insufficient Y balance: have {y_balance}, need {}",
                self.config.y_amount_raw
            )));
        }

        self.state.lock().phase = ExecPhase::Opening;
        debug!(instance = %self.ctx.instance_id, "validated, ready to open");
        Ok(())
    }

    async fn tick(&self) -> Result<Decision, EngineError> {
        if self.cancelled() {
            return Err(EngineError::Cancelled);
        }

        let phase = self.state.lock().phase;
        match phase {
            ExecPhase::Init => {
                self.initialize().await?;
                let pool = self.ensure_pool().await?;
                self.open_initial(&pool).await?;
                self.observe_and_evaluate(&pool).await
            }
            ExecPhase::Opening => {
                let pool = self.ensure_pool().await?;
                self.open_initial(&pool).await?;
                self.observe_and_evaluate(&pool).await
            }
            ExecPhase::InRange | ExecPhase::OutOfRangeUp | ExecPhase::OutOfRangeDown => {
                let pool = self.ensure_pool().await?;
                self.observe_and_evaluate(&pool).await
            }
            ExecPhase::Done => Ok(Decision::Complete),
            // Transitional or terminal phases hold until resolved.
            _ => Ok(Decision::Hold),
        }
    }

    async fn handle(&self, decision: Decision) -> Result<(), EngineError> {
        match decision {
            Decision::Hold | Decision::Harvest | Decision::Complete => Ok(()),
            Decision::RecenterUp | Decision::RecenterDown => self.recenter().await,
            Decision::StopLoss => self.close_out(CloseReason::StopLoss).await,
        }
    }

    async fn teardown(&self, reason: CloseReason) -> Result<(), EngineError> {
        if self.state.lock().position.is_none() {
            let mut state = self.state.lock();
            if state.phase != ExecPhase::Error {
                state.phase = ExecPhase::Done;
            }
            return Ok(());
        }
        self.close_out(reason).await
    }

    async fn recover(&self, recorded: &[String]) -> Result<RecoverOutcome, EngineError> {
        let pool = self.ensure_pool().await?;
        let on_chain = self
            .ctx
            .amm
            .read_positions_for_owner(&pool, &self.ctx.owner)
            .await?;

        let on_chain_addrs: Vec<String> =
            on_chain.iter().map(|p| p.address.to_string()).collect();
        let missing: Vec<&String> = recorded
            .iter()
            .filter(|addr| !on_chain_addrs.contains(addr))
            .collect();
        let extra: Vec<&Position> = on_chain
            .iter()
            .filter(|p| !recorded.contains(&p.address.to_string()))
            .collect();

        if on_chain.is_empty() {
            if recorded.is_empty() {
                // Never opened: resume from Opening.
                self.state.lock().phase = ExecPhase::Opening;
                return Ok(RecoverOutcome::Clean);
            }
            self.enter_error("orphaned".into());
            return Ok(RecoverOutcome::Orphaned);
        }

        // Adopt whatever the chain says we own: a crash between
        // confirmation and commit leaves the record one step behind.
        let current = on_chain
            .iter()
            .find(|p| recorded.contains(&p.address.to_string()))
            .or(extra.first().copied())
            .cloned();

        let outcome = if extra.is_empty() && missing.is_empty() {
            RecoverOutcome::Clean
        } else {
            info!(
                instance = %self.ctx.instance_id,
                adopted = extra.len(),
                forgotten = missing.len(),
                "reconciled position set from chain"
            );
            RecoverOutcome::Adopted(extra.len())
        };

        let mut state = self.state.lock();
        state.position = current;
        state.phase = ExecPhase::InRange;
        state.out_of_range_since = None;
        Ok(outcome)
    }

    fn restore_ledger(&self, entries: Vec<LedgerEntry>) {
        let mut analytics = self.analytics.lock();
        match analytics.as_mut() {
            Some(a) => a.restore_ledger(entries),
            None => *self.pending_ledger.lock() = Some(entries),
        }
    }

    fn phase(&self) -> ExecPhase {
        self.state.lock().phase
    }

    fn last_snapshot(&self) -> Option<Snapshot> {
        self.last_snapshot.lock().clone()
    }

    fn position_addresses(&self) -> Vec<String> {
        self.state
            .lock()
            .position
            .as_ref()
            .map(|p| vec![p.address.to_string()])
            .unwrap_or_default()
    }

    fn ledger(&self) -> Vec<LedgerEntry> {
        self.analytics
            .lock()
            .as_ref()
            .map(|a| a.ledger().to_vec())
            .unwrap_or_default()
    }

    fn error_reason(&self) -> Option<String> {
        self.state.lock().error_reason.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsConfig;
    use crate::events::EventBus;
    use crate::retry::RetryCoordinator;
    use crate::testkit::{mock_owner, MockAmm, MockSwap};
    use std::sync::Arc;
    use tokio::sync::watch;

    const Y_PRINCIPAL: u64 = 25_000_000_000; // 25_000 Y at 6 decimals

    struct Harness {
        executor: SimpleYExecutor,
        amm: Arc<MockAmm>,
        swap: Arc<MockSwap>,
        _cancel_tx: watch::Sender<bool>,
    }

    fn harness(config_patch: impl FnOnce(&mut SimpleYConfig)) -> Harness {
        let amm = MockAmm::new(500, Y_PRINCIPAL);
        let swap = MockSwap::new(amm.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut config = SimpleYConfig {
            pool_address: amm.pool.address.to_string(),
            y_amount_raw: Y_PRINCIPAL,
            bin_range: 10,
            stop_loss_count: 1,
            stop_loss_bin_offset: 35,
            upward_timeout_seconds: 300,
            downward_timeout_seconds: 60,
            slippage_bps: 50,
        };
        config_patch(&mut config);

        let ctx = ExecutorContext {
            instance_id: "test-instance".into(),
            owner: mock_owner(),
            amm: amm.clone(),
            swap: swap.clone(),
            retry: RetryCoordinator::new(),
            bus: EventBus::new(),
            cancel: cancel_rx,
            analytics: AnalyticsConfig::default(),
        };

        Harness {
            executor: SimpleYExecutor::new(ctx, config),
            amm,
            swap,
            _cancel_tx: cancel_tx,
        }
    }

    // ── Scenario 1: happy path ──────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_opens_and_holds_in_range() {
        let h = harness(|_| {});

        let decision = h.executor.tick().await.unwrap();
        assert_eq!(decision, Decision::Hold);
        assert_eq!(h.executor.phase(), ExecPhase::InRange);

        let positions = h.amm.live_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].lower_bin, 500);
        assert_eq!(positions[0].upper_bin, 509);

        // Oscillation inside the range never triggers anything, and
        // snapshots stay strictly ordered.
        let mut last_ts = 0;
        for bin in [501, 505, 507, 500, 506] {
            h.amm.set_active(bin);
            assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);
            assert_eq!(h.executor.phase(), ExecPhase::InRange);
            let snap = h.executor.last_snapshot().unwrap();
            assert!(snap.in_range);
            assert!(snap.timestamp_ms > last_ts);
            last_ts = snap.timestamp_ms;
        }
        assert_eq!(h.amm.open_count(), 1, "no recenter in range");
    }

    // ── Scenario 2: recenter up after timeout ───────────────────────────

    #[tokio::test(start_paused = true)]
    async fn recenter_up_after_upward_timeout() {
        let h = harness(|_| {});
        h.executor.tick().await.unwrap(); // opens [500,509]

        h.amm.set_active(512);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);
        assert_eq!(h.executor.phase(), ExecPhase::OutOfRangeUp);

        tokio::time::advance(std::time::Duration::from_secs(301)).await;
        let decision = h.executor.tick().await.unwrap();
        assert_eq!(decision, Decision::RecenterUp);

        h.executor.handle(decision).await.unwrap();
        assert_eq!(h.executor.phase(), ExecPhase::InRange);

        let positions = h.amm.live_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].lower_bin, 512);
        assert_eq!(positions[0].upper_bin, 521);
        // The closed position was all X (price above range); it was swapped
        // back to Y before reopening.
        assert_eq!(h.swap.executed_swaps().len(), 1);
        assert_eq!(h.amm.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn returning_in_range_resets_upward_timer() {
        let h = harness(|_| {});
        h.executor.tick().await.unwrap();

        h.amm.set_active(512);
        h.executor.tick().await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(200)).await;

        // Back in range: timer must fully reset.
        h.amm.set_active(505);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);
        assert_eq!(h.executor.phase(), ExecPhase::InRange);

        // Out again: a fresh 300 s window applies.
        h.amm.set_active(512);
        h.executor.tick().await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(200)).await;
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);
        tokio::time::advance(std::time::Duration::from_secs(101)).await;
        assert_eq!(h.executor.tick().await.unwrap(), Decision::RecenterUp);
    }

    // ── Scenario 3: stop-loss ───────────────────────────────────────────

    #[tokio::test]
    async fn stop_loss_after_consecutive_strikes() {
        let h = harness(|c| {
            c.stop_loss_count = 2;
            c.stop_loss_bin_offset = 5;
        });
        h.executor.tick().await.unwrap(); // opens [500,509]

        // active = 494 <= 500 - 5: first strike arms, does not fire.
        h.amm.set_active(494);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);

        // Second consecutive strike fires.
        h.amm.set_active(494);
        let decision = h.executor.tick().await.unwrap();
        assert_eq!(decision, Decision::StopLoss);

        h.executor.handle(decision).await.unwrap();
        assert_eq!(h.executor.phase(), ExecPhase::Done);
        assert!(h.amm.live_positions().is_empty());

        // Ledger records the trigger.
        let ledger = h.executor.ledger();
        assert!(ledger
            .iter()
            .any(|e| matches!(e, LedgerEntry::StopLossTriggered { .. })));
    }

    #[tokio::test]
    async fn strike_counter_resets_when_price_recovers() {
        let h = harness(|c| {
            c.stop_loss_count = 2;
            c.stop_loss_bin_offset = 5;
        });
        h.executor.tick().await.unwrap();

        h.amm.set_active(494);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);

        // Recovery above the stop bin resets the counter.
        h.amm.set_active(499);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);

        h.amm.set_active(494);
        assert_eq!(
            h.executor.tick().await.unwrap(),
            Decision::Hold,
            "one strike after reset must not fire"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn downward_timeout_exits_with_stop_loss() {
        let h = harness(|c| {
            c.stop_loss_bin_offset = 35; // too far to arm in this test
            c.downward_timeout_seconds = 60;
        });
        h.executor.tick().await.unwrap();

        h.amm.set_active(497);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);
        assert_eq!(h.executor.phase(), ExecPhase::OutOfRangeDown);

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        assert_eq!(h.executor.tick().await.unwrap(), Decision::StopLoss);
    }

    // ── Boundaries ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_bin_range_any_move_is_out_of_range() {
        let h = harness(|c| c.bin_range = 1);
        h.executor.tick().await.unwrap();

        let positions = h.amm.live_positions();
        assert_eq!(positions[0].lower_bin, 500);
        assert_eq!(positions[0].upper_bin, 500);

        h.amm.set_active(501);
        h.executor.tick().await.unwrap();
        assert_eq!(h.executor.phase(), ExecPhase::OutOfRangeUp);
    }

    #[tokio::test]
    async fn max_width_sixty_eight_bin_move_stays_in_range() {
        let h = harness(|c| c.bin_range = 69);
        h.executor.tick().await.unwrap();

        h.amm.set_active(568); // 500 + 68
        assert_eq!(h.executor.tick().await.unwrap(), Decision::Hold);
        assert_eq!(h.executor.phase(), ExecPhase::InRange);
    }

    #[tokio::test]
    async fn zero_offset_single_count_fires_on_first_tick_below() {
        let h = harness(|c| {
            c.stop_loss_count = 1;
            c.stop_loss_bin_offset = 0;
        });
        h.executor.tick().await.unwrap();

        h.amm.set_active(499);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::StopLoss);
    }

    #[tokio::test]
    async fn zero_upward_timeout_recenters_immediately() {
        let h = harness(|c| c.upward_timeout_seconds = 0);
        h.executor.tick().await.unwrap();

        h.amm.set_active(510);
        assert_eq!(h.executor.tick().await.unwrap(), Decision::RecenterUp);
    }

    #[tokio::test]
    async fn zero_balance_never_leaves_init() {
        let h = harness(|_| {});
        h.amm.set_balances(0, 0);

        let err = h.executor.tick().await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(h.executor.phase(), ExecPhase::Init);
        assert!(h.amm.live_positions().is_empty());
    }

    // ── Scenario 5: RPC flap ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn open_survives_two_transient_failures_with_one_ledger_entry() {
        let h = harness(|_| {});
        h.amm
            .push_open_error(EngineError::TransientRpc("flap 1".into()));
        h.amm
            .push_open_error(EngineError::TransientRpc("flap 2".into()));

        let started = Instant::now();
        h.executor.tick().await.unwrap();
        assert_eq!(h.executor.phase(), ExecPhase::InRange);

        // 2 s + 4 s of backoff elapsed in paused time.
        assert!(started.elapsed() >= std::time::Duration::from_secs(6));
        assert_eq!(h.amm.open_count(), 1, "exactly one position created");

        let opens = h
            .executor
            .ledger()
            .iter()
            .filter(|e| matches!(e, LedgerEntry::Open { .. }))
            .count();
        assert_eq!(opens, 1, "exactly one open event in the ledger");
    }

    #[tokio::test]
    async fn terminal_open_failure_surfaces_unchanged() {
        let h = harness(|_| {});
        h.amm.push_open_error(EngineError::OnChainTerminal(
            "custom program error: 0x1771".into(),
        ));

        let err = h.executor.tick().await.unwrap_err();
        assert!(matches!(err, EngineError::OnChainTerminal(_)));
        assert_eq!(h.amm.open_count(), 0);
    }

    // ── Invariants ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn recenter_postcondition_is_in_range_or_error() {
        // Healthy path ends InRange (asserted above); a close that fails
        // terminally must end Error, never OutOfRange*.
        let h = harness(|c| c.upward_timeout_seconds = 0);
        h.executor.tick().await.unwrap();

        h.amm.set_active(512);
        let decision = h.executor.tick().await.unwrap();
        assert_eq!(decision, Decision::RecenterUp);

        h.amm.push_close_error(EngineError::OnChainTerminal(
            "custom program error: 0x1".into(),
        ));
        let result = h.executor.handle(decision).await;
        assert!(result.is_err());
        assert_eq!(h.executor.phase(), ExecPhase::Error);
        assert!(h.executor.error_reason().is_some());
    }

    #[tokio::test]
    async fn opened_width_always_matches_configured_width() {
        for width in [1u32, 5, 10, 69] {
            let h = harness(|c| c.bin_range = width);
            h.executor.tick().await.unwrap();
            let positions = h.amm.live_positions();
            assert_eq!(positions[0].width(), width);
        }
    }

    #[tokio::test]
    async fn teardown_closes_and_finishes() {
        let h = harness(|_| {});
        h.executor.tick().await.unwrap();
        assert_eq!(h.amm.live_positions().len(), 1);

        h.executor.teardown(CloseReason::UserStop).await.unwrap();
        assert_eq!(h.executor.phase(), ExecPhase::Done);
        assert!(h.amm.live_positions().is_empty());
        assert!(h.executor.position_addresses().is_empty());
    }

    // ── Scenario 6: crash recovery ──────────────────────────────────────

    #[tokio::test]
    async fn recover_adopts_position_created_before_crash() {
        let h = harness(|_| {});
        h.executor.tick().await.unwrap();
        let old_addr = h.executor.position_addresses()[0].clone();

        // Simulate: recenter confirmed on chain (old gone, new present) but
        // the record still lists the old address.
        let old_pk = old_addr.parse().unwrap();
        h.amm.vanish_position(&old_pk);
        let new_position = Position {
            address: solana_sdk::pubkey::Pubkey::new_unique(),
            pool: h.amm.pool.address,
            owner: mock_owner(),
            lower_bin: 512,
            upper_bin: 521,
            amount_x_raw: 0,
            amount_y_raw: Y_PRINCIPAL,
            fees_x_raw: 0,
            fees_y_raw: 0,
        };
        let new_addr = new_position.address.to_string();
        h.amm.seed_position(new_position);

        let outcome = h.executor.recover(&[old_addr]).await.unwrap();
        assert_eq!(outcome, RecoverOutcome::Adopted(1));
        assert_eq!(h.executor.position_addresses(), vec![new_addr]);
        assert_eq!(h.executor.phase(), ExecPhase::InRange);
    }

    #[tokio::test]
    async fn recover_marks_orphaned_when_chain_is_empty() {
        let h = harness(|_| {});
        let outcome = h
            .executor
            .recover(&["4uQeVj5tqViQh7yWWGStvkEG1Zmhx6uasJtWCJziofM".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome, RecoverOutcome::Orphaned);
        assert_eq!(h.executor.phase(), ExecPhase::Error);
        assert_eq!(h.executor.error_reason().as_deref(), Some("orphaned"));
    }

    #[tokio::test]
    async fn recover_clean_with_no_positions_resumes_opening() {
        let h = harness(|_| {});
        let outcome = h.executor.recover(&[]).await.unwrap();
        assert_eq!(outcome, RecoverOutcome::Clean);
        assert_eq!(h.executor.phase(), ExecPhase::Opening);
    }
}
