// =============================================================================
// Chain-Position Executor — a sliding chain of K contiguous positions
// =============================================================================
//
// K equal-width links form a super-range. As price walks through the chain,
// the far-side link is closed, its proceeds swapped to the dominant side,
// and a fresh near-side link opened: the chain "rolls" while keeping K
// links. Accrued fees are harvested in place once they exceed the
// configured share of principal. An optional smart stop-loss applies the
// Simple-Y exit rule to the super-range.
//
// State machine: Init -> Opening -> Tracking -> Shifting | Harvesting ->
// Tracking -> Closing -> Done | Error.
//
// Rolls are atomic per link under the Retry Coordinator; a reopen that
// exhausts its retries moves the executor to Error rather than letting the
// chain silently shrink below K links.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::amm::bins::{bin_price, in_range};
use crate::analytics::{LedgerEntry, PositionAnalytics, Snapshot};
use crate::error::{EngineError, ErrorKind};
use crate::events::TOPIC_SMART_STOP_LOSS;
use crate::retry::OpKind;
use crate::strategy::{
    ChainPositionConfig, ChainVariant, ExecPhase, ExecutorContext, RecoverOutcome,
    StrategyExecutor,
};
use crate::types::{CloseReason, Decision, Pool, Position, PositionSide, StrategyKind};

struct ChainState {
    phase: ExecPhase,
    /// Links ordered by lower bin, ascending. Invariant: exactly K links
    /// outside Opening/Closing transitions.
    links: Vec<Position>,
    adverse_since: Option<Instant>,
    stop_loss_strikes: u32,
    close_reason: Option<CloseReason>,
    error_reason: Option<String>,
}

pub struct ChainPositionExecutor {
    ctx: ExecutorContext,
    config: ChainPositionConfig,
    state: Mutex<ChainState>,
    pool: Mutex<Option<Pool>>,
    analytics: Mutex<Option<PositionAnalytics>>,
    pending_ledger: Mutex<Option<Vec<LedgerEntry>>>,
    last_snapshot: Mutex<Option<Snapshot>>,
}

impl ChainPositionExecutor {
    pub fn new(ctx: ExecutorContext, config: ChainPositionConfig) -> Self {
        Self {
            ctx,
            config,
            state: Mutex::new(ChainState {
                phase: ExecPhase::Init,
                links: Vec::new(),
                adverse_since: None,
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

    fn funding_side(&self) -> PositionSide {
        match self.config.chain_position_type {
            ChainVariant::YChain => PositionSide::Y,
            ChainVariant::XChain => PositionSide::X,
            ChainVariant::XyChain => PositionSide::Xy,
        }
    }

    fn enter_error(&self, reason: String) {
        warn!(instance = %self.ctx.instance_id, reason = %reason, "chain executor entering error state");
        let mut state = self.state.lock();
        state.phase = ExecPhase::Error;
        state.error_reason = Some(reason);
    }

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

    /// Link i's range for a chain anchored at `active`.
    fn link_range(&self, active: i32, index: u32) -> (i32, i32) {
        let w = self.config.bin_range as i32;
        let i = index as i32;
        let k = self.config.chain_length as i32;
        match self.config.chain_position_type {
            // Super-range anchored at the active bin, extending upward.
            ChainVariant::YChain => (active + i * w, active + (i + 1) * w - 1),
            // Anchored at the active bin, extending downward.
            ChainVariant::XChain => (active - (i + 1) * w + 1, active - i * w),
            // Centered: total K*W bins straddling the active bin.
            ChainVariant::XyChain => {
                let start = active - (k * w) / 2;
                (start + i * w, start + (i + 1) * w - 1)
            }
        }
    }

    fn super_range(links: &[Position]) -> Option<(i32, i32)> {
        let lower = links.iter().map(|p| p.lower_bin).min()?;
        let upper = links.iter().map(|p| p.upper_bin).max()?;
        Some((lower, upper))
    }

    async fn open_link(
        &self,
        pool: &Pool,
        lower: i32,
        upper: i32,
        amount_raw: u64,
    ) -> Result<Position, EngineError> {
        let side = self.funding_side();
        let width = self.config.bin_range;
        let slippage = self.config.slippage_bps;
        let amm = self.ctx.amm.clone();
        let pool_c = pool.clone();

        self.ctx
            .retry
            .execute_validated(
                &self.ctx.instance_id,
                OpKind::PositionCreate,
                None,
                &self.ctx.cancel,
                move |_| {
                    let amm = amm.clone();
                    let pool = pool_c.clone();
                    async move {
                        amm.open_position(&pool, side, amount_raw, lower, upper, slippage)
                            .await
                    }
                },
                |position: &Position| {
                    if position.width() == width {
                        Ok(())
                    } else {
                        Err(EngineError::Internal(format!(
                            "link width {} != configured {}",
                            position.width(),
                            width
                        )))
                    }
                },
            )
            .await
    }

    /// Open all K links anchored at the current active bin.
    async fn open_chain(&self, pool: &Pool) -> Result<(), EngineError> {
        let active = self.ctx.amm.read_active_bin(pool).await?;
        let mut links = Vec::with_capacity(self.config.chain_length as usize);

        for i in 0..self.config.chain_length {
            let (lower, upper) = self.link_range(active, i);
            let link = self
                .open_link(pool, lower, upper, self.config.position_amount_raw)
                .await?;

            let price = self.price_at(pool, lower);
            if let Some(analytics) = self.analytics.lock().as_mut() {
                analytics.on_open(link.amount_x_raw, link.amount_y_raw, price);
            }
            links.push(link);
        }

        links.sort_by_key(|p| p.lower_bin);
        let (lo, hi) = Self::super_range(&links).unwrap_or((active, active));
        info!(
            instance = %self.ctx.instance_id,
            links = links.len(),
            super_lower = lo,
            super_upper = hi,
            variant = %self.config.chain_position_type,
            "chain opened"
        );

        let mut state = self.state.lock();
        state.links = links;
        state.phase = ExecPhase::Tracking;
        Ok(())
    }

    /// Observe the chain and decide what the tick should do.
    async fn observe_and_evaluate(&self, pool: &Pool) -> Result<Decision, EngineError> {
        let links = self.state.lock().links.clone();
        if links.is_empty() {
            return Ok(Decision::Hold);
        }
        let (super_lo, super_hi) = Self::super_range(&links)
            .ok_or_else(|| EngineError::Internal("empty chain in tracking".into()))?;

        let active = self.ctx.amm.read_active_bin(pool).await?;
        let price = self.price_at(pool, active);

        // Fee refresh: one read for the whole chain.
        let on_chain = self
            .ctx
            .amm
            .read_positions_for_owner(pool, &self.ctx.owner)
            .await
            .unwrap_or_default();
        let link_fees = |p: &Position| {
            on_chain
                .iter()
                .find(|oc| oc.address == p.address)
                .map(|oc| (oc.fees_x_raw, oc.fees_y_raw))
                .unwrap_or((p.fees_x_raw, p.fees_y_raw))
        };

        let total_x: u64 = links.iter().map(|p| p.amount_x_raw).sum();
        let total_y: u64 = links.iter().map(|p| p.amount_y_raw).sum();
        let (fees_x, fees_y) = links.iter().map(&link_fees).fold((0u64, 0u64), |acc, f| {
            (acc.0 + f.0, acc.1 + f.1)
        });

        let (snapshot, unrealized_pct) = {
            let mut analytics = self.analytics.lock();
            let analytics = analytics
                .as_mut()
                .ok_or_else(|| EngineError::Internal("analytics missing".into()))?;
            let snapshot = analytics.tick(
                active, super_lo, super_hi, total_x, total_y, fees_x, fees_y, price,
            );
            let unrealized_y = analytics.value_in_y(fees_x, fees_y, price);
            let pct = if analytics.principal_y() > 0.0 {
                unrealized_y / analytics.principal_y() * 100.0
            } else {
                0.0
            };
            (snapshot, pct)
        };
        *self.last_snapshot.lock() = Some(snapshot);

        let mut state = self.state.lock();
        let now = Instant::now();

        // 1. Smart stop-loss on the super-range, highest priority.
        if self.config.enable_smart_stop_loss {
            let sl = self.config.stop_loss_config.clone().unwrap_or_default();
            let stop_bin = super_lo - sl.stop_loss_bin_offset as i32;
            if active < super_lo && active <= stop_bin {
                state.stop_loss_strikes += 1;
                if state.stop_loss_strikes >= sl.stop_loss_count {
                    state.close_reason = Some(CloseReason::StopLoss);
                    return Ok(Decision::StopLoss);
                }
            } else {
                state.stop_loss_strikes = 0;
            }
        }

        // 2. Favorable breakout: the chain rolls toward price.
        let roll = match self.config.chain_position_type {
            ChainVariant::YChain => {
                if active > super_hi {
                    Some(Decision::RecenterUp)
                } else {
                    None
                }
            }
            ChainVariant::XChain => {
                if active < super_lo {
                    Some(Decision::RecenterDown)
                } else {
                    None
                }
            }
            ChainVariant::XyChain => {
                if active > super_hi {
                    Some(Decision::RecenterUp)
                } else if active < super_lo {
                    Some(Decision::RecenterDown)
                } else {
                    None
                }
            }
        };
        if let Some(decision) = roll {
            state.phase = ExecPhase::Tracking;
            state.adverse_since = None;
            return Ok(decision);
        }

        // 3. Adverse out-of-range: price left the chain on the side it
        // cannot roll toward. Tolerated up to the configured timeout.
        let adverse = !in_range(active, super_lo, super_hi);
        if adverse {
            let since = *state.adverse_since.get_or_insert(now);
            if now.duration_since(since).as_secs() >= self.config.out_of_range_timeout_seconds {
                state.close_reason = Some(CloseReason::StopLoss);
                return Ok(Decision::StopLoss);
            }
            return Ok(Decision::Hold);
        }
        state.adverse_since = None;

        // 4. Yield extraction.
        if unrealized_pct >= self.config.yield_extraction_threshold_percent && (fees_x > 0 || fees_y > 0)
        {
            debug!(
                instance = %self.ctx.instance_id,
                unrealized_pct,
                threshold = self.config.yield_extraction_threshold_percent,
                "yield threshold tripped"
            );
            return Ok(Decision::Harvest);
        }

        Ok(Decision::Hold)
    }

    /// Roll the chain toward price until the active bin is back inside the
    /// super-range. Each roll closes the far-side link, swaps proceeds to
    /// the dominant side, and opens a new near-side link.
    async fn shift(&self, upward: bool) -> Result<(), EngineError> {
        self.state.lock().phase = ExecPhase::Shifting;
        let pool = self.ensure_pool().await?;

        let result = self.shift_inner(&pool, upward).await;
        match result {
            Ok(()) => {
                let mut state = self.state.lock();
                state.phase = ExecPhase::Tracking;
                state.adverse_since = None;
                Ok(())
            }
            Err(e) => {
                if e.kind() != ErrorKind::Cancelled {
                    // No silent shrink: a chain that cannot restore K links
                    // is an error, not a smaller chain.
                    self.enter_error(format!("chain shift failed: {e}"));
                }
                Err(e)
            }
        }
    }

    async fn shift_inner(&self, pool: &Pool, upward: bool) -> Result<(), EngineError> {
        let width = self.config.bin_range as i32;
        let max_rolls = self.config.chain_length;

        for _ in 0..max_rolls {
            let links = self.state.lock().links.clone();
            let (super_lo, super_hi) = Self::super_range(&links)
                .ok_or_else(|| EngineError::Internal("empty chain in shift".into()))?;
            let active = self.ctx.amm.read_active_bin(pool).await?;

            let needs_roll = if upward {
                active > super_hi
            } else {
                active < super_lo
            };
            if !needs_roll {
                break;
            }

            // Far-side link: lowest when rolling up, highest when rolling
            // down.
            let far = if upward {
                links.first().cloned()
            } else {
                links.last().cloned()
            }
            .ok_or_else(|| EngineError::Internal("empty chain in shift".into()))?;

            let slippage = self.config.slippage_bps;
            let amm = self.ctx.amm.clone();
            let pool_c = pool.clone();
            let far_c = far.clone();
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
                        let position = far_c.clone();
                        async move { amm.close_position(&pool, &position, slippage).await }
                    },
                )
                .await?;

            let close_price = self.price_at(pool, active);
            if let Some(analytics) = self.analytics.lock().as_mut() {
                analytics.on_partial_close(
                    outcome.x_raw_returned,
                    outcome.y_raw_returned,
                    outcome.fees_x_raw,
                    outcome.fees_y_raw,
                    close_price,
                );
            }
            self.state.lock().links.retain(|p| p.address != far.address);

            // Swap proceeds to the side the new link is funded with.
            let amount = match self.funding_side() {
                PositionSide::Y | PositionSide::Xy => {
                    let x_total = outcome.x_raw_returned + outcome.fees_x_raw;
                    let mut y_total = outcome.y_raw_returned + outcome.fees_y_raw;
                    if x_total > 0 {
                        y_total += self
                            .swap(pool, true, x_total, OpKind::OutOfRangeHandler)
                            .await?;
                    }
                    y_total
                }
                PositionSide::X => {
                    let y_total = outcome.y_raw_returned + outcome.fees_y_raw;
                    let mut x_total = outcome.x_raw_returned + outcome.fees_x_raw;
                    if y_total > 0 {
                        x_total += self
                            .swap(pool, false, y_total, OpKind::OutOfRangeHandler)
                            .await?;
                    }
                    x_total
                }
            };

            // New near-side link extends the super-range toward price.
            let (lower, upper) = if upward {
                (super_hi + 1, super_hi + width)
            } else {
                (super_lo - width, super_lo - 1)
            };
            let link = self.open_link(pool, lower, upper, amount).await?;
            let reopen_price = self.price_at(pool, lower);
            if let Some(analytics) = self.analytics.lock().as_mut() {
                analytics.on_redeploy(link.amount_x_raw, link.amount_y_raw, reopen_price);
            }

            info!(
                instance = %self.ctx.instance_id,
                closed = %far.address,
                opened = %link.address,
                new_lower = lower,
                new_upper = upper,
                "chain rolled"
            );

            let mut state = self.state.lock();
            state.links.push(link);
            state.links.sort_by_key(|p| p.lower_bin);
        }
        Ok(())
    }

    /// `x_to_y` chooses swap direction; amount is raw units of the input.
    async fn swap(
        &self,
        pool: &Pool,
        x_to_y: bool,
        amount: u64,
        op: OpKind,
    ) -> Result<u64, EngineError> {
        let (input, output) = if x_to_y {
            (pool.token_x_mint, pool.token_y_mint)
        } else {
            (pool.token_y_mint, pool.token_x_mint)
        };
        let swap = self.ctx.swap.clone();
        let slippage = self.config.slippage_bps;

        let outcome = self
            .ctx
            .retry
            .execute(&self.ctx.instance_id, op, &self.ctx.cancel, move |_| {
                let swap = swap.clone();
                async move {
                    let quote = swap
                        .quote(&input, &output, amount, slippage, &serde_json::Value::Null)
                        .await?;
                    swap.execute(&quote).await
                }
            })
            .await?;

        if let Some(analytics) = self.analytics.lock().as_mut() {
            analytics.on_swap(amount, outcome.out_raw, outcome.effective_price);
        }
        Ok(outcome.out_raw)
    }

    /// Harvest fees from every link; positions stay open.
    async fn harvest_all(&self) -> Result<(), EngineError> {
        self.state.lock().phase = ExecPhase::Harvesting;
        let pool = self.ensure_pool().await?;
        let links = self.state.lock().links.clone();

        let mut total_x = 0u64;
        let mut total_y = 0u64;
        for link in &links {
            let amm = self.ctx.amm.clone();
            let pool_c = pool.clone();
            let link_c = link.clone();
            let outcome = self
                .ctx
                .retry
                .execute(
                    &self.ctx.instance_id,
                    OpKind::FeeHarvest,
                    &self.ctx.cancel,
                    move |_| {
                        let amm = amm.clone();
                        let pool = pool_c.clone();
                        let position = link_c.clone();
                        async move { amm.harvest_fees(&pool, &position).await }
                    },
                )
                .await?;
            total_x += outcome.fees_x_raw;
            total_y += outcome.fees_y_raw;
        }

        if total_x > 0 || total_y > 0 {
            let active = self.ctx.amm.read_active_bin(&pool).await?;
            let price = self.price_at(&pool, active);
            if let Some(analytics) = self.analytics.lock().as_mut() {
                analytics.on_harvest(total_x, total_y, price);
            }
            info!(
                instance = %self.ctx.instance_id,
                fees_x = total_x,
                fees_y = total_y,
                "chain fees harvested"
            );
        }

        self.state.lock().phase = ExecPhase::Tracking;
        Ok(())
    }

    /// Close every link and settle residuals.
    async fn close_out(&self, reason: CloseReason) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            state.phase = ExecPhase::Closing;
            state.close_reason = Some(reason);
        }
        let pool = self.ensure_pool().await?;

        let result = self.close_out_inner(&pool, reason).await;
        if let Err(ref e) = result {
            if e.kind() != ErrorKind::Cancelled {
                self.enter_error(format!("chain close failed: {e}"));
            }
        }
        result
    }

    async fn close_out_inner(&self, pool: &Pool, reason: CloseReason) -> Result<(), EngineError> {
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

        let links = self.state.lock().links.clone();
        let mut residual_x = 0u64;
        let mut residual_y = 0u64;

        for (index, link) in links.iter().enumerate() {
            let slippage = self.config.slippage_bps;
            let amm = self.ctx.amm.clone();
            let pool_c = pool.clone();
            let link_c = link.clone();
            let bus = self.ctx.bus.clone();
            let instance_id = self.ctx.instance_id.clone();

            let close_result = self
                .ctx
                .retry
                .execute(&self.ctx.instance_id, op, &self.ctx.cancel, move |attempt| {
                    let amm = amm.clone();
                    let pool = pool_c.clone();
                    let position = link_c.clone();
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
                Err(EngineError::NotFound(msg)) => {
                    warn!(instance = %self.ctx.instance_id, %msg, "link already gone at close");
                    Default::default()
                }
                Err(e) => return Err(e),
            };

            let active = self.ctx.amm.read_active_bin(pool).await.unwrap_or(0);
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
            residual_x += outcome.x_raw_returned + outcome.fees_x_raw;
            residual_y += outcome.y_raw_returned + outcome.fees_y_raw;

            self.state.lock().links.retain(|p| p.address != link.address);
            debug!(
                instance = %self.ctx.instance_id,
                closed = index + 1,
                total = links.len(),
                "chain link closed"
            );
        }

        // Residuals settle to the funding side.
        match self.funding_side() {
            PositionSide::Y | PositionSide::Xy => {
                if residual_x > 0 {
                    self.swap(pool, true, residual_x, OpKind::StopLossTokenSwap)
                        .await?;
                }
            }
            PositionSide::X => {
                if residual_y > 0 {
                    self.swap(pool, false, residual_y, OpKind::StopLossTokenSwap)
                        .await?;
                }
            }
        }

        info!(instance = %self.ctx.instance_id, reason = %reason, "chain closed out");
        self.state.lock().phase = ExecPhase::Done;
        Ok(())
    }
}

#[async_trait]
impl StrategyExecutor for ChainPositionExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ChainPosition
    }

    fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        let pool = self.ensure_pool().await?;

        let (x_balance, y_balance) = self
            .ctx
            .amm
            .read_user_balance(&pool, &self.ctx.owner)
            .await?;
        let needed = self
            .config
            .position_amount_raw
            .saturating_mul(self.config.chain_length as u64);
        let available = match self.funding_side() {
            PositionSide::Y | PositionSide::Xy => y_balance,
            PositionSide::X => x_balance,
        };
        if available < needed {
            return Err(EngineError::Validation(format!(
                "insufficient balance for chain: have {available}, need {needed}"
            )));
        }

        self.state.lock().phase = ExecPhase::Opening;
        Ok(())
    }

    async fn tick(&self) -> Result<Decision, EngineError> {
        if *self.ctx.cancel.borrow() {
            return Err(EngineError::Cancelled);
        }

        let phase = self.state.lock().phase;
        match phase {
            ExecPhase::Init => {
                self.initialize().await?;
                let pool = self.ensure_pool().await?;
                self.open_chain(&pool).await?;
                self.observe_and_evaluate(&pool).await
            }
            ExecPhase::Opening => {
                let pool = self.ensure_pool().await?;
                self.open_chain(&pool).await?;
                self.observe_and_evaluate(&pool).await
            }
            ExecPhase::Tracking => {
                let pool = self.ensure_pool().await?;
                self.observe_and_evaluate(&pool).await
            }
            ExecPhase::Done => Ok(Decision::Complete),
            _ => Ok(Decision::Hold),
        }
    }

    async fn handle(&self, decision: Decision) -> Result<(), EngineError> {
        match decision {
            Decision::Hold | Decision::Complete => Ok(()),
            Decision::RecenterUp => self.shift(true).await,
            Decision::RecenterDown => self.shift(false).await,
            Decision::Harvest => self.harvest_all().await,
            Decision::StopLoss => self.close_out(CloseReason::StopLoss).await,
        }
    }

    async fn teardown(&self, reason: CloseReason) -> Result<(), EngineError> {
        if self.state.lock().links.is_empty() {
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

        if on_chain.is_empty() {
            if recorded.is_empty() {
                self.state.lock().phase = ExecPhase::Opening;
                return Ok(RecoverOutcome::Clean);
            }
            self.enter_error("orphaned".into());
            return Ok(RecoverOutcome::Orphaned);
        }

        let on_chain_addrs: Vec<String> =
            on_chain.iter().map(|p| p.address.to_string()).collect();
        let adopted = on_chain_addrs
            .iter()
            .filter(|a| !recorded.contains(a))
            .count();
        let missing = recorded
            .iter()
            .filter(|a| !on_chain_addrs.contains(a))
            .count();

        let mut links = on_chain;
        links.sort_by_key(|p| p.lower_bin);
        {
            let mut state = self.state.lock();
            state.links = links;
            state.phase = ExecPhase::Tracking;
            state.adverse_since = None;
        }

        if adopted == 0 && missing == 0 {
            Ok(RecoverOutcome::Clean)
        } else {
            info!(
                instance = %self.ctx.instance_id,
                adopted,
                forgotten = missing,
                "chain reconciled from on-chain set"
            );
            Ok(RecoverOutcome::Adopted(adopted))
        }
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
            .links
            .iter()
            .map(|p| p.address.to_string())
            .collect()
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
