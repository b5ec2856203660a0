// =============================================================================
// Test kit — in-memory AMM and swap adapters for strategy-runtime tests
// =============================================================================
//
// The mock pool models just enough DLMM behavior for the executors:
//   - a settable active bin,
//   - Y liquidity above the active bin converting to X once the price rises
//     past a position's range,
//   - wallet balances debited on open and credited on close/harvest/swap,
//   - scripted failure queues per operation for retry-path tests.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;

use crate::amm::bins::bin_price;
use crate::amm::AmmAdapter;
use crate::error::EngineError;
use crate::swap::{SwapAdapter, SwapOutcome, SwapQuote};
use crate::types::{CloseOutcome, HarvestOutcome, Pool, Position, PositionSide};

pub fn test_pool() -> Pool {
    Pool {
        address: Pubkey::new_unique(),
        token_x_mint: Pubkey::new_unique(),
        token_y_mint: Pubkey::new_unique(),
        reserve_x: Pubkey::new_unique(),
        reserve_y: Pubkey::new_unique(),
        oracle: Pubkey::new_unique(),
        decimals_x: 9,
        decimals_y: 6,
        bin_step: 25,
    }
}

#[derive(Default)]
struct MockAmmState {
    active_bin: i32,
    positions: HashMap<Pubkey, Position>,
    user_x: u64,
    user_y: u64,
    /// Fees attached to every position on the next read/close/harvest.
    pending_fees: (u64, u64),
    open_errors: VecDeque<EngineError>,
    close_errors: VecDeque<EngineError>,
    opens: Vec<Position>,
    closes: Vec<Pubkey>,
    harvests: Vec<Pubkey>,
}

pub struct MockAmm {
    pub pool: Pool,
    state: Mutex<MockAmmState>,
}

impl MockAmm {
    pub fn new(active_bin: i32, user_y: u64) -> Arc<Self> {
        Arc::new(Self {
            pool: test_pool(),
            state: Mutex::new(MockAmmState {
                active_bin,
                user_y,
                ..Default::default()
            }),
        })
    }

    pub fn set_active(&self, bin: i32) {
        self.state.lock().active_bin = bin;
    }

    pub fn set_pending_fees(&self, fees_x: u64, fees_y: u64) {
        self.state.lock().pending_fees = (fees_x, fees_y);
    }

    pub fn push_open_error(&self, error: EngineError) {
        self.state.lock().open_errors.push_back(error);
    }

    pub fn push_close_error(&self, error: EngineError) {
        self.state.lock().close_errors.push_back(error);
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens.len()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes.len()
    }

    pub fn harvest_count(&self) -> usize {
        self.state.lock().harvests.len()
    }

    pub fn live_positions(&self) -> Vec<Position> {
        self.state.lock().positions.values().cloned().collect()
    }

    pub fn balances(&self) -> (u64, u64) {
        let s = self.state.lock();
        (s.user_x, s.user_y)
    }

    pub fn set_balances(&self, x: u64, y: u64) {
        let mut s = self.state.lock();
        s.user_x = x;
        s.user_y = y;
    }

    /// Drop a position from the chain without going through close (crash
    /// and orphan scenarios).
    pub fn vanish_position(&self, address: &Pubkey) {
        self.state.lock().positions.remove(address);
    }

    /// Inject a position as if created by a previous process run.
    pub fn seed_position(&self, position: Position) {
        self.state
            .lock()
            .positions
            .insert(position.address, position);
    }

    fn price_at(&self, bin: i32) -> f64 {
        bin_price(bin, self.pool.bin_step, self.pool.decimals_x, self.pool.decimals_y)
    }
}

#[async_trait]
impl AmmAdapter for MockAmm {
    async fn read_pool(&self, _address: &Pubkey) -> Result<Pool, EngineError> {
        Ok(self.pool.clone())
    }

    async fn read_active_bin(&self, _pool: &Pool) -> Result<i32, EngineError> {
        Ok(self.state.lock().active_bin)
    }

    async fn read_positions_for_owner(
        &self,
        _pool: &Pool,
        owner: &Pubkey,
    ) -> Result<Vec<Position>, EngineError> {
        let state = self.state.lock();
        Ok(state
            .positions
            .values()
            .filter(|p| p.owner == *owner)
            .map(|p| {
                let mut p = p.clone();
                p.fees_x_raw = state.pending_fees.0;
                p.fees_y_raw = state.pending_fees.1;
                p
            })
            .collect())
    }

    async fn read_user_balance(
        &self,
        _pool: &Pool,
        _owner: &Pubkey,
    ) -> Result<(u64, u64), EngineError> {
        Ok(self.balances())
    }

    async fn open_position(
        &self,
        pool: &Pool,
        side: PositionSide,
        amount_raw: u64,
        lower_bin: i32,
        upper_bin: i32,
        _slippage_bps: u16,
    ) -> Result<Position, EngineError> {
        let mut state = self.state.lock();
        if let Some(err) = state.open_errors.pop_front() {
            return Err(err);
        }
        if amount_raw == 0 {
            return Err(EngineError::Validation("cannot open with zero amount".into()));
        }

        let (amount_x, amount_y) = match side {
            PositionSide::Y => {
                if state.user_y < amount_raw {
                    return Err(EngineError::OnChainTerminal(
                        "insufficient funds for deposit".into(),
                    ));
                }
                state.user_y -= amount_raw;
                (0, amount_raw)
            }
            PositionSide::X => {
                if state.user_x < amount_raw {
                    return Err(EngineError::OnChainTerminal(
                        "insufficient funds for deposit".into(),
                    ));
                }
                state.user_x -= amount_raw;
                (amount_raw, 0)
            }
            PositionSide::Xy => {
                let half = amount_raw / 2;
                if state.user_y < half {
                    return Err(EngineError::OnChainTerminal(
                        "insufficient funds for deposit".into(),
                    ));
                }
                state.user_y -= half;
                (0, half)
            }
        };

        let position = Position {
            address: Pubkey::new_unique(),
            pool: pool.address,
            owner: mock_owner(),
            lower_bin,
            upper_bin,
            amount_x_raw: amount_x,
            amount_y_raw: amount_y,
            fees_x_raw: 0,
            fees_y_raw: 0,
        };
        state.positions.insert(position.address, position.clone());
        state.opens.push(position.clone());
        Ok(position)
    }

    async fn close_position(
        &self,
        _pool: &Pool,
        position: &Position,
        _slippage_bps: u16,
    ) -> Result<CloseOutcome, EngineError> {
        let mut state = self.state.lock();
        if let Some(err) = state.close_errors.pop_front() {
            return Err(err);
        }

        let stored = state.positions.remove(&position.address).ok_or_else(|| {
            EngineError::NotFound(format!("position {} does not exist", position.address))
        })?;

        // Price above the range converts Y liquidity to X; below leaves it
        // untouched. In-range positions return their original split.
        let active = state.active_bin;
        let (x_out, y_out) = if active > stored.upper_bin {
            let price = self.price_at(active);
            let y_ui = stored.amount_y_raw as f64 / 10f64.powi(self.pool.decimals_y as i32);
            let converted_x =
                ((y_ui / price) * 10f64.powi(self.pool.decimals_x as i32)).round() as u64;
            (stored.amount_x_raw + converted_x, 0)
        } else {
            (stored.amount_x_raw, stored.amount_y_raw)
        };

        let (fees_x, fees_y) = state.pending_fees;
        state.user_x += x_out + fees_x;
        state.user_y += y_out + fees_y;
        state.closes.push(stored.address);

        Ok(CloseOutcome {
            x_raw_returned: x_out,
            y_raw_returned: y_out,
            fees_x_raw: fees_x,
            fees_y_raw: fees_y,
        })
    }

    async fn harvest_fees(
        &self,
        _pool: &Pool,
        position: &Position,
    ) -> Result<HarvestOutcome, EngineError> {
        let mut state = self.state.lock();
        if !state.positions.contains_key(&position.address) {
            return Err(EngineError::NotFound(format!(
                "position {} does not exist",
                position.address
            )));
        }
        let (fees_x, fees_y) = state.pending_fees;
        state.pending_fees = (0, 0);
        state.user_x += fees_x;
        state.user_y += fees_y;
        state.harvests.push(position.address);
        Ok(HarvestOutcome {
            fees_x_raw: fees_x,
            fees_y_raw: fees_y,
        })
    }
}

/// All mock positions belong to one well-known owner.
pub fn mock_owner() -> Pubkey {
    Pubkey::new_from_array([7u8; 32])
}

// ---------------------------------------------------------------------------
// Mock swap
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockSwapState {
    quote_errors: VecDeque<EngineError>,
    execute_errors: VecDeque<EngineError>,
    executed: Vec<(Pubkey, Pubkey, u64, u64)>,
}

/// Swaps at the pool's current active-bin price, settling against the
/// MockAmm wallet balances.
pub struct MockSwap {
    amm: Arc<MockAmm>,
    state: Mutex<MockSwapState>,
}

impl MockSwap {
    pub fn new(amm: Arc<MockAmm>) -> Arc<Self> {
        Arc::new(Self {
            amm,
            state: Mutex::new(MockSwapState::default()),
        })
    }

    pub fn push_quote_error(&self, error: EngineError) {
        self.state.lock().quote_errors.push_back(error);
    }

    pub fn push_execute_error(&self, error: EngineError) {
        self.state.lock().execute_errors.push_back(error);
    }

    pub fn executed_swaps(&self) -> Vec<(Pubkey, Pubkey, u64, u64)> {
        self.state.lock().executed.clone()
    }

    fn convert(&self, input_mint: &Pubkey, amount_raw: u64) -> u64 {
        let pool = &self.amm.pool;
        let active = self.amm.state.lock().active_bin;
        let price = bin_price(active, pool.bin_step, pool.decimals_x, pool.decimals_y);
        if *input_mint == pool.token_x_mint {
            // X -> Y
            let x_ui = amount_raw as f64 / 10f64.powi(pool.decimals_x as i32);
            ((x_ui * price) * 10f64.powi(pool.decimals_y as i32)).round() as u64
        } else {
            // Y -> X
            let y_ui = amount_raw as f64 / 10f64.powi(pool.decimals_y as i32);
            ((y_ui / price) * 10f64.powi(pool.decimals_x as i32)).round() as u64
        }
    }
}

#[async_trait]
impl SwapAdapter for MockSwap {
    async fn quote(
        &self,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount_raw: u64,
        slippage_bps: u16,
        _protection_flags: &serde_json::Value,
    ) -> Result<SwapQuote, EngineError> {
        if let Some(err) = self.state.lock().quote_errors.pop_front() {
            return Err(err);
        }
        let out = self.convert(input_mint, amount_raw);
        let min_out = out - (out as u128 * slippage_bps as u128 / 10_000) as u64;
        Ok(SwapQuote {
            route: serde_json::json!({"mock": true}),
            input_mint: *input_mint,
            output_mint: *output_mint,
            amount_in_raw: amount_raw,
            min_out_raw: min_out,
            est_price: if amount_raw > 0 {
                out as f64 / amount_raw as f64
            } else {
                0.0
            },
        })
    }

    async fn execute(&self, quote: &SwapQuote) -> Result<SwapOutcome, EngineError> {
        if let Some(err) = self.state.lock().execute_errors.pop_front() {
            return Err(err);
        }
        let out = self.convert(&quote.input_mint, quote.amount_in_raw);

        // Settle against the mock wallet.
        {
            let pool = &self.amm.pool;
            let mut amm = self.amm.state.lock();
            if quote.input_mint == pool.token_x_mint {
                amm.user_x = amm.user_x.saturating_sub(quote.amount_in_raw);
                amm.user_y += out;
            } else {
                amm.user_y = amm.user_y.saturating_sub(quote.amount_in_raw);
                amm.user_x += out;
            }
        }

        self.state.lock().executed.push((
            quote.input_mint,
            quote.output_mint,
            quote.amount_in_raw,
            out,
        ));

        Ok(SwapOutcome {
            signature: "MockSig1111111111111111111111111111111111111".into(),
            out_raw: out,
            effective_price: quote.est_price,
        })
    }
}
