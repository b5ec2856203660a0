// =============================================================================
// AMM Adapter — high-level DLMM position operations over the Chain Gateway
// =============================================================================
//
// Translates open / close / harvest / read into pool-program calls. Account
// layouts use the essential-field offsets from the Anchor discriminator;
// only the fields the runtime needs are decoded.
//
// Executors depend on the `AmmAdapter` trait, never on this concrete
// implementation, so the whole strategy runtime runs against an in-memory
// pool in tests.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use solana_account_decoder::UiAccountEncoding;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::system_program;
use solana_sdk::transaction::Transaction;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::amm::bins::{anchored_range, bin_price, validate_width};
use crate::amm::precision::TokenPrecisionCache;
use crate::chain::wallet::Wallet;
use crate::chain::{ChainGateway, ConfirmStatus};
use crate::error::{classify_remote_error, EngineError};
use crate::types::{CloseOutcome, HarvestOutcome, Pool, Position, PositionSide};

/// DLMM pool program.
pub const DLMM_PROGRAM_ID: &str = "LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo";
/// Associated token account program.
const ATA_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

// Anchor instruction discriminators (sha256("global:<name>")[..8]).
const IX_INITIALIZE_POSITION: [u8; 8] = [0xdb, 0x0b, 0x54, 0x8a, 0x4f, 0x8a, 0xd1, 0x85];
const IX_ADD_LIQUIDITY: [u8; 8] = [0xa9, 0x17, 0x3c, 0x5a, 0x4b, 0x82, 0x6e, 0x2d];
const IX_REMOVE_ALL_LIQUIDITY: [u8; 8] = [0x0a, 0x33, 0x9d, 0x67, 0xd2, 0x87, 0x41, 0xee];
const IX_CLAIM_FEE: [u8; 8] = [0xa9, 0x20, 0x4f, 0x89, 0x88, 0xe8, 0x46, 0x89];
const IX_CLOSE_POSITION: [u8; 8] = [0x7b, 0x86, 0x51, 0x00, 0x31, 0x44, 0x6f, 0x4b];

// LbPair essential-field offsets (after the 8-byte discriminator).
const PAIR_BIN_STEP_OFFSET: usize = 8;
const PAIR_ACTIVE_ID_OFFSET: usize = 10;
const PAIR_RESERVE_X_OFFSET: usize = 16;
const PAIR_RESERVE_Y_OFFSET: usize = 48;
const PAIR_MINT_X_OFFSET: usize = 80;
const PAIR_MINT_Y_OFFSET: usize = 112;
const PAIR_ORACLE_OFFSET: usize = 144;
const PAIR_MIN_LEN: usize = 176;

// Position essential-field offsets.
const POS_PAIR_OFFSET: usize = 8;
const POS_OWNER_OFFSET: usize = 40;
const POS_LOWER_BIN_OFFSET: usize = 72;
const POS_UPPER_BIN_OFFSET: usize = 76;
const POS_AMOUNT_X_OFFSET: usize = 80;
const POS_AMOUNT_Y_OFFSET: usize = 88;
const POS_FEE_X_OFFSET: usize = 96;
const POS_FEE_Y_OFFSET: usize = 104;
const POS_MIN_LEN: usize = 112;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// High-level pool operations the strategy runtime consumes.
#[async_trait]
pub trait AmmAdapter: Send + Sync {
    async fn read_pool(&self, address: &Pubkey) -> Result<Pool, EngineError>;

    async fn read_active_bin(&self, pool: &Pool) -> Result<i32, EngineError>;

    async fn read_positions_for_owner(
        &self,
        pool: &Pool,
        owner: &Pubkey,
    ) -> Result<Vec<Position>, EngineError>;

    /// Raw (X, Y) wallet balances for the pool's pair.
    async fn read_user_balance(
        &self,
        pool: &Pool,
        owner: &Pubkey,
    ) -> Result<(u64, u64), EngineError>;

    /// Open a position of the given side anchored over `[lower, upper]`.
    async fn open_position(
        &self,
        pool: &Pool,
        side: PositionSide,
        amount_raw: u64,
        lower_bin: i32,
        upper_bin: i32,
        slippage_bps: u16,
    ) -> Result<Position, EngineError>;

    async fn close_position(
        &self,
        pool: &Pool,
        position: &Position,
        slippage_bps: u16,
    ) -> Result<CloseOutcome, EngineError>;

    async fn harvest_fees(
        &self,
        pool: &Pool,
        position: &Position,
    ) -> Result<HarvestOutcome, EngineError>;

    /// Human-scaled spot price (Y per X) at the current active bin.
    async fn spot_price(&self, pool: &Pool) -> Result<f64, EngineError> {
        let active = self.read_active_bin(pool).await?;
        Ok(bin_price(
            active,
            pool.bin_step,
            pool.decimals_x,
            pool.decimals_y,
        ))
    }
}

// ---------------------------------------------------------------------------
// RPC implementation
// ---------------------------------------------------------------------------

pub struct RpcAmmAdapter {
    gateway: Arc<ChainGateway>,
    wallet: Wallet,
    precision: TokenPrecisionCache,
    program_id: Pubkey,
    priority_fee_microlamports: u64,
    /// The wallet is a single writer: submissions are serialized so the
    /// blockhash/nonce view stays FIFO per process.
    submit_lock: Mutex<()>,
}

impl RpcAmmAdapter {
    pub fn new(
        gateway: Arc<ChainGateway>,
        wallet: Wallet,
        precision: TokenPrecisionCache,
        priority_fee_microlamports: u64,
    ) -> Self {
        let program_id =
            Pubkey::from_str(DLMM_PROGRAM_ID).expect("DLMM program id is a valid pubkey");
        Self {
            gateway,
            wallet,
            precision,
            program_id,
            priority_fee_microlamports,
            submit_lock: Mutex::new(()),
        }
    }

    fn ata_program() -> Pubkey {
        Pubkey::from_str(ATA_PROGRAM_ID).expect("ATA program id is a valid pubkey")
    }

    /// Derive the owner's associated token account for `mint`.
    pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(
            &[owner.as_ref(), spl_token::id().as_ref(), mint.as_ref()],
            &Self::ata_program(),
        )
        .0
    }

    fn parse_pubkey(data: &[u8], offset: usize) -> Result<Pubkey, EngineError> {
        let bytes: [u8; 32] = data
            .get(offset..offset + 32)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                EngineError::Internal(format!("account data too short for pubkey at {offset}"))
            })?;
        Ok(Pubkey::new_from_array(bytes))
    }

    fn parse_u64(data: &[u8], offset: usize) -> Result<u64, EngineError> {
        let bytes: [u8; 8] = data
            .get(offset..offset + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                EngineError::Internal(format!("account data too short for u64 at {offset}"))
            })?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn parse_i32(data: &[u8], offset: usize) -> Result<i32, EngineError> {
        let bytes: [u8; 4] = data
            .get(offset..offset + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                EngineError::Internal(format!("account data too short for i32 at {offset}"))
            })?;
        Ok(i32::from_le_bytes(bytes))
    }

    fn parse_position(address: &Pubkey, data: &[u8]) -> Result<Position, EngineError> {
        if data.len() < POS_MIN_LEN {
            return Err(EngineError::Internal(format!(
                "position account {address} too small: {} bytes",
                data.len()
            )));
        }
        Ok(Position {
            address: *address,
            pool: Self::parse_pubkey(data, POS_PAIR_OFFSET)?,
            owner: Self::parse_pubkey(data, POS_OWNER_OFFSET)?,
            lower_bin: Self::parse_i32(data, POS_LOWER_BIN_OFFSET)?,
            upper_bin: Self::parse_i32(data, POS_UPPER_BIN_OFFSET)?,
            amount_x_raw: Self::parse_u64(data, POS_AMOUNT_X_OFFSET)?,
            amount_y_raw: Self::parse_u64(data, POS_AMOUNT_Y_OFFSET)?,
            fees_x_raw: Self::parse_u64(data, POS_FEE_X_OFFSET)?,
            fees_y_raw: Self::parse_u64(data, POS_FEE_Y_OFFSET)?,
        })
    }

    /// Submit a transaction holding the wallet's writer lock, then confirm.
    /// Confirmation timeouts surface as retryable; on-chain failures as
    /// terminal, classified by message.
    async fn submit_and_confirm(&self, tx: &Transaction) -> Result<(), EngineError> {
        let _writer = self.submit_lock.lock().await;
        let signature = self.gateway.submit_transaction(tx).await?;
        debug!(%signature, "transaction submitted");

        match self.gateway.confirm_signature(&signature, None).await? {
            ConfirmStatus::Confirmed => Ok(()),
            ConfirmStatus::FailedOnChain(reason) => Err(classify_remote_error(&reason)),
            ConfirmStatus::Timeout => Err(EngineError::TransientRpc(format!(
                "confirmation timeout for {signature}"
            ))),
        }
    }

    async fn build_tx(&self, mut instructions: Vec<Instruction>, extra_signer: Option<&Keypair>) -> Result<Transaction, EngineError> {
        let mut ixs = vec![ComputeBudgetInstruction::set_compute_unit_price(
            self.priority_fee_microlamports,
        )];
        ixs.append(&mut instructions);

        let blockhash = self.gateway.latest_blockhash().await?;
        let payer = self.wallet.pubkey();
        let tx = match extra_signer {
            Some(signer) => Transaction::new_signed_with_payer(
                &ixs,
                Some(&payer),
                &[self.wallet.keypair(), signer],
                blockhash,
            ),
            None => Transaction::new_signed_with_payer(
                &ixs,
                Some(&payer),
                &[self.wallet.keypair()],
                blockhash,
            ),
        };
        Ok(tx)
    }

    fn position_accounts(&self, pool: &Pool, position: &Pubkey, owner: &Pubkey) -> Vec<AccountMeta> {
        let user_x = Self::associated_token_address(owner, &pool.token_x_mint);
        let user_y = Self::associated_token_address(owner, &pool.token_y_mint);
        vec![
            AccountMeta::new(*position, false),
            AccountMeta::new(pool.address, false),
            AccountMeta::new(pool.reserve_x, false),
            AccountMeta::new(pool.reserve_y, false),
            AccountMeta::new(user_x, false),
            AccountMeta::new(user_y, false),
            AccountMeta::new_readonly(pool.token_x_mint, false),
            AccountMeta::new_readonly(pool.token_y_mint, false),
            AccountMeta::new_readonly(pool.oracle, false),
            AccountMeta::new(*owner, true),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ]
    }

}

#[async_trait]
impl AmmAdapter for RpcAmmAdapter {
    #[instrument(skip(self), name = "amm::read_pool")]
    async fn read_pool(&self, address: &Pubkey) -> Result<Pool, EngineError> {
        let account = self.gateway.get_account(address).await?;
        if account.owner != self.program_id {
            return Err(EngineError::Validation(format!(
                "{address} is not a DLMM pool (owner {})",
                account.owner
            )));
        }
        let data = &account.data;
        if data.len() < PAIR_MIN_LEN {
            return Err(EngineError::Internal(format!(
                "pool account {address} too small: {} bytes",
                data.len()
            )));
        }

        let bin_step = u16::from_le_bytes(
            data[PAIR_BIN_STEP_OFFSET..PAIR_BIN_STEP_OFFSET + 2]
                .try_into()
                .map_err(|_| EngineError::Internal("bin_step read failed".into()))?,
        );
        let token_x_mint = Self::parse_pubkey(data, PAIR_MINT_X_OFFSET)?;
        let token_y_mint = Self::parse_pubkey(data, PAIR_MINT_Y_OFFSET)?;

        // Both mints' precision is resolved before the pool is handed to any
        // caller: raw amounts never travel without their decimals.
        let decimals_x = self.precision.decimals(&token_x_mint).await?;
        let decimals_y = self.precision.decimals(&token_y_mint).await?;

        let pool = Pool {
            address: *address,
            token_x_mint,
            token_y_mint,
            reserve_x: Self::parse_pubkey(data, PAIR_RESERVE_X_OFFSET)?,
            reserve_y: Self::parse_pubkey(data, PAIR_RESERVE_Y_OFFSET)?,
            oracle: Self::parse_pubkey(data, PAIR_ORACLE_OFFSET)?,
            decimals_x,
            decimals_y,
            bin_step,
        };
        debug!(pool = %address, bin_step, decimals_x, decimals_y, "pool loaded");
        Ok(pool)
    }

    async fn read_active_bin(&self, pool: &Pool) -> Result<i32, EngineError> {
        let account = self.gateway.get_account(&pool.address).await?;
        Self::parse_i32(&account.data, PAIR_ACTIVE_ID_OFFSET)
    }

    #[instrument(skip(self, pool), name = "amm::read_positions")]
    async fn read_positions_for_owner(
        &self,
        pool: &Pool,
        owner: &Pubkey,
    ) -> Result<Vec<Position>, EngineError> {
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![
                RpcFilterType::Memcmp(Memcmp::new_base58_encoded(
                    POS_PAIR_OFFSET,
                    pool.address.as_ref(),
                )),
                RpcFilterType::Memcmp(Memcmp::new_base58_encoded(
                    POS_OWNER_OFFSET,
                    owner.as_ref(),
                )),
            ]),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                ..Default::default()
            },
            ..Default::default()
        };

        let accounts = self
            .gateway
            .get_program_accounts(&self.program_id, config)
            .await?;

        let mut positions = Vec::with_capacity(accounts.len());
        for (address, account) in accounts {
            positions.push(Self::parse_position(&address, &account.data)?);
        }
        debug!(owner = %owner, count = positions.len(), "positions read");
        Ok(positions)
    }

    async fn read_user_balance(
        &self,
        pool: &Pool,
        owner: &Pubkey,
    ) -> Result<(u64, u64), EngineError> {
        let x = self
            .gateway
            .get_token_balance(&Self::associated_token_address(owner, &pool.token_x_mint))
            .await?;
        let y = self
            .gateway
            .get_token_balance(&Self::associated_token_address(owner, &pool.token_y_mint))
            .await?;
        Ok((x, y))
    }

    #[instrument(skip(self, pool), fields(pool = %pool.address), name = "amm::open_position")]
    async fn open_position(
        &self,
        pool: &Pool,
        side: PositionSide,
        amount_raw: u64,
        lower_bin: i32,
        upper_bin: i32,
        slippage_bps: u16,
    ) -> Result<Position, EngineError> {
        let width = (upper_bin - lower_bin + 1).max(0) as u32;
        validate_width(width)?;
        if amount_raw == 0 {
            return Err(EngineError::Validation("cannot open with zero amount".into()));
        }

        // Split the deposit across sides according to the position shape.
        let (amount_x, amount_y) = match side {
            PositionSide::Y => (0u64, amount_raw),
            PositionSide::X => (amount_raw, 0u64),
            PositionSide::Xy => {
                let price = self.spot_price(pool).await?;
                let half_y = amount_raw / 2;
                let scale =
                    10_f64.powi(pool.decimals_x as i32 - pool.decimals_y as i32);
                let half_x = ((amount_raw - half_y) as f64 / price * scale) as u64;
                (half_x, half_y)
            }
        };

        let position_kp = Keypair::new();
        let position_addr = position_kp.pubkey();
        let owner = self.wallet.pubkey();

        let mut init_data = Vec::with_capacity(16);
        init_data.extend_from_slice(&IX_INITIALIZE_POSITION);
        init_data.extend_from_slice(&lower_bin.to_le_bytes());
        init_data.extend_from_slice(&(width as i32).to_le_bytes());

        let mut add_data = Vec::with_capacity(34);
        add_data.extend_from_slice(&IX_ADD_LIQUIDITY);
        add_data.extend_from_slice(&amount_x.to_le_bytes());
        add_data.extend_from_slice(&amount_y.to_le_bytes());
        add_data.extend_from_slice(&lower_bin.to_le_bytes());
        add_data.extend_from_slice(&upper_bin.to_le_bytes());
        add_data.extend_from_slice(&slippage_bps.to_le_bytes());

        let accounts = self.position_accounts(pool, &position_addr, &owner);
        let instructions = vec![
            Instruction {
                program_id: self.program_id,
                accounts: accounts.clone(),
                data: init_data,
            },
            Instruction {
                program_id: self.program_id,
                accounts,
                data: add_data,
            },
        ];

        let tx = self.build_tx(instructions, Some(&position_kp)).await?;
        self.submit_and_confirm(&tx).await?;

        info!(
            position = %position_addr,
            side = %side,
            lower_bin,
            upper_bin,
            amount_raw,
            "position opened"
        );

        // Read back the created account; fall back to the deposit amounts
        // when the account is not yet visible at our commitment.
        match self.gateway.get_account(&position_addr).await {
            Ok(account) => Self::parse_position(&position_addr, &account.data),
            Err(_) => Ok(Position {
                address: position_addr,
                pool: pool.address,
                owner,
                lower_bin,
                upper_bin,
                amount_x_raw: amount_x,
                amount_y_raw: amount_y,
                fees_x_raw: 0,
                fees_y_raw: 0,
            }),
        }
    }

    #[instrument(skip(self, pool, position), fields(position = %position.address), name = "amm::close_position")]
    async fn close_position(
        &self,
        pool: &Pool,
        position: &Position,
        slippage_bps: u16,
    ) -> Result<CloseOutcome, EngineError> {
        // Pending fees are read before the close so the outcome can split
        // capital from fees out of the balance delta.
        let pending = match self.gateway.get_account(&position.address).await {
            Ok(account) => Self::parse_position(&position.address, &account.data)?,
            Err(EngineError::NotFound(_)) => {
                return Err(EngineError::NotFound(format!(
                    "position {} does not exist",
                    position.address
                )))
            }
            Err(e) => return Err(e),
        };
        let owner_key = self.wallet.pubkey();
        let (before_x, before_y) = self.read_user_balance(pool, &owner_key).await?;

        let owner = self.wallet.pubkey();
        let accounts = self.position_accounts(pool, &position.address, &owner);

        let mut remove_data = Vec::with_capacity(10);
        remove_data.extend_from_slice(&IX_REMOVE_ALL_LIQUIDITY);
        remove_data.extend_from_slice(&slippage_bps.to_le_bytes());

        let instructions = vec![
            Instruction {
                program_id: self.program_id,
                accounts: accounts.clone(),
                data: remove_data,
            },
            Instruction {
                program_id: self.program_id,
                accounts: accounts.clone(),
                data: IX_CLAIM_FEE.to_vec(),
            },
            Instruction {
                program_id: self.program_id,
                accounts,
                data: IX_CLOSE_POSITION.to_vec(),
            },
        ];

        let tx = self.build_tx(instructions, None).await?;
        self.submit_and_confirm(&tx).await?;

        let (after_x, after_y) = self.read_user_balance(pool, &owner_key).await?;
        let delta_x = after_x.saturating_sub(before_x);
        let delta_y = after_y.saturating_sub(before_y);

        let outcome = CloseOutcome {
            x_raw_returned: delta_x.saturating_sub(pending.fees_x_raw),
            y_raw_returned: delta_y.saturating_sub(pending.fees_y_raw),
            fees_x_raw: pending.fees_x_raw.min(delta_x),
            fees_y_raw: pending.fees_y_raw.min(delta_y),
        };

        info!(
            position = %position.address,
            x_returned = outcome.x_raw_returned,
            y_returned = outcome.y_raw_returned,
            fees_x = outcome.fees_x_raw,
            fees_y = outcome.fees_y_raw,
            "position closed"
        );
        Ok(outcome)
    }

    #[instrument(skip(self, pool, position), fields(position = %position.address), name = "amm::harvest_fees")]
    async fn harvest_fees(
        &self,
        pool: &Pool,
        position: &Position,
    ) -> Result<HarvestOutcome, EngineError> {
        let account = self.gateway.get_account(&position.address).await?;
        let pending = Self::parse_position(&position.address, &account.data)?;
        if pending.fees_x_raw == 0 && pending.fees_y_raw == 0 {
            debug!(position = %position.address, "nothing to harvest");
            return Ok(HarvestOutcome::default());
        }

        let owner = self.wallet.pubkey();
        let instructions = vec![Instruction {
            program_id: self.program_id,
            accounts: self.position_accounts(pool, &position.address, &owner),
            data: IX_CLAIM_FEE.to_vec(),
        }];

        let tx = self.build_tx(instructions, None).await?;
        self.submit_and_confirm(&tx).await?;

        info!(
            position = %position.address,
            fees_x = pending.fees_x_raw,
            fees_y = pending.fees_y_raw,
            "fees harvested"
        );
        Ok(HarvestOutcome {
            fees_x_raw: pending.fees_x_raw,
            fees_y_raw: pending.fees_y_raw,
        })
    }
}

/// Anchor a new position's range for the configured side at the current
/// active bin. Exposed for executors so the anchoring rule lives in one
/// place.
pub fn anchor_position(side: PositionSide, active: i32, width: u32) -> (i32, i32) {
    anchored_range(side, active, width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_position_essential_fields() {
        let addr = Pubkey::new_unique();
        let pair = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let mut data = vec![0u8; POS_MIN_LEN];
        data[POS_PAIR_OFFSET..POS_PAIR_OFFSET + 32].copy_from_slice(pair.as_ref());
        data[POS_OWNER_OFFSET..POS_OWNER_OFFSET + 32].copy_from_slice(owner.as_ref());
        data[POS_LOWER_BIN_OFFSET..POS_LOWER_BIN_OFFSET + 4]
            .copy_from_slice(&500i32.to_le_bytes());
        data[POS_UPPER_BIN_OFFSET..POS_UPPER_BIN_OFFSET + 4]
            .copy_from_slice(&509i32.to_le_bytes());
        data[POS_AMOUNT_Y_OFFSET..POS_AMOUNT_Y_OFFSET + 8]
            .copy_from_slice(&25_000u64.to_le_bytes());
        data[POS_FEE_Y_OFFSET..POS_FEE_Y_OFFSET + 8].copy_from_slice(&42u64.to_le_bytes());

        let pos = RpcAmmAdapter::parse_position(&addr, &data).unwrap();
        assert_eq!(pos.pool, pair);
        assert_eq!(pos.owner, owner);
        assert_eq!(pos.lower_bin, 500);
        assert_eq!(pos.upper_bin, 509);
        assert_eq!(pos.amount_y_raw, 25_000);
        assert_eq!(pos.fees_y_raw, 42);
        assert_eq!(pos.width(), 10);
    }

    #[test]
    fn parse_position_rejects_short_data() {
        let addr = Pubkey::new_unique();
        let err = RpcAmmAdapter::parse_position(&addr, &[0u8; 50]).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn ata_derivation_is_deterministic() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let a = RpcAmmAdapter::associated_token_address(&owner, &mint);
        let b = RpcAmmAdapter::associated_token_address(&owner, &mint);
        assert_eq!(a, b);
        assert_ne!(
            a,
            RpcAmmAdapter::associated_token_address(&owner, &Pubkey::new_unique())
        );
    }

    #[test]
    fn negative_bin_ids_parse() {
        let addr = Pubkey::new_unique();
        let mut data = vec![0u8; POS_MIN_LEN];
        data[POS_LOWER_BIN_OFFSET..POS_LOWER_BIN_OFFSET + 4]
            .copy_from_slice(&(-34i32).to_le_bytes());
        data[POS_UPPER_BIN_OFFSET..POS_UPPER_BIN_OFFSET + 4]
            .copy_from_slice(&(-25i32).to_le_bytes());
        let pos = RpcAmmAdapter::parse_position(&addr, &data).unwrap();
        assert_eq!(pos.lower_bin, -34);
        assert_eq!(pos.upper_bin, -25);
        assert_eq!(pos.width(), 10);
    }
}
