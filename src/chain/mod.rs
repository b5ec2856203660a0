// =============================================================================
// Chain access: pooled RPC gateway + operator wallet
// =============================================================================

pub mod gateway;
pub mod wallet;

pub use gateway::{ChainGateway, ConfirmStatus};
