// =============================================================================
// AMM adapter: DLMM pool access, bin math, token precision
// =============================================================================

pub mod adapter;
pub mod bins;
pub mod precision;

pub use adapter::{AmmAdapter, RpcAmmAdapter};
