// =============================================================================
// Swap adapter: aggregator quote + execute
// =============================================================================

pub mod jupiter;

pub use jupiter::{JupiterSwapAdapter, SwapAdapter, SwapOutcome, SwapQuote};
