// =============================================================================
// Bin math — DLMM price buckets and range anchoring
// =============================================================================
//
// A DLMM pool quantises price into bins: bin `i` trades at
// `(1 + bin_step / 10_000)^i`, a raw lamport-per-lamport ratio. The human
// price additionally carries both mints' decimals. Positions are declared
// over an inclusive bin range; the anchoring rules below are the contract
// every executor relies on.
// =============================================================================

use crate::error::EngineError;
use crate::types::PositionSide;

/// Widest position the pool program accepts, in bins.
pub const MAX_BIN_RANGE: u32 = 69;

/// Raw price ratio of bin `bin_id` (Y lamports per X lamport).
pub fn bin_price_raw(bin_id: i32, bin_step: u16) -> f64 {
    let step = bin_step as f64 / 10_000.0;
    (1.0 + step).powi(bin_id)
}

/// Human-scaled price of bin `bin_id` (Y per X), adjusted by both mints'
/// true decimals.
pub fn bin_price(bin_id: i32, bin_step: u16, decimals_x: u8, decimals_y: u8) -> f64 {
    bin_price_raw(bin_id, bin_step) * 10_f64.powi(decimals_x as i32 - decimals_y as i32)
}

/// Validate a configured bin-range width.
pub fn validate_width(width: u32) -> Result<(), EngineError> {
    if width == 0 || width > MAX_BIN_RANGE {
        return Err(EngineError::Validation(format!(
            "bin range must be 1..={MAX_BIN_RANGE}, got {width}"
        )));
    }
    Ok(())
}

/// Inclusive bin range for a position of `width` anchored at `active`:
///
/// - Y-sided liquidity sits at and above the active bin,
/// - X-sided at and below,
/// - two-sided straddles it.
pub fn anchored_range(side: PositionSide, active: i32, width: u32) -> (i32, i32) {
    let w = width as i32;
    match side {
        PositionSide::Y => (active, active + w - 1),
        PositionSide::X => (active - w + 1, active),
        PositionSide::Xy => (active - w / 2, active + (w + 1) / 2 - 1),
    }
}

/// An instance is in range iff the active bin lies inside its bounds.
pub fn in_range(active: i32, lower: i32, upper: i32) -> bool {
    lower <= active && active <= upper
}
