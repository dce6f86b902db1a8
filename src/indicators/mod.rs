// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// trading engine. Every public function returns `Option<T>` or an empty
// series so callers are forced to handle insufficient-data scenarios.

pub mod atr;
pub mod ema;
