// =============================================================================
// Adjustments
// =============================================================================
//
// Additive price offsets configured by an operator in an external table and
// applied to the raw market price before publication.

pub mod source;
pub mod store;

pub use source::{AdjustmentSource, MySqlAdjustmentSource};
pub use store::{run_refresh_loop, AdjustmentStore};
