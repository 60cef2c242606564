// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators driving the grid
// signal. State-carrying indicators (SAR, CCI history) are explicit value
// types so they persist trivially across restarts.

pub mod cci;
pub mod lwma;
pub mod sar;

pub use cci::CciState;
pub use lwma::lwma;
pub use sar::SarState;
