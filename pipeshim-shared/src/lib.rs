//! pipeshim shared - error taxonomy and constants
//!
//! Used by the shim I/O core and by the test fixtures so both sides agree on
//! socket names, runtime arguments and error shapes.

pub mod constants;
pub mod errors;

pub use errors::{ShimError, ShimResult};
