//! Utility functions and types.

mod clock;
mod id;
mod path;
mod teardown;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use clock::*;
pub use id::*;
pub use path::*;
pub use teardown::*;
