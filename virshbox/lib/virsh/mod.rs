//! The Domain Manager: clone, lifecycle, snapshot and address discovery for the domains of one
//! host.

mod manager;
mod parse;
mod seed;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use manager::*;
pub use parse::*;
pub use seed::*;
pub use types::*;
