//! Configuration types, defaults and loading.

mod defaults;
mod host;
mod virshbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use host::*;
pub use virshbox::*;
