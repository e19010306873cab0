//! Running host-side command lines locally or over an SSH transport.

mod command;
mod executor;
mod local;
mod shell;
mod ssh;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use executor::*;
pub use local::*;
pub use shell::*;
pub use ssh::*;
