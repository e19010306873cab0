//! Sandbox orchestration: lifecycle, guest commands, snapshots and TTL enforcement.

mod config;
#[cfg(test)]
pub(crate) mod fake;
mod janitor;
mod runner;
mod sandbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use config::*;
pub use janitor::*;
pub use runner::*;
pub use sandbox::*;
