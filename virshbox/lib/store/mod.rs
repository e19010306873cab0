//! Persistence of sandboxes, snapshots, commands and diffs.

mod interface;
mod models;
mod sqlite;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use interface::*;
pub use models::*;
pub use sqlite::*;
