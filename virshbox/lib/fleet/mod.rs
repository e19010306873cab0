//! Multi-host discovery: querying every configured host concurrently and resolving which host
//! owns a domain.

mod connector;
mod discovery;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use connector::*;
pub use discovery::*;
pub use types::*;
