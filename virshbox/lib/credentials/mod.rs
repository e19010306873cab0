//! SSH certificate issuance and per-sandbox credential management.

mod authority;
mod certificate;
mod ed25519;
mod keypair;
mod manager;
mod wire;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use authority::*;
pub use certificate::*;
pub use ed25519::*;
pub use keypair::*;
pub use manager::*;
pub use wire::*;
