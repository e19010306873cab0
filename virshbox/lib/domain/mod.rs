//! Parsing, editing and generating libvirt domain descriptors.

mod arch;
mod clone;
mod descriptor;
mod mac;
mod render;
mod xml;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use arch::*;
pub use clone::*;
pub use descriptor::*;
pub use mac::*;
pub use render::*;
pub use xml::*;
