//! Identifiers, snapshot timing and permission bitsets shared by every crate
//! in the archiver workspace.

pub mod ids;
pub mod permissions;
pub mod timing;

pub use ids::*;
pub use permissions::Permissions;
pub use timing::Timing;
