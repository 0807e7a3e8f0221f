//! Revision-independent device layer: versioned driver handles with crash
//! recovery, prepared-model wrappers, fences, and the compiled-artifact
//! cache naming scheme.

pub mod allocate;
pub mod cache;
pub mod driver;
pub mod fence;
pub mod prepared;
pub mod versioned;

pub use allocate::*;
pub use cache::*;
pub use driver::*;
pub use fence::*;
pub use prepared::*;
pub use versioned::VersionedDevice;
