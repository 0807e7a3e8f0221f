pub mod capabilities;
pub mod meta;
pub mod model;
pub mod request;
pub mod revision;
pub mod status;
pub mod types;

pub use capabilities::*;
pub use meta::*;
pub use model::*;
pub use request::*;
pub use revision::*;
pub use status::*;
pub use types::*;
