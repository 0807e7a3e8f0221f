pub mod controller;
pub mod fmq;
pub mod protocol;

pub use controller::*;
pub use fmq::*;
pub use protocol::*;
