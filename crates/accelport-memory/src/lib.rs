pub mod memory;
pub mod pool;
pub mod validator;

pub use memory::*;
pub use pool::*;
pub use validator::*;
