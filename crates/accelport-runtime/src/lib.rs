//! Execution dispatch over a prepared model: synchronous, asynchronous,
//! burst, and fence-gated paths with a uniform result shape.

pub mod dispatcher;

pub use dispatcher::*;
