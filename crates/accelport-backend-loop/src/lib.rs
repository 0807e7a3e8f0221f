//! Loopback in-process backend: a fault-injectable driver that executes
//! models trivially (shape propagation only). Used by tests and demos to
//! exercise every dispatch and recovery path without real hardware.

pub mod driver;

pub use driver::*;
