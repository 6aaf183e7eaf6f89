//! Shared protocol definitions for the `TaskSync` wire format.

pub mod codec;
pub mod task;
pub mod wire;
