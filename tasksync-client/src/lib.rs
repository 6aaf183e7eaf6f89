//! `TaskSync` client library.
//!
//! Layered around the [`channel::TaskChannel`] trait:
//! - [`channel::ws::WsChannel`] -- WebSocket channel with automatic
//!   reconnection and exponential backoff
//! - [`channel::loopback::LoopbackChannel`] -- in-process recording
//!   channel for testing
//! - [`resilient::ResilientClient`] -- wraps any channel with an
//!   offline store-and-forward queue and optimistic local writes
//! - [`adapter::TaskAdapter`] -- per-user convenience layer with
//!   optional automatic lock acquisition

pub mod adapter;
pub mod channel;
pub mod config;
pub mod queue;
pub mod resilient;
