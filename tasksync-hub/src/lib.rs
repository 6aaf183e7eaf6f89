//! `TaskSync` hub -- real-time task synchronization server.
//!
//! Accepts authenticated WebSocket connections, groups them by owning
//! user, applies task mutations to the canonical store, and fans the
//! resulting change events out to every connection in the owner's group.

pub mod auth;
pub mod config;
pub mod groups;
pub mod hub;
pub mod service;
