//! ecup - upgrade planner and EC manager dispatcher for embedded clusters.
//!
//! Builds ordered upgrade plans for an installed application, executes them
//! step by step with a persisted state machine, and drives the per-node EC
//! managers over WebSocket.

pub mod api;
pub mod builder;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod plan;
pub mod registry;
pub mod store;
pub mod upgrader;
