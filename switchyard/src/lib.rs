//! # switchyard
//!
//! Programmable HTTP redirect gateway for A/B testing and traffic steering.
//! Inbound requests are demultiplexed by host to a routing policy (a
//! *proxy*), run through the selection pipeline (sticky cookie, routing
//! condition, weighted random), and answered with a `301` cross-host
//! redirect or a `307` same-host rewrite.
//!
//! The control plane persists policies in Postgres with an append-only
//! change journal, caches configs in Redis, and keeps replicas consistent
//! through Redis pub/sub change notices. Visit counters aggregate in memory
//! and flush to NATS.

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod pubsub;
pub mod server;
pub mod sink;
pub mod state;
pub mod storage;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;
