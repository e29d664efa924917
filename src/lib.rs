//! loadtool - rate-planned load generator
//!
//! loadtool fires HTTP, HTTP/2 and scripted multi-step HTTP scenarios at a
//! target and records one latency sample per request in a phantom-compatible
//! format.
//!
//! # Architecture
//!
//! - **Schedules**: lazy rate and startup plans (`once`, `const`, `line`, ...)
//! - **Providers**: ammo decoders with limits, passes and backpressure
//! - **Guns**: `http`, `http2` and `http/scenario`
//! - **Aggregators**: bounded sample inbox drained into a sink
//! - **Pools**: one provider, aggregator and gun factory driving N instances
//! - **Engine**: runs pools concurrently under one cancellation token

pub mod aggregator;
pub mod ammo;
pub mod config;
pub mod engine;
pub mod error;
pub mod gun;
pub mod logging;
pub mod output;
pub mod provider;
pub mod registry;
pub mod sample;
pub mod scenario;
pub mod schedule;
pub mod stats;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use error::{ConfigError, EngineError, PoolError};

/// Result type used throughout loadtool
pub type Result<T> = anyhow::Result<T>;
