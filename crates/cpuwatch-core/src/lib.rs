//! cpuwatch-core: Core library for cpuwatch
//!
//! This crate provides a self-supervising CPU utilization pipeline: worker
//! threads exchange records through bounded queues with deadline-bounded
//! handoff, while a watchdog checks that every worker keeps making progress
//! and cancels the whole pipeline when one goes silent.
//!
//! # Architecture
//!
//! ```text
//! /proc/stat → Sampler ─[raw queue]→ Analyzer ─[usage queue]→ Renderer → stdout
//!                  │                     │                        │
//!                  └──── heartbeats ─────┼──── Watchdog ──────────┘
//!                                        │        │
//!            tracing ─[log queue]→ Logger ┘   CancellationToken
//! ```
//!
//! # Modules
//!
//! - `bounded_queue`: Fixed-capacity FIFO used for every handoff
//! - `sync`: Timed lock and deadline signal
//! - `handoff`: Queue + lock + signals split into one producer and one consumer
//! - `cancel`: Pipeline-wide cancellation token and signal routing
//! - `stage`: The producer/consumer protocol every stage follows
//! - `watchdog`: Heartbeat table and supervisor loop
//! - `procstat`: `/proc/stat` snapshots and sample sources
//! - `usage`: Utilization formula
//! - `sampler`, `analyzer`, `render`: The three data stages
//! - `logging`: tracing setup and the queue-backed log file worker
//! - `config`: Configuration management
//! - `pipeline`: Thread wiring and exit report
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod analyzer;
pub mod bounded_queue;
pub mod cancel;
pub mod config;
pub mod error;
pub mod handoff;
pub mod logging;
pub mod pipeline;
pub mod procstat;
pub mod render;
pub mod sampler;
pub mod stage;
pub mod sync;
pub mod usage;
pub mod watchdog;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
