//! FluxStats Core - Pre-aggregated Statistics Engine
//!
//! Ingests raw statistic events and keeps them as pre-aggregated cells at
//! several time resolutions, so reads never scan raw events:
//! - Counts are summed and values carry sum, count, min and max
//! - Every statistic is stored at its own precision and every coarser one
//! - Tag combinations can be rolled up into shared cells
//!
//! # Architecture
//!
//! - **UID dictionary**: Interns names to fixed-width identifiers
//! - **Keys**: Compact, byte-ordered keys built from identifiers and time buckets
//! - **Engine**: Partitioned workers that accumulate, flush and forward rollups
//! - **Store**: Merge-on-write aggregate store behind an async trait

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod interval;
pub mod key;
pub mod rollup;
pub mod statistic;
pub mod store;
pub mod transport;
pub mod uid;

mod error;
mod types;

pub use engine::{AggregationPipeline, AggregationProcessor, IngestReport, RunState};
pub use error::{Result, StatsError};
pub use interval::Interval;
pub use key::{StatKey, TagValue};
pub use types::*;

/// FluxStats version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
