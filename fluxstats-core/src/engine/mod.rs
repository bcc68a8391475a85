//! Windowed aggregation engine
//!
//! Raw events flow through the engine as follows:
//!
//! 1. [`AggregationPipeline`] routes each event to the processor for its
//!    statistic's type and precision.
//! 2. The processor's [`Partitioner`](crate::transport::Partitioner) picks a
//!    partition by statistic name; each partition has one worker.
//! 3. The worker's [`StatisticMapper`] interns names and builds one
//!    (key, aggregate) pair per rollup mask.
//! 4. Pairs are coalesced in the worker's [`Accumulator`] until the size or
//!    time threshold is reached.
//! 5. The [`Flusher`] merges the batch into the store, retrying per key, and
//!    the written pairs are re-keyed and forwarded to the next coarser
//!    processor.

mod accumulator;
mod flusher;
mod mapper;
mod pipeline;
mod processor;
mod worker;

pub use accumulator::{Accumulator, MergeFn};
pub use flusher::{FlushOutcome, Flusher};
pub use mapper::StatisticMapper;
pub use pipeline::{AggregationPipeline, IngestReport};
pub use processor::{
    processor_id, AggregationProcessor, ProcessorStats, ProcessorStatsSnapshot, RunState,
    Unsent,
};
pub use worker::WorkerInput;

use crate::aggregate::StatAggregate;
use crate::StatisticEvent;
use std::sync::Arc;

/// An aggregate waiting to be flushed, with the first event that
/// contributed to it
#[derive(Debug, Clone)]
pub struct PendingAggregate {
    pub aggregate: StatAggregate,
    /// Routed to the bad-event sink if the key cannot be written
    pub source: Arc<StatisticEvent>,
}
