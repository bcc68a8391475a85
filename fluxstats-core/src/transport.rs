//! Transport boundary
//!
//! Raw events are delivered on partitions keyed by statistic name, so every
//! event of a statistic lands on the same worker. Events that cannot be
//! processed go to a [`BadEventSink`].

use crate::{Result, StatisticEvent, StatsError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Events for one partition
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub partition: usize,
    pub events: Vec<StatisticEvent>,
}

/// Maps a routing key to a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    partitions: usize,
}

impl Partitioner {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Partition for a routing key; stable across processes
    pub fn partition_for(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.partitions
    }

    /// Group events into one batch per partition, preserving order within each
    pub fn split(&self, events: Vec<StatisticEvent>) -> Vec<EventBatch> {
        let mut groups: Vec<Vec<StatisticEvent>> = vec![Vec::new(); self.partitions];
        for event in events {
            let partition = self.partition_for(event.name.as_bytes());
            groups[partition].push(event);
        }
        groups
            .into_iter()
            .enumerate()
            .filter(|(_, events)| !events.is_empty())
            .map(|(partition, events)| EventBatch { partition, events })
            .collect()
    }
}

/// Bounded channel per partition
///
/// Sends wait when a partition's queue is full, so producers are held back
/// to the pace of the slowest consuming worker.
pub struct ChannelTransport<T> {
    senders: Vec<mpsc::Sender<T>>,
}

impl<T: Send + 'static> ChannelTransport<T> {
    /// Create the transport and the receivers, one per partition
    pub fn new(partitions: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<T>>) {
        let (senders, receivers) = (0..partitions.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip();
        (Self { senders }, receivers)
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Deliver a message to a partition
    pub async fn send(&self, partition: usize, message: T) -> Result<()> {
        let sender = self.senders.get(partition).ok_or_else(|| {
            StatsError::Transport(format!(
                "Partition {} out of range 0..{}",
                partition,
                self.senders.len()
            ))
        })?;
        sender
            .send(message)
            .await
            .map_err(|_| StatsError::Transport(format!("Partition {} is closed", partition)))
    }

    /// Deliver a message, handing it back when the partition is missing or closed
    pub async fn deliver(&self, partition: usize, message: T) -> std::result::Result<(), T> {
        match self.senders.get(partition) {
            Some(sender) => sender.send(message).await.map_err(|e| e.0),
            None => Err(message),
        }
    }
}

/// An event that could not be processed, with the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadEvent {
    pub event: StatisticEvent,
    pub reason: String,
    /// Processor that rejected the event
    pub processor: String,
}

/// Destination for rejected events
#[async_trait]
pub trait BadEventSink: Send + Sync + 'static {
    async fn send(&self, bad: BadEvent) -> Result<()>;
}

/// Keeps the most recent rejected events in memory
pub struct MemoryBadEventSink {
    capacity: usize,
    events: Mutex<VecDeque<BadEvent>>,
}

impl MemoryBadEventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the retained events, oldest first
    pub fn snapshot(&self) -> Vec<BadEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Remove and return the retained events
    pub fn drain(&self) -> Vec<BadEvent> {
        self.events.lock().drain(..).collect()
    }
}

#[async_trait]
impl BadEventSink for MemoryBadEventSink {
    async fn send(&self, bad: BadEvent) -> Result<()> {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(bad);
        Ok(())
    }
}

/// Forwards rejected events to a channel, e.g. one drained by a writer task
pub struct ChannelBadEventSink {
    sender: mpsc::UnboundedSender<BadEvent>,
}

impl ChannelBadEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl BadEventSink for ChannelBadEventSink {
    async fn send(&self, bad: BadEvent) -> Result<()> {
        self.sender.send(bad).map_err(|e| {
            warn!(statistic = %e.0.event.name, "Bad event channel closed");
            StatsError::Transport("Bad event channel closed".into())
        })
    }
}

/// Shared handle to a sink
pub type SharedBadEventSink = Arc<dyn BadEventSink>;
