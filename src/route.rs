//! Partitioning and the record router.
//!
//! Records are hashed by key onto a fixed number of partitions, one
//! operator task per partition. Delivery runs over bounded channels:
//! FIFO per channel, blocking (never dropping) when full. Barriers
//! travel in-band on the same channels so they can never overtake the
//! data records emitted before them.

use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::SendTimeoutError;
use crossbeam_channel::Sender;
use seahash::SeaHasher;
use serde::Deserialize;
use serde::Serialize;

use crate::recovery::CheckpointId;
use crate::state::StateKey;

/// How long a blocking channel operation waits before re-checking the
/// interrupt flag.
pub(crate) const COOLDOWN: Duration = Duration::from_millis(20);

/// IDs a specific partition.
///
/// The inner value will be up to [`PartitionCount`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionIndex(pub usize);

impl std::fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Total number of partitions in a job.
///
/// Must be at least 1; [`PartitionCount::partition_for`] reduces hashes
/// modulo this count. Job configuration enforces that, but directly
/// constructed counts must uphold it too.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCount(pub usize);

impl PartitionCount {
    /// Return an iter of all partitions.
    pub fn iter(&self) -> impl Iterator<Item = PartitionIndex> {
        (0..self.0).map(PartitionIndex)
    }

    /// Deterministically map a key to its owning partition.
    ///
    /// Pure function of the key and the partition count, so a key's
    /// partition is stable for the lifetime of a job.
    pub fn partition_for(&self, key: &StateKey) -> PartitionIndex {
        assert!(self.0 > 0, "partition count must be at least 1");
        let mut hasher = SeaHasher::default();
        key.hash(&mut hasher);
        PartitionIndex((hasher.finish() % self.0 as u64) as usize)
    }
}

/// An immutable record flowing through the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<V> {
    pub key: StateKey,
    pub value: V,
    /// Logical timestamp assigned by the producing source,
    /// non-decreasing per source.
    pub timestamp: u64,
}

impl<V> Record<V> {
    pub fn new(key: impl Into<StateKey>, value: V, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
        }
    }
}

/// Everything that travels on a data channel.
#[derive(Debug, Clone)]
pub enum StreamMessage<V> {
    Record(Record<V>),
    /// Control marker demarcating the snapshot cut for one checkpoint.
    Barrier(CheckpointId),
    /// The producing source is exhausted; no more messages follow on
    /// this channel.
    Eof,
}

/// Why a blocking channel operation gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkError {
    /// The job-wide interrupt flag was raised.
    Interrupted,
    /// The other end of the channel is gone.
    Disconnected,
}

/// Blocking send that stays responsive to the interrupt flag.
///
/// Backpressure: a full channel parks us here until the consumer
/// drains it or the job is halted.
pub(crate) fn feed<T>(
    tx: &Sender<T>,
    mut msg: T,
    interrupt: &AtomicBool,
) -> Result<(), LinkError> {
    loop {
        if interrupt.load(Ordering::Relaxed) {
            return Err(LinkError::Interrupted);
        }
        match tx.send_timeout(msg, COOLDOWN) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(returned)) => msg = returned,
            Err(SendTimeoutError::Disconnected(_)) => return Err(LinkError::Disconnected),
        }
    }
}

/// One producer's sending side of the router: a channel per partition.
pub(crate) struct Router<V> {
    parts: PartitionCount,
    outs: Vec<Sender<StreamMessage<V>>>,
}

impl<V> Router<V> {
    pub(crate) fn new(parts: PartitionCount, outs: Vec<Sender<StreamMessage<V>>>) -> Self {
        assert_eq!(parts.0, outs.len());
        Self { parts, outs }
    }

    /// Deliver a record to the task owning its key's partition.
    pub(crate) fn route(&self, record: Record<V>, interrupt: &AtomicBool) -> Result<(), LinkError> {
        let part = self.parts.partition_for(&record.key);
        feed(&self.outs[part.0], StreamMessage::Record(record), interrupt)
    }

    /// Deliver a barrier to every partition, in-order with respect to
    /// the data records this producer already emitted.
    pub(crate) fn broadcast_barrier(
        &self,
        id: CheckpointId,
        interrupt: &AtomicBool,
    ) -> Result<(), LinkError> {
        for out in &self.outs {
            feed(out, StreamMessage::Barrier(id), interrupt)?;
        }
        Ok(())
    }

    /// Tell every partition this producer is exhausted.
    pub(crate) fn broadcast_eof(&self, interrupt: &AtomicBool) -> Result<(), LinkError> {
        for out in &self.outs {
            feed(out, StreamMessage::Eof, interrupt)?;
        }
        Ok(())
    }
}
