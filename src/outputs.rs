//! Output collaborators: sinks and the sink task loop.
//!
//! Sinks receive the aggregate stream at-least-once: a restore replays
//! the records after the checkpoint cut, so results spanning the cut
//! are redelivered. Deduplication (or transactional emission keyed off
//! the forwarded barriers) is the sink's concern, not the engine's.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;

use crate::recovery::CheckpointId;
use crate::route::PartitionIndex;
use crate::route::COOLDOWN;
use crate::state::StateKey;
use crate::worker::ControlMsg;

/// Boxed error type for sink write failures. A sink error is a task
/// failure: the job rolls back rather than dropping a result.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of the aggregated output stream.
pub trait Sink<A> {
    fn write(&mut self, key: &StateKey, value: &A, timestamp: u64) -> Result<(), SinkError>;

    /// Checkpoint barrier forwarded by upstream tasks. A transactional
    /// sink can commit an output epoch here; the default ignores it.
    fn on_barrier(&mut self, _id: CheckpointId) {}
}

/// Everything that travels on the emit channel.
#[derive(Debug, Clone)]
pub(crate) enum SinkMessage<A> {
    Emit {
        key: StateKey,
        value: A,
        timestamp: u64,
    },
    /// Barrier forwarded by one upstream task after its snapshot.
    Barrier(CheckpointId),
    /// One upstream task is done emitting.
    Eof(PartitionIndex),
}

/// Collecting sink writing into shared memory; the handle outlives the
/// job so tests and demos can inspect what was emitted.
#[derive(Debug, Clone, Default)]
pub struct VecSink<A> {
    items: Arc<Mutex<Vec<(StateKey, A, u64)>>>,
}

impl<A> VecSink<A> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn items(&self) -> Vec<(StateKey, A, u64)>
    where
        A: Clone,
    {
        self.items.lock().expect("sink poisoned").clone()
    }
}

impl<A> Sink<A> for VecSink<A>
where
    A: Clone,
{
    fn write(&mut self, key: &StateKey, value: &A, timestamp: u64) -> Result<(), SinkError> {
        self.items
            .lock()
            .expect("sink poisoned")
            .push((key.clone(), value.clone(), timestamp));
        Ok(())
    }
}

/// The sink's processing loop: drain the emit channel until every
/// upstream task has said EOF.
pub(crate) struct SinkRun<A> {
    pub(crate) sink: Box<dyn Sink<A> + Send>,
    pub(crate) emits: Receiver<SinkMessage<A>>,
    pub(crate) n_tasks: usize,
    pub(crate) control: Sender<ControlMsg>,
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl<A> SinkRun<A> {
    pub(crate) fn run(mut self) {
        let mut eofs = 0;
        loop {
            match self.emits.recv_timeout(COOLDOWN) {
                Ok(SinkMessage::Emit {
                    key,
                    value,
                    timestamp,
                }) => {
                    if let Err(err) = self.sink.write(&key, &value, timestamp) {
                        tracing::error!("sink write failed: {err}");
                        let _ = self.control.send(ControlMsg::Failed {
                            unit: String::from("sink"),
                            reason: err.to_string(),
                        });
                        return;
                    }
                }
                Ok(SinkMessage::Barrier(id)) => {
                    tracing::trace!("sink saw barrier for {id}");
                    self.sink.on_barrier(id);
                }
                Ok(SinkMessage::Eof(partition)) => {
                    tracing::debug!("sink saw EOF from partition {partition}");
                    eofs += 1;
                    if eofs == self.n_tasks {
                        tracing::debug!("sink drained");
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.interrupt.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_sink_collects_in_order() {
        let sink = VecSink::new();
        let mut writer = sink.clone();
        writer.write(&StateKey::from("a"), &1_i64, 0).unwrap();
        writer.write(&StateKey::from("a"), &2_i64, 1).unwrap();
        assert_eq!(
            sink.items(),
            vec![
                (StateKey::from("a"), 1, 0),
                (StateKey::from("a"), 2, 1),
            ]
        );
    }
}
