//! Input collaborators: replayable sources and the source task loop.
//!
//! The engine does not implement connectors. It asks for an unbounded
//! sequence of records plus the ability to report and replay from an
//! offset, which is what restore needs to re-read exactly the records
//! after the checkpoint cut.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use serde::Deserialize;
use serde::Serialize;

use crate::backoff::Backoff;
use crate::coordinator::CoordMsg;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::recovery::CheckpointId;
use crate::recovery::OffsetMarker;
use crate::route::Record;
use crate::route::Router;
use crate::route::COOLDOWN;
use crate::worker::ControlMsg;

/// IDs one parallel source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceIndex(pub usize);

/// A lazy, unbounded, replayable sequence of records.
///
/// `poll` semantics follow [`std::task::Poll`]: `Pending` means
/// nothing is available right now, `Ready(Some)` is the next record,
/// `Ready(None)` means the source is exhausted and will never produce
/// again.
pub trait UnboundedSource<V> {
    fn poll(&mut self) -> EngineResult<Poll<Option<Record<V>>>>;

    /// Current replay position: the number of records emitted so far.
    fn offset(&self) -> OffsetMarker;

    /// Rewind or fast-forward so the next `poll` returns the record at
    /// `offset`.
    fn seek(&mut self, offset: OffsetMarker) -> EngineResult<()>;
}

/// Fixed, finite source backed by a `Vec`. The records replay from any
/// offset, which makes it the workhorse for recovery tests and demos.
#[derive(Debug, Clone)]
pub struct VecSource<V> {
    records: Vec<Record<V>>,
    idx: usize,
}

impl<V> VecSource<V> {
    pub fn new(records: Vec<Record<V>>) -> Self {
        Self { records, idx: 0 }
    }
}

impl<V> UnboundedSource<V> for VecSource<V>
where
    V: Clone,
{
    fn poll(&mut self) -> EngineResult<Poll<Option<Record<V>>>> {
        match self.records.get(self.idx) {
            Some(record) => {
                self.idx += 1;
                Ok(Poll::Ready(Some(record.clone())))
            }
            None => Ok(Poll::Ready(None)),
        }
    }

    fn offset(&self) -> OffsetMarker {
        OffsetMarker(self.idx as u64)
    }

    fn seek(&mut self, offset: OffsetMarker) -> EngineResult<()> {
        if offset.0 as usize > self.records.len() {
            return Err(EngineError::TransientIo(format!(
                "can't seek to {offset:?}, only {} records",
                self.records.len()
            )));
        }
        self.idx = offset.0 as usize;
        Ok(())
    }
}

/// Control-plane instruction to a source task.
#[derive(Debug, Copy, Clone)]
pub(crate) enum SourceCommand {
    /// Capture the current offset and emit a barrier for this
    /// checkpoint into every output channel.
    InjectBarrier(CheckpointId),
}

/// One source's processing loop: poll records, route them by key, and
/// inject barriers when the coordinator says so.
pub(crate) struct SourceRun<V> {
    pub(crate) index: SourceIndex,
    pub(crate) source: Box<dyn UnboundedSource<V> + Send>,
    pub(crate) router: Router<V>,
    pub(crate) commands: Receiver<SourceCommand>,
    pub(crate) coord: Sender<CoordMsg>,
    pub(crate) control: Sender<ControlMsg>,
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl<V> SourceRun<V> {
    fn unit(&self) -> String {
        format!("source-{}", self.index.0)
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("{} start", self.unit());
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                tracing::debug!("{} interrupted", self.unit());
                return;
            }
            // Handle pending barriers before emitting more records so
            // the captured offset matches what is already in flight.
            loop {
                match self.commands.try_recv() {
                    Ok(SourceCommand::InjectBarrier(id)) => {
                        if !self.inject(id) {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            match self.poll_with_retry() {
                Ok(Poll::Ready(Some(record))) => {
                    if self.router.route(record, &self.interrupt).is_err() {
                        return;
                    }
                }
                Ok(Poll::Ready(None)) => {
                    let offset = self.source.offset();
                    tracing::info!("{} exhausted at {offset:?}", self.unit());
                    let _ = self.router.broadcast_eof(&self.interrupt);
                    let _ = self.coord.send(CoordMsg::SourceEof {
                        source: self.index,
                        offset,
                    });
                    let _ = self.control.send(ControlMsg::SourceFinished {
                        source: self.index,
                    });
                    return;
                }
                Ok(Poll::Pending) => {
                    // Idle; wake early if a barrier command lands.
                    match self.commands.recv_timeout(COOLDOWN) {
                        Ok(SourceCommand::InjectBarrier(id)) => {
                            if !self.inject(id) {
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        // Coordinator is gone; the interrupt flag will
                        // stop us on the next pass.
                        Err(RecvTimeoutError::Disconnected) => {}
                    }
                }
                Err(err) => {
                    tracing::error!("{} failed: {err}", self.unit());
                    let _ = self.control.send(ControlMsg::Failed {
                        unit: self.unit(),
                        reason: err.to_string(),
                    });
                    return;
                }
            }
        }
    }

    /// Returns false when the job is halting and the loop should exit.
    fn inject(&mut self, id: CheckpointId) -> bool {
        let offset = self.source.offset();
        tracing::debug!("{} injecting barrier for {id} at {offset:?}", self.unit());
        if self
            .router
            .broadcast_barrier(id, &self.interrupt)
            .is_err()
        {
            return false;
        }
        let _ = self.coord.send(CoordMsg::SourceAck {
            id,
            source: self.index,
            offset,
        });
        true
    }

    /// Poll the source, retrying transient I/O errors with bounded
    /// backoff. Exhausting the retries escalates to a task failure.
    fn poll_with_retry(&mut self) -> EngineResult<Poll<Option<Record<V>>>> {
        let mut backoff = Backoff::default();
        loop {
            match self.source.poll() {
                Ok(polled) => return Ok(polled),
                Err(EngineError::TransientIo(reason)) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            "{} transient read error, retrying in {delay:?}: {reason}",
                            self.unit()
                        );
                        std::thread::sleep(delay);
                    }
                    None => {
                        return Err(EngineError::task_failure(
                            self.unit(),
                            format!("read retries exhausted: {reason}"),
                        ))
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }
}
