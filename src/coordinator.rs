//! The checkpoint coordinator.
//!
//! Runs as a control-plane thread beside the dataflow. On a timer it
//! starts a checkpoint by handing every live source a barrier with the
//! next id; it then collects offset acknowledgments from sources and
//! state acknowledgments from tasks. A checkpoint commits only when
//! every ack is in; anything less by the deadline discards the whole
//! attempt. There is never more than one checkpoint in flight, ids are
//! strictly increasing, and a discarded id is never reused.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::select;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::inputs::SourceCommand;
use crate::inputs::SourceIndex;
use crate::recovery::CheckpointId;
use crate::recovery::CheckpointImage;
use crate::recovery::CheckpointVault;
use crate::recovery::OffsetMarker;
use crate::route::PartitionIndex;
use crate::route::COOLDOWN;
use crate::state::StateBytes;

/// Acknowledgment traffic from the data plane to the coordinator.
#[derive(Debug)]
pub(crate) enum CoordMsg {
    /// A source injected the barrier and this was its offset at the
    /// cut.
    SourceAck {
        id: CheckpointId,
        source: SourceIndex,
        offset: OffsetMarker,
    },
    /// A source is exhausted; its final offset stands in for its ack
    /// in this and every later checkpoint.
    SourceEof {
        source: SourceIndex,
        offset: OffsetMarker,
    },
    /// A task aligned, snapshotted, and this is its state at the cut.
    TaskAck {
        id: CheckpointId,
        partition: PartitionIndex,
        state: StateBytes,
    },
    /// A task could not snapshot; the whole attempt is void.
    TaskAbort {
        id: CheckpointId,
        partition: PartitionIndex,
        reason: String,
    },
}

/// One in-flight checkpoint attempt.
struct Pending {
    id: CheckpointId,
    deadline: Instant,
    source_offsets: BTreeMap<SourceIndex, OffsetMarker>,
    task_states: BTreeMap<PartitionIndex, StateBytes>,
}

pub(crate) struct Coordinator {
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) n_tasks: usize,
    pub(crate) vault: CheckpointVault,
    pub(crate) sources: Vec<Sender<SourceCommand>>,
    pub(crate) acks: Receiver<CoordMsg>,
    pub(crate) interrupt: Arc<AtomicBool>,
    /// First id this execution may use; strictly above anything
    /// committed before a restart.
    pub(crate) next_id: CheckpointId,
}

impl Coordinator {
    pub(crate) fn run(mut self) {
        let ticker = crossbeam_channel::tick(self.interval);
        let mut pending: Option<Pending> = None;
        // Final offsets of exhausted sources, reused as their ack for
        // every checkpoint after their EOF.
        let mut eof_offsets: BTreeMap<SourceIndex, OffsetMarker> = BTreeMap::new();
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                tracing::debug!("coordinator interrupted");
                return;
            }
            select! {
                recv(ticker) -> _ => {
                    if pending.is_none() {
                        pending = self.trigger(&eof_offsets);
                    }
                }
                recv(self.acks) -> msg => match msg {
                    Ok(msg) => self.on_msg(&mut pending, &mut eof_offsets, msg),
                    // Every source and task is gone; nothing left to
                    // coordinate.
                    Err(_) => return,
                },
                default(COOLDOWN) => {}
            }
            let complete = pending.as_ref().is_some_and(|p| {
                p.source_offsets.len() == self.sources.len()
                    && p.task_states.len() == self.n_tasks
            });
            if complete {
                let attempt = pending.take().expect("checked above");
                self.commit(attempt);
            } else if let Some(p) = &pending {
                if Instant::now() >= p.deadline {
                    // Discard the whole attempt; a partial commit
                    // would break the consistent cut. The id is
                    // burned, never reused.
                    tracing::warn!("discarding {}, barriers did not align in time", p.id);
                    pending = None;
                }
            }
        }
    }

    /// Start a checkpoint: claim the next id and hand a barrier to
    /// every live source. Returns `None` while the job is draining and
    /// no source is left to carry a barrier.
    fn trigger(&mut self, eof_offsets: &BTreeMap<SourceIndex, OffsetMarker>) -> Option<Pending> {
        let mut source_offsets = eof_offsets.clone();
        let mut injected = 0;
        let id = self.next_id;
        for (i, commands) in self.sources.iter().enumerate() {
            let source = SourceIndex(i);
            if source_offsets.contains_key(&source) {
                continue;
            }
            match commands.send(SourceCommand::InjectBarrier(id)) {
                Ok(()) => injected += 1,
                // Source exited; its SourceEof is in flight and will
                // stand in for the ack.
                Err(_) => tracing::debug!("source-{i} gone, awaiting its final offset"),
            }
        }
        if injected == 0 && source_offsets.len() == self.sources.len() {
            tracing::debug!("all sources exhausted, no more checkpoints to start");
            return None;
        }
        self.next_id = id.next();
        tracing::debug!("started {id} across {injected} live sources");
        Some(Pending {
            id,
            deadline: Instant::now() + self.timeout,
            source_offsets,
            task_states: BTreeMap::new(),
        })
    }

    fn on_msg(
        &mut self,
        pending: &mut Option<Pending>,
        eof_offsets: &mut BTreeMap<SourceIndex, OffsetMarker>,
        msg: CoordMsg,
    ) {
        match msg {
            CoordMsg::SourceAck { id, source, offset } => match pending {
                Some(p) if p.id == id => {
                    p.source_offsets.insert(source, offset);
                }
                _ => tracing::debug!("ignoring stale source ack for {id}"),
            },
            CoordMsg::SourceEof { source, offset } => {
                eof_offsets.insert(source, offset);
                if let Some(p) = pending {
                    // The source saw EOF instead of this attempt's
                    // barrier; every record it ever emitted is before
                    // the cut, so its final offset is its ack.
                    p.source_offsets.entry(source).or_insert(offset);
                }
            }
            CoordMsg::TaskAck {
                id,
                partition,
                state,
            } => match pending {
                Some(p) if p.id == id => {
                    p.task_states.insert(partition, state);
                }
                _ => tracing::debug!("ignoring stale task ack for {id}"),
            },
            CoordMsg::TaskAbort {
                id,
                partition,
                reason,
            } => match pending {
                Some(p) if p.id == id => {
                    tracing::warn!("discarding {id}, aborted by task-{partition}: {reason}");
                    *pending = None;
                }
                _ => tracing::debug!("ignoring stale abort for {id}"),
            },
        }
    }

    /// All acks are in: seal and durably store the image. Storage
    /// trouble abandons the attempt (logged inside the vault); it
    /// never takes the job down.
    fn commit(&mut self, attempt: Pending) {
        let image = CheckpointImage {
            checkpoint_id: attempt.id,
            created_at: Utc::now(),
            sources: attempt.source_offsets.into_iter().collect(),
            partitions: attempt.task_states.into_iter().collect(),
        };
        match self.vault.commit(&image) {
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("abandoning {}: {err}", image.checkpoint_id);
            }
        }
    }
}
