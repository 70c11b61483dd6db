//! Topology wiring and the supervisor.
//!
//! One execution builds the whole dataflow fresh: channels, source
//! threads, operator task threads, the sink thread, and the
//! coordinator thread. The supervisor watches the control channel and
//! thread liveness; any failure halts everything and the job is
//! rebuilt from the latest committed checkpoint. Global rollback: a
//! single task failure restores the whole topology, trading restart
//! granularity for correctness certainty.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use scopeguard::defer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::fold::FoldLogic;
use crate::inputs::SourceIndex;
use crate::inputs::SourceRun;
use crate::outputs::SinkRun;
use crate::recovery::CheckpointId;
use crate::recovery::CheckpointImage;
use crate::recovery::CheckpointVault;
use crate::recovery::OffsetMarker;
use crate::route::PartitionCount;
use crate::route::PartitionIndex;
use crate::route::Router;
use crate::route::StreamMessage;
use crate::route::COOLDOWN;
use crate::run::JobReport;
use crate::run::SinkBuilder;
use crate::run::SourceBuilder;
use crate::state::KeyedState;
use crate::state::StateBytes;
use crate::state::StateKey;
use crate::task::TaskRun;

/// Traffic from the data plane to the supervisor.
#[derive(Debug)]
pub(crate) enum ControlMsg {
    /// A unit failed; the whole job rolls back.
    Failed { unit: String, reason: String },
    /// A task drained all its inputs; `state` is its final
    /// accumulator set.
    TaskFinished {
        partition: PartitionIndex,
        state: StateBytes,
    },
    /// A source is exhausted.
    SourceFinished { source: SourceIndex },
}

/// How one execution of the topology ended.
enum Outcome {
    /// Every task drained; final per-partition states attached.
    Finished(Vec<(PartitionIndex, StateBytes)>),
    /// Something failed; roll back and restart.
    Failed(EngineError),
    /// The caller raised the cancel flag; no restart.
    Cancelled,
}

pub(crate) struct Worker<V, A> {
    pub(crate) config: EngineConfig,
    pub(crate) fold: Arc<dyn FoldLogic<V, A>>,
    pub(crate) source_builders: Vec<SourceBuilder<V>>,
    pub(crate) sink_builder: SinkBuilder<A>,
    pub(crate) vault: CheckpointVault,
    /// Job-level cancellation, raised by the caller from any thread.
    pub(crate) cancel: Arc<AtomicBool>,
}

impl<V, A> Worker<V, A>
where
    V: Send + 'static,
    A: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Run the job to completion, rolling back to the latest committed
    /// checkpoint on failure, up to the restart budget.
    pub(crate) fn run(&self) -> EngineResult<JobReport<A>> {
        let mut resume = self.vault.restore_latest()?;
        let mut restarts = 0;
        loop {
            match self.execute(resume.as_ref())? {
                Outcome::Finished(finals) => {
                    let mut final_state: HashMap<StateKey, A> = HashMap::new();
                    for (_partition, image) in finals {
                        // Partitions own disjoint key sets, so a plain
                        // extend is a merge.
                        final_state.extend(KeyedState::<A>::restore(&image)?.into_map());
                    }
                    return Ok(JobReport {
                        final_state,
                        restarts,
                        checkpoints_committed: self.vault.commit_count(),
                    });
                }
                Outcome::Cancelled => {
                    tracing::info!("job cancelled after {restarts} restarts");
                    return Err(EngineError::Cancelled);
                }
                Outcome::Failed(err) => {
                    if restarts >= self.config.max_restarts {
                        tracing::error!("restart budget exhausted: {err}");
                        return Err(err);
                    }
                    restarts += 1;
                    tracing::warn!("rolling back (restart {restarts}): {err}");
                    resume = self.vault.restore_latest()?;
                    match &resume {
                        Some(image) => {
                            tracing::info!("resuming from {}", image.checkpoint_id)
                        }
                        None => tracing::info!("no committed checkpoint, restarting from scratch"),
                    }
                }
            }
        }
    }

    /// Build and run the topology once, either fresh or from a
    /// restored checkpoint image.
    #[instrument(name = "execute", skip_all)]
    fn execute(&self, resume: Option<&CheckpointImage>) -> EngineResult<Outcome> {
        let n_tasks = self.config.parallelism;
        let n_sources = self.source_builders.len();
        let parts = PartitionCount(n_tasks);
        let interrupt = Arc::new(AtomicBool::new(false));
        // If wiring fails partway, make sure anything already spawned
        // unblocks and exits.
        defer! {
            interrupt.store(true, Ordering::Relaxed);
        }

        let restored_states: HashMap<PartitionIndex, &StateBytes> = resume
            .map(|image| {
                image
                    .partitions
                    .iter()
                    .map(|(partition, state)| (*partition, state))
                    .collect()
            })
            .unwrap_or_default();
        let restored_offsets: HashMap<SourceIndex, OffsetMarker> = resume
            .map(|image| image.sources.iter().copied().collect())
            .unwrap_or_default();
        let next_id = resume
            .map(|image| image.checkpoint_id.next())
            .unwrap_or(CheckpointId(1));

        // One bounded channel per (source, partition) edge keeps
        // per-key FIFO order: a key lives on one partition and each
        // source feeds it through exactly one channel.
        let mut source_outs = Vec::with_capacity(n_sources);
        let mut task_inputs: Vec<Vec<Receiver<StreamMessage<V>>>> =
            (0..n_tasks).map(|_| Vec::with_capacity(n_sources)).collect();
        for _ in 0..n_sources {
            let mut outs = Vec::with_capacity(n_tasks);
            for inputs in task_inputs.iter_mut() {
                let (tx, rx) = crossbeam_channel::bounded(self.config.channel_capacity);
                outs.push(tx);
                inputs.push(rx);
            }
            source_outs.push(outs);
        }
        let (emit_tx, emit_rx) = crossbeam_channel::bounded(self.config.channel_capacity);
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let sink_run = SinkRun {
            sink: (self.sink_builder)(),
            emits: emit_rx,
            n_tasks,
            control: control_tx.clone(),
            interrupt: Arc::clone(&interrupt),
        };
        let sink_handle = std::thread::Builder::new()
            .name(String::from("keyflow-sink"))
            .spawn(move || sink_run.run())?;

        let mut task_handles = Vec::with_capacity(n_tasks);
        for (partition, inputs) in parts.iter().zip(task_inputs) {
            let state = match restored_states.get(&partition) {
                Some(image) => KeyedState::restore(image)?,
                None => KeyedState::default(),
            };
            let task = TaskRun {
                partition,
                fold: Arc::clone(&self.fold),
                state,
                inputs,
                emit: emit_tx.clone(),
                coord: ack_tx.clone(),
                control: control_tx.clone(),
                interrupt: Arc::clone(&interrupt),
            };
            let handle = std::thread::Builder::new()
                .name(format!("keyflow-task-{partition}"))
                .spawn(move || task.run())?;
            task_handles.push((partition, handle));
        }
        // The sink must see disconnect once every task is done.
        drop(emit_tx);

        let mut source_handles = Vec::with_capacity(n_sources);
        let mut command_txs = Vec::with_capacity(n_sources);
        for (i, (builder, outs)) in self.source_builders.iter().zip(source_outs).enumerate() {
            let index = SourceIndex(i);
            let mut source = builder();
            if let Some(offset) = restored_offsets.get(&index) {
                source.seek(*offset)?;
            }
            let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
            command_txs.push(cmd_tx);
            let run = SourceRun {
                index,
                source,
                router: Router::new(parts, outs),
                commands: cmd_rx,
                coord: ack_tx.clone(),
                control: control_tx.clone(),
                interrupt: Arc::clone(&interrupt),
            };
            let handle = std::thread::Builder::new()
                .name(format!("keyflow-source-{i}"))
                .spawn(move || run.run())?;
            source_handles.push((index, handle));
        }
        drop(ack_tx);
        drop(control_tx);

        let coordinator = Coordinator {
            interval: self.config.checkpoint_interval(),
            timeout: self.config.checkpoint_timeout(),
            n_tasks,
            vault: self.vault.clone(),
            sources: command_txs,
            acks: ack_rx,
            interrupt: Arc::clone(&interrupt),
            next_id,
        };
        let coordinator_handle = std::thread::Builder::new()
            .name(String::from("keyflow-coordinator"))
            .spawn(move || coordinator.run())?;

        let mut outcome = supervise(&control_rx, &self.cancel, &task_handles, &source_handles);

        if matches!(outcome, Outcome::Finished(_)) {
            // Let the sink drain its channel before halting the
            // control plane.
            join_unit(sink_handle, "sink", &mut outcome);
            interrupt.store(true, Ordering::Relaxed);
        } else {
            interrupt.store(true, Ordering::Relaxed);
            join_unit(sink_handle, "sink", &mut outcome);
        }
        for (partition, handle) in task_handles {
            join_unit(handle, &format!("task-{partition}"), &mut outcome);
        }
        for (index, handle) in source_handles {
            join_unit(handle, &format!("source-{}", index.0), &mut outcome);
        }
        join_unit(coordinator_handle, "coordinator", &mut outcome);
        Ok(outcome)
    }
}

/// Watch the control channel and thread liveness until the job drains
/// or something dies.
fn supervise(
    control_rx: &Receiver<ControlMsg>,
    cancel: &AtomicBool,
    task_handles: &[(PartitionIndex, JoinHandle<()>)],
    source_handles: &[(SourceIndex, JoinHandle<()>)],
) -> Outcome {
    let n_tasks = task_handles.len();
    let mut finals = Vec::with_capacity(n_tasks);
    let mut finished_tasks = Vec::new();
    let mut finished_sources = Vec::new();
    loop {
        match control_rx.recv_timeout(COOLDOWN) {
            Ok(ControlMsg::Failed { unit, reason }) => {
                return Outcome::Failed(EngineError::TaskFailure { unit, reason });
            }
            Ok(ControlMsg::TaskFinished { partition, state }) => {
                finished_tasks.push(partition);
                finals.push((partition, state));
                if finals.len() == n_tasks {
                    return Outcome::Finished(finals);
                }
            }
            Ok(ControlMsg::SourceFinished { source }) => {
                tracing::debug!("source-{} finished", source.0);
                finished_sources.push(source);
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.load(Ordering::Relaxed) {
                    return Outcome::Cancelled;
                }
                // Liveness check: a thread that exited without
                // reporting in died abnormally (e.g. a panic inside
                // user code). A queued message means the report is
                // still in flight, so wait for the next round.
                if !control_rx.is_empty() {
                    continue;
                }
                for (partition, handle) in task_handles {
                    if handle.is_finished() && !finished_tasks.contains(partition) {
                        return Outcome::Failed(EngineError::task_failure(
                            format!("task-{partition}"),
                            "exited without reporting",
                        ));
                    }
                }
                for (index, handle) in source_handles {
                    if handle.is_finished() && !finished_sources.contains(index) {
                        return Outcome::Failed(EngineError::task_failure(
                            format!("source-{}", index.0),
                            "exited without reporting",
                        ));
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Outcome::Failed(EngineError::task_failure(
                    "supervisor",
                    "control channel closed before all tasks finished",
                ));
            }
        }
    }
}

/// Join a thread, downgrading the outcome if it panicked.
fn join_unit(handle: JoinHandle<()>, unit: &str, outcome: &mut Outcome) {
    if handle.join().is_err() && matches!(outcome, Outcome::Finished(_)) {
        *outcome = Outcome::Failed(EngineError::task_failure(unit, "panicked"));
    }
}
