//! The operator task: one parallel instance of the keyed aggregation.
//!
//! Each task owns the accumulators for its partition outright and runs
//! record processing and snapshotting strictly interleaved on its own
//! thread, so no locks guard the state.
//!
//! Per-task checkpoint state machine:
//!
//! RUNNING -> (barrier arrives on some input) -> ALIGNING ->
//! (barriers arrived on every live input) -> SNAPSHOTTING ->
//! (snapshot acked, barrier forwarded) -> RUNNING
//!
//! While aligning, the inputs whose barrier has already arrived are
//! not read (their post-barrier records stay queued in the channel,
//! backpressuring the producer); the other inputs keep being processed
//! until their matching barrier arrives. That is what makes the
//! snapshot a consistent cut: it reflects exactly the records before
//! the barrier on every input. Failure while aligning or snapshotting
//! aborts that checkpoint attempt only.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use crossbeam_channel::Select;
use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::coordinator::CoordMsg;
use crate::fold::FoldLogic;
use crate::outputs::SinkMessage;
use crate::recovery::CheckpointId;
use crate::route::feed;
use crate::route::PartitionIndex;
use crate::route::Record;
use crate::route::StreamMessage;
use crate::route::COOLDOWN;
use crate::state::KeyedState;
use crate::state::StateChange;
use crate::worker::ControlMsg;

enum Phase {
    Running,
    Aligning {
        id: CheckpointId,
        /// Which inputs this checkpoint's barrier has arrived on.
        arrived: Vec<bool>,
    },
}

/// Why the processing loop stopped.
enum Stop {
    /// Interrupt flag, or a downstream/control channel went away
    /// during halt. Nothing to report.
    Halt,
    /// All inputs hit EOF and the final state was reported.
    Drained,
    /// Task failure was reported to the supervisor.
    Failed,
}

pub(crate) struct TaskRun<V, A> {
    pub(crate) partition: PartitionIndex,
    pub(crate) fold: Arc<dyn FoldLogic<V, A>>,
    pub(crate) state: KeyedState<A>,
    pub(crate) inputs: Vec<Receiver<StreamMessage<V>>>,
    pub(crate) emit: Sender<SinkMessage<A>>,
    pub(crate) coord: Sender<CoordMsg>,
    pub(crate) control: Sender<ControlMsg>,
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl<V, A> TaskRun<V, A>
where
    A: Clone + Serialize + DeserializeOwned,
{
    fn unit(&self) -> String {
        format!("task-{}", self.partition)
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("{} start with {} keys restored", self.unit(), self.state.len());
        let mut eof = vec![false; self.inputs.len()];
        let mut phase = Phase::Running;
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                tracing::debug!("{} interrupted", self.unit());
                return;
            }
            if eof.iter().all(|done| *done) {
                if matches!(self.finish(), Stop::Drained) {
                    tracing::debug!("{} drained", self.unit());
                }
                return;
            }
            let readable: Vec<usize> = (0..self.inputs.len())
                .filter(|i| !eof[*i] && !blocked(&phase, *i))
                .collect();
            if readable.is_empty() {
                // Alignment leaves at least one live input readable or
                // completes eagerly; getting here means a race with
                // EOF marking. Just re-check.
                std::thread::sleep(COOLDOWN);
                continue;
            }
            let received = {
                let mut sel = Select::new();
                for i in &readable {
                    sel.recv(&self.inputs[*i]);
                }
                match sel.select_timeout(COOLDOWN) {
                    Ok(oper) => {
                        let i = readable[oper.index()];
                        (i, oper.recv(&self.inputs[i]))
                    }
                    Err(_) => continue,
                }
            };
            match received {
                (i, Err(_)) => {
                    // A producer vanished without an EOF marker; that
                    // only happens during halt, but close out the
                    // input either way.
                    eof[i] = true;
                    if self.check_aligned(&mut phase, &eof).is_err() {
                        return;
                    }
                }
                (_, Ok(StreamMessage::Record(record))) => {
                    if self.process(record).is_err() {
                        return;
                    }
                }
                (i, Ok(StreamMessage::Barrier(id))) => {
                    self.observe_barrier(&mut phase, i, id);
                    if self.check_aligned(&mut phase, &eof).is_err() {
                        return;
                    }
                }
                (i, Ok(StreamMessage::Eof)) => {
                    tracing::debug!("{} input {i} EOF", self.unit());
                    eof[i] = true;
                    if self.check_aligned(&mut phase, &eof).is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Fold one record into its key's accumulator and forward the new
    /// aggregate downstream.
    fn process(&mut self, record: Record<V>) -> Result<(), Stop> {
        let fold = Arc::clone(&self.fold);
        let acc = self.state.take_or_init(&record.key, || fold.initial());
        let acc = match fold.fold(acc, &record) {
            Ok(acc) => acc,
            Err(err) => {
                // Never retried per-record: partial retry could break
                // exactly-once accounting, so this is a task failure.
                tracing::error!("{} fold failed: {err}", self.unit());
                let _ = self.control.send(ControlMsg::Failed {
                    unit: self.unit(),
                    reason: err.to_string(),
                });
                return Err(Stop::Failed);
            }
        };
        self.state
            .apply(record.key.clone(), StateChange::Upsert(acc.clone()));
        feed(
            &self.emit,
            SinkMessage::Emit {
                key: record.key,
                value: acc,
                timestamp: record.timestamp,
            },
            &self.interrupt,
        )
        .map_err(|_| Stop::Halt)
    }

    /// Note a barrier arrival on one input: RUNNING -> ALIGNING, or
    /// progress (or restart) an alignment already underway.
    fn observe_barrier(&mut self, phase: &mut Phase, input: usize, id: CheckpointId) {
        match phase {
            Phase::Running => {
                tracing::debug!("{} aligning for {id}", self.unit());
                let mut arrived = vec![false; self.inputs.len()];
                arrived[input] = true;
                *phase = Phase::Aligning { id, arrived };
            }
            Phase::Aligning {
                id: pending,
                arrived,
            } => {
                if id == *pending {
                    arrived[input] = true;
                } else if id > *pending {
                    // The coordinator discarded the pending attempt
                    // and moved on; abort it locally and align for the
                    // newer one.
                    tracing::warn!(
                        "{} abandoning alignment for {pending}, saw {id}",
                        self.unit()
                    );
                    let mut arrived = vec![false; self.inputs.len()];
                    arrived[input] = true;
                    *phase = Phase::Aligning { id, arrived };
                } else {
                    tracing::warn!("{} ignoring stale barrier for {id}", self.unit());
                }
            }
        }
    }

    /// If every live input's barrier has arrived, snapshot, ack the
    /// coordinator, forward the barrier downstream, and resume.
    /// `Err(Stop)` means the loop should exit (halt in progress).
    fn check_aligned(&mut self, phase: &mut Phase, eof: &[bool]) -> Result<(), Stop> {
        let id = match phase {
            Phase::Aligning { id, arrived }
                if arrived
                    .iter()
                    .zip(eof)
                    .all(|(arrived, eof)| *arrived || *eof) =>
            {
                *id
            }
            _ => return Ok(()),
        };
        *phase = Phase::Running;
        tracing::debug!("{} snapshotting for {id}", self.unit());
        match self.state.snapshot() {
            Ok(image) => {
                let _ = self.coord.send(CoordMsg::TaskAck {
                    id,
                    partition: self.partition,
                    state: image,
                });
                feed(&self.emit, SinkMessage::Barrier(id), &self.interrupt)
                    .map_err(|_| Stop::Halt)
            }
            Err(err) => {
                // Aborts this checkpoint attempt only; the previous
                // committed checkpoint stays valid and we keep
                // running.
                tracing::warn!("{} aborting {id}: {err}", self.unit());
                let _ = self.coord.send(CoordMsg::TaskAbort {
                    id,
                    partition: self.partition,
                    reason: err.to_string(),
                });
                Ok(())
            }
        }
    }

    /// All inputs are exhausted: flush EOF downstream and report the
    /// final accumulator set to the supervisor.
    fn finish(&mut self) -> Stop {
        if feed(
            &self.emit,
            SinkMessage::Eof(self.partition),
            &self.interrupt,
        )
        .is_err()
        {
            return Stop::Halt;
        }
        match self.state.snapshot() {
            Ok(image) => {
                let _ = self.control.send(ControlMsg::TaskFinished {
                    partition: self.partition,
                    state: image,
                });
                Stop::Drained
            }
            Err(err) => {
                let _ = self.control.send(ControlMsg::Failed {
                    unit: self.unit(),
                    reason: err.to_string(),
                });
                Stop::Failed
            }
        }
    }
}

fn blocked(phase: &Phase, input: usize) -> bool {
    match phase {
        Phase::Running => false,
        Phase::Aligning { arrived, .. } => arrived[input],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fold::SumFold;
    use crate::state::StateKey;

    struct Harness {
        in_txs: Vec<Sender<StreamMessage<i64>>>,
        emits: Receiver<SinkMessage<i64>>,
        coord: Receiver<CoordMsg>,
        control: Receiver<ControlMsg>,
        handle: std::thread::JoinHandle<()>,
    }

    fn spawn_task(n_inputs: usize) -> Harness {
        let mut in_txs = Vec::new();
        let mut in_rxs = Vec::new();
        for _ in 0..n_inputs {
            let (tx, rx) = crossbeam_channel::bounded(16);
            in_txs.push(tx);
            in_rxs.push(rx);
        }
        let (emit_tx, emit_rx) = crossbeam_channel::bounded(64);
        let (coord_tx, coord_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let task = TaskRun {
            partition: PartitionIndex(0),
            fold: Arc::new(SumFold),
            state: KeyedState::default(),
            inputs: in_rxs,
            emit: emit_tx,
            coord: coord_tx,
            control: control_tx,
            interrupt: Arc::new(AtomicBool::new(false)),
        };
        let handle = std::thread::spawn(move || task.run());
        Harness {
            in_txs,
            emits: emit_rx,
            coord: coord_rx,
            control: control_rx,
            handle,
        }
    }

    const WAIT: std::time::Duration = std::time::Duration::from_secs(5);

    #[test]
    fn folds_and_emits_running_aggregates() {
        let harness = spawn_task(1);
        for record in [
            Record::new("a", 1, 0),
            Record::new("a", 2, 1),
            Record::new("b", 5, 2),
        ] {
            harness.in_txs[0]
                .send(StreamMessage::Record(record))
                .unwrap();
        }
        harness.in_txs[0].send(StreamMessage::Eof).unwrap();

        let mut emitted = Vec::new();
        loop {
            match harness.emits.recv_timeout(WAIT).unwrap() {
                SinkMessage::Emit { key, value, .. } => emitted.push((key, value)),
                SinkMessage::Eof(_) => break,
                SinkMessage::Barrier(_) => {}
            }
        }
        assert_eq!(
            emitted,
            vec![
                (StateKey::from("a"), 1),
                (StateKey::from("a"), 3),
                (StateKey::from("b"), 5),
            ]
        );
        let ControlMsg::TaskFinished { state, .. } = harness.control.recv_timeout(WAIT).unwrap()
        else {
            panic!("expected TaskFinished");
        };
        let final_state = KeyedState::<i64>::restore(&state).unwrap();
        assert_eq!(final_state.get(&StateKey::from("a")), Some(&3));
        assert_eq!(final_state.get(&StateKey::from("b")), Some(&5));
        harness.handle.join().unwrap();
    }

    #[test]
    fn alignment_cuts_exactly_at_the_barriers() {
        let harness = spawn_task(2);
        let id = CheckpointId(1);
        // Input 0: one pre-barrier record, then its barrier, then a
        // post-barrier record that must NOT be in the snapshot.
        harness.in_txs[0]
            .send(StreamMessage::Record(Record::new("a", 1, 0)))
            .unwrap();
        harness.in_txs[0].send(StreamMessage::Barrier(id)).unwrap();
        harness.in_txs[0]
            .send(StreamMessage::Record(Record::new("a", 100, 9)))
            .unwrap();
        // Input 1: a pre-barrier record that MUST be in the snapshot,
        // then its barrier.
        harness.in_txs[1]
            .send(StreamMessage::Record(Record::new("b", 7, 1)))
            .unwrap();
        harness.in_txs[1].send(StreamMessage::Barrier(id)).unwrap();

        let CoordMsg::TaskAck {
            id: acked,
            state,
            ..
        } = harness.coord.recv_timeout(WAIT).unwrap()
        else {
            panic!("expected TaskAck");
        };
        assert_eq!(acked, id);
        let snapshot = KeyedState::<i64>::restore(&state).unwrap();
        assert_eq!(snapshot.get(&StateKey::from("a")), Some(&1));
        assert_eq!(snapshot.get(&StateKey::from("b")), Some(&7));

        // The post-barrier record is processed after resuming.
        harness.in_txs[0].send(StreamMessage::Eof).unwrap();
        harness.in_txs[1].send(StreamMessage::Eof).unwrap();
        let ControlMsg::TaskFinished { state, .. } = harness.control.recv_timeout(WAIT).unwrap()
        else {
            panic!("expected TaskFinished");
        };
        let final_state = KeyedState::<i64>::restore(&state).unwrap();
        assert_eq!(final_state.get(&StateKey::from("a")), Some(&101));
        harness.handle.join().unwrap();
    }

    #[test]
    fn barrier_is_forwarded_downstream_after_snapshot() {
        let harness = spawn_task(1);
        harness.in_txs[0]
            .send(StreamMessage::Barrier(CheckpointId(1)))
            .unwrap();
        loop {
            if let SinkMessage::Barrier(id) = harness.emits.recv_timeout(WAIT).unwrap() {
                assert_eq!(id, CheckpointId(1));
                break;
            }
        }
        harness.in_txs[0].send(StreamMessage::Eof).unwrap();
        harness.handle.join().unwrap();
    }

    #[test]
    fn eof_on_one_input_completes_alignment() {
        let harness = spawn_task(2);
        harness.in_txs[1].send(StreamMessage::Eof).unwrap();
        // Give the EOF a moment to land so alignment only waits on
        // input 0.
        std::thread::sleep(std::time::Duration::from_millis(100));
        harness.in_txs[0]
            .send(StreamMessage::Barrier(CheckpointId(1)))
            .unwrap();
        let CoordMsg::TaskAck { id, .. } = harness.coord.recv_timeout(WAIT).unwrap() else {
            panic!("expected TaskAck");
        };
        assert_eq!(id, CheckpointId(1));
        harness.in_txs[0].send(StreamMessage::Eof).unwrap();
        harness.handle.join().unwrap();
    }

    #[test]
    fn fold_error_reports_task_failure() {
        struct PoisonFold;
        impl FoldLogic<i64, i64> for PoisonFold {
            fn initial(&self) -> i64 {
                0
            }
            fn fold(
                &self,
                acc: i64,
                record: &Record<i64>,
            ) -> Result<i64, crate::fold::FoldError> {
                if record.value < 0 {
                    Err("negative value".into())
                } else {
                    Ok(acc + record.value)
                }
            }
        }

        let (tx, rx) = crossbeam_channel::bounded(16);
        let (emit_tx, _emit_rx) = crossbeam_channel::bounded(64);
        let (coord_tx, _coord_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let task: TaskRun<i64, i64> = TaskRun {
            partition: PartitionIndex(3),
            fold: Arc::new(PoisonFold),
            state: KeyedState::default(),
            inputs: vec![rx],
            emit: emit_tx,
            coord: coord_tx,
            control: control_tx,
            interrupt: Arc::new(AtomicBool::new(false)),
        };
        let handle = std::thread::spawn(move || task.run());
        tx.send(StreamMessage::Record(Record::new("a", -1, 0)))
            .unwrap();
        let ControlMsg::Failed { unit, reason } = control_rx.recv_timeout(WAIT).unwrap() else {
            panic!("expected Failed");
        };
        assert_eq!(unit, "task-3");
        assert!(reason.contains("negative"));
        handle.join().unwrap();
    }
}
