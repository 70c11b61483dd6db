//! Public entry point for building and running a job.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::fold::FoldLogic;
use crate::inputs::UnboundedSource;
use crate::outputs::Sink;
use crate::recovery::CheckpointStore;
use crate::recovery::CheckpointVault;
use crate::recovery::InMemStore;
use crate::state::StateKey;
use crate::worker::Worker;

/// Builds a fresh source instance for one execution of the topology.
///
/// Called again after every rollback, so the job never reuses a source
/// whose cursor might be mid-flight.
pub type SourceBuilder<V> =
    Arc<dyn Fn() -> Box<dyn UnboundedSource<V> + Send> + Send + Sync>;

/// Builds a fresh sink instance for one execution of the topology.
pub type SinkBuilder<A> = Arc<dyn Fn() -> Box<dyn Sink<A> + Send> + Send + Sync>;

/// Start up logging to stdout.
///
/// Defaults to the `error` level; override with the usual `RUST_LOG`
/// environment variable.
pub fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error"));
    // Ignore the error if a subscriber is already installed (e.g. in
    // tests running in one process).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// What a completed job hands back to the caller.
#[derive(Debug)]
pub struct JobReport<A> {
    /// Final accumulator per key, merged across all partitions.
    pub final_state: HashMap<StateKey, A>,
    /// How many times the job rolled back to a checkpoint.
    pub restarts: usize,
    /// How many checkpoints were committed over the job's lifetime,
    /// including executions that later rolled back.
    pub checkpoints_committed: u64,
}

/// Assembles a job out of sources, a fold, a sink, and a checkpoint
/// store.
///
/// ```no_run
/// use keyflow::EngineConfig;
/// use keyflow::JobBuilder;
/// use keyflow::Record;
/// use keyflow::SumFold;
/// use keyflow::VecSink;
/// use keyflow::VecSource;
///
/// let records = vec![
///     Record::new("a", 1, 0),
///     Record::new("b", 1, 1),
///     Record::new("a", 1, 2),
/// ];
/// let sink = VecSink::new();
/// let report = JobBuilder::new(EngineConfig::default())
///     .add_source(move || VecSource::new(records.clone()))
///     .fold(SumFold)
///     .sink({
///         let sink = sink.clone();
///         move || sink.clone()
///     })
///     .run()
///     .unwrap();
/// ```
pub struct JobBuilder<V, A> {
    config: EngineConfig,
    fold: Option<Arc<dyn FoldLogic<V, A>>>,
    source_builders: Vec<SourceBuilder<V>>,
    sink_builder: Option<SinkBuilder<A>>,
    store: Option<Box<dyn CheckpointStore>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<V, A> JobBuilder<V, A>
where
    V: Send + 'static,
    A: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            fold: None,
            source_builders: Vec::new(),
            sink_builder: None,
            store: None,
            cancel: None,
        }
    }

    /// Add one parallel source. Sources are indexed in the order
    /// added; checkpointed offsets are matched up by that index, so
    /// keep the order stable across restarts of the process.
    pub fn add_source<S, F>(mut self, builder: F) -> Self
    where
        S: UnboundedSource<V> + Send + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.source_builders.push(Arc::new(move || Box::new(builder())));
        self
    }

    pub fn fold(mut self, fold: impl FoldLogic<V, A> + 'static) -> Self {
        self.fold = Some(Arc::new(fold));
        self
    }

    pub fn sink<K, F>(mut self, builder: F) -> Self
    where
        K: Sink<A> + Send + 'static,
        F: Fn() -> K + Send + Sync + 'static,
    {
        self.sink_builder = Some(Arc::new(move || Box::new(builder())));
        self
    }

    /// Share a cancellation flag with the job. Raising it from any
    /// thread stops all tasks, discards the in-flight checkpoint
    /// attempt, and makes [`JobBuilder::run`] return
    /// [`EngineError::Cancelled`]. Committed checkpoints stay in the
    /// store, so a later job over the same store resumes from the
    /// cancel point.
    pub fn cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Where checkpoint images live. Defaults to an in-memory store,
    /// which survives rollbacks within one process but not process
    /// restarts.
    pub fn store(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Run the job to completion and return the final report.
    ///
    /// Blocks the calling thread until every source is drained and
    /// every task has folded its last record, or until a failure
    /// exhausts the restart budget.
    pub fn run(self) -> EngineResult<JobReport<A>> {
        self.config.validate()?;
        let fold = self
            .fold
            .ok_or_else(|| EngineError::Config(String::from("job has no fold logic")))?;
        let sink_builder = self
            .sink_builder
            .ok_or_else(|| EngineError::Config(String::from("job has no sink")))?;
        if self.source_builders.is_empty() {
            return Err(EngineError::Config(String::from("job has no sources")));
        }
        let store = self
            .store
            .unwrap_or_else(|| Box::new(InMemStore::default()));
        let vault = CheckpointVault::new(store, self.config.retained_checkpoint_count);
        let worker = Worker {
            config: self.config,
            fold,
            source_builders: self.source_builders,
            sink_builder,
            vault,
            cancel: self
                .cancel
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
        };
        worker.run()
    }
}
