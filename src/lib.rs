//! Keyed-state streaming aggregation with aligned-barrier
//! checkpointing.
//!
//! A job reads records from replayable sources, hash-routes them by
//! key to parallel operator tasks, folds each key's records into an
//! accumulator, and writes updates to a sink. A coordinator
//! periodically injects barriers at the sources; tasks align on them
//! and snapshot their keyed state, and the coordinator commits the
//! resulting consistent cut as a checkpoint. On any failure the whole
//! topology rolls back to the latest committed checkpoint, sources
//! seek to their recorded offsets, and processing resumes with
//! exactly-once state semantics.
//!
//! Build a job with [`JobBuilder`]; see its docs for a worked example.

mod backoff;
pub mod config;
mod coordinator;
pub mod errors;
pub mod fold;
pub mod inputs;
pub mod outputs;
pub mod recovery;
pub mod route;
pub mod run;
pub mod state;
mod task;
mod worker;

pub use crate::config::EngineConfig;
pub use crate::errors::EngineError;
pub use crate::errors::EngineResult;
pub use crate::fold::FoldError;
pub use crate::fold::FoldLogic;
pub use crate::fold::SumFold;
pub use crate::inputs::SourceIndex;
pub use crate::inputs::UnboundedSource;
pub use crate::inputs::VecSource;
pub use crate::outputs::Sink;
pub use crate::outputs::SinkError;
pub use crate::outputs::VecSink;
pub use crate::recovery::CheckpointId;
pub use crate::recovery::CheckpointStore;
pub use crate::recovery::InMemStore;
pub use crate::recovery::OffsetMarker;
pub use crate::recovery::SqliteStore;
pub use crate::route::PartitionCount;
pub use crate::route::PartitionIndex;
pub use crate::route::Record;
pub use crate::run::setup_logging;
pub use crate::run::JobBuilder;
pub use crate::run::JobReport;
pub use crate::state::StateKey;
