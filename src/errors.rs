//! Error taxonomy for the execution core.
//!
//! The split matters for recovery behavior: transient I/O is retried,
//! corrupt checkpoint images only invalidate that image, alignment
//! timeouts only invalidate that checkpoint attempt, and task failures
//! trigger a global rollback to the last committed checkpoint.

use crate::recovery::CheckpointId;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Startup-time configuration problems. Fail fast, never partially
    /// execute.
    #[error("invalid config: {0}")]
    Config(String),

    /// A read or write that is worth retrying before giving up on the
    /// operation it was part of.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A checkpoint image failed its version or checksum validation.
    /// Fatal to that image only; the caller should fall back to an
    /// older checkpoint.
    #[error("corrupt state image: {0}")]
    CorruptState(String),

    /// Barriers for a checkpoint did not align within the configured
    /// timeout. Aborts that checkpoint attempt only: the coordinator
    /// discards the attempt and logs it, keeping the job running, so
    /// this variant never surfaces from [`crate::run::JobBuilder::run`].
    #[error("checkpoint {0} did not align before the timeout")]
    AlignmentTimeout(CheckpointId),

    /// A processing unit failed. Per-record errors from the
    /// user-supplied fold land here on purpose: retrying a single
    /// record could break exactly-once accounting, so the whole
    /// topology rolls back instead.
    #[error("{unit} failed: {reason}")]
    TaskFailure { unit: String, reason: String },

    /// The caller raised the cancel flag. All tasks stop and
    /// uncommitted checkpoint attempts are discarded; committed
    /// checkpoints stay in the store for a later resume.
    #[error("job cancelled")]
    Cancelled,
}

impl EngineError {
    pub(crate) fn task_failure(unit: impl Into<String>, reason: impl ToString) -> Self {
        Self::TaskFailure {
            unit: unit.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

impl From<rusqlite_migration::Error> for EngineError {
    fn from(err: rusqlite_migration::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}
