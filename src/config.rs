//! Configuration surface consumed by the execution core.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Knobs for a job run.
///
/// All durations are milliseconds so the struct stays JSON-friendly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of parallel operator tasks. Keys are hashed over this
    /// many partitions; it must stay fixed for the lifetime of a job.
    pub parallelism: usize,
    /// How often the coordinator starts a new checkpoint.
    pub checkpoint_interval_ms: u64,
    /// How long the coordinator waits for all acknowledgments before
    /// discarding an in-progress checkpoint.
    pub checkpoint_timeout_ms: u64,
    /// How many committed checkpoints to keep around. Older images are
    /// garbage collected after each commit.
    pub retained_checkpoint_count: usize,
    /// Capacity of each data channel. A full channel blocks the
    /// producer; records are never dropped.
    pub channel_capacity: usize,
    /// How many rollback-restarts the supervisor performs before
    /// surfacing the task failure to the caller.
    pub max_restarts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            checkpoint_interval_ms: 10_000,
            checkpoint_timeout_ms: 30_000,
            retained_checkpoint_count: 3,
            channel_capacity: 256,
            max_restarts: 8,
        }
    }
}

impl EngineConfig {
    /// Fail fast on nonsense values before any thread is spawned.
    pub fn validate(&self) -> EngineResult<()> {
        if self.parallelism == 0 {
            return Err(EngineError::Config(String::from(
                "parallelism must be at least 1",
            )));
        }
        if self.checkpoint_interval_ms == 0 {
            return Err(EngineError::Config(String::from(
                "checkpoint interval must be positive",
            )));
        }
        if self.checkpoint_timeout_ms == 0 {
            return Err(EngineError::Config(String::from(
                "checkpoint timeout must be positive",
            )));
        }
        if self.retained_checkpoint_count == 0 {
            return Err(EngineError::Config(String::from(
                "must retain at least one checkpoint",
            )));
        }
        if self.channel_capacity == 0 {
            return Err(EngineError::Config(String::from(
                "channel capacity must be at least 1",
            )));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EngineError::Config(format!("can't read {path:?}: {err}")))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| EngineError::Config(format!("can't parse {path:?}: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_parallelism_rejected() {
        let config = EngineConfig {
            parallelism: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn zero_retention_rejected() {
        let config = EngineConfig {
            retained_checkpoint_count: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn load_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{{\"parallelism\": 2, \"checkpoint_interval_ms\": 50}}"
        )
        .unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.checkpoint_interval_ms, 50);
        // Unset fields come from the defaults.
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{nope").unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(file.path()),
            Err(EngineError::Config(_))
        ));
    }
}
