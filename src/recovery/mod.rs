//! Checkpoint model: the durable artifacts that make restart-from-
//! checkpoint possible.
//!
//! A checkpoint is an immutable, versioned cut of the whole job: every
//! partition's accumulator image plus every source's read position,
//! all corresponding to the same barrier. Images are sealed into
//! versioned binary blobs with a checksum so corruption is detected at
//! restore time rather than silently replayed into state.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;

use crate::backoff::Backoff;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::inputs::SourceIndex;
use crate::route::PartitionIndex;
use crate::state::StateBytes;

pub(crate) mod in_mem;
pub(crate) mod sqlite;

pub use in_mem::InMemStore;
pub use sqlite::SqliteStore;

/// Version stamp for the sealed blob layout. Bump on any change to
/// [`CheckpointImage`] serialization.
const FORMAT_VERSION: u32 = 1;

/// Monotonically increasing ID for one checkpoint attempt.
///
/// Assigned only by the coordinator; ids of discarded attempts are
/// never reused.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub(crate) fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "checkpoint {}", self.0)
    }
}

/// Replay position of a source: how many records it has emitted.
///
/// Captured at barrier injection time, so a restore that seeks here
/// replays exactly the records after the cut.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OffsetMarker(pub u64);

/// A consistent point-in-time snapshot of the whole job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointImage {
    pub checkpoint_id: CheckpointId,
    pub created_at: DateTime<Utc>,
    /// Read position per source at the barrier cut.
    pub sources: Vec<(SourceIndex, OffsetMarker)>,
    /// Serialized accumulator set per partition at the barrier cut.
    pub partitions: Vec<(PartitionIndex, StateBytes)>,
}

/// On-storage wrapper: format version, checksum, payload.
#[derive(Debug, Serialize, Deserialize)]
struct SealedImage {
    format_version: u32,
    checksum: u64,
    payload: Vec<u8>,
}

impl CheckpointImage {
    /// Encode into the versioned, checksummed storage blob.
    pub fn seal(&self) -> EngineResult<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|err| EngineError::CorruptState(format!("can't encode image: {err}")))?;
        let sealed = SealedImage {
            format_version: FORMAT_VERSION,
            checksum: seahash::hash(&payload),
            payload,
        };
        bincode::serialize(&sealed)
            .map_err(|err| EngineError::CorruptState(format!("can't seal image: {err}")))
    }

    /// Decode a storage blob, validating version and checksum.
    pub fn unseal(blob: &[u8]) -> EngineResult<Self> {
        let sealed: SealedImage = bincode::deserialize(blob)
            .map_err(|err| EngineError::CorruptState(format!("unreadable image blob: {err}")))?;
        if sealed.format_version != FORMAT_VERSION {
            return Err(EngineError::CorruptState(format!(
                "image format version {} but this build reads {}",
                sealed.format_version, FORMAT_VERSION
            )));
        }
        let checksum = seahash::hash(&sealed.payload);
        if checksum != sealed.checksum {
            return Err(EngineError::CorruptState(format!(
                "image checksum mismatch: stored {:#x}, computed {:#x}",
                sealed.checksum, checksum
            )));
        }
        bincode::deserialize(&sealed.payload)
            .map_err(|err| EngineError::CorruptState(format!("undecodable image payload: {err}")))
    }
}

/// Durable storage for committed checkpoint blobs.
///
/// Stores only ever see fully committed checkpoints; the coordinator
/// assembles and seals images before they get here, so a row present
/// in a store is by definition part of a consistent cut.
pub trait CheckpointStore: Send {
    fn save(&mut self, id: CheckpointId, blob: &[u8]) -> EngineResult<()>;

    fn load(&self, id: CheckpointId) -> EngineResult<Option<Vec<u8>>>;

    /// All stored checkpoint ids, ascending.
    fn ids(&self) -> EngineResult<Vec<CheckpointId>>;

    fn delete(&mut self, id: CheckpointId) -> EngineResult<()>;
}

/// Run a store operation, retrying transient I/O errors with bounded
/// backoff. Exhausting the schedule returns the last transient error;
/// any other error returns immediately.
fn with_retry<T>(what: &str, mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
    let mut backoff = Backoff::default();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(EngineError::TransientIo(reason)) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        "transient error during {what}, retrying in {delay:?}: {reason}"
                    );
                    std::thread::sleep(delay);
                }
                None => return Err(EngineError::TransientIo(reason)),
            },
            Err(err) => return Err(err),
        }
    }
}

/// Shared handle to the checkpoint store.
///
/// The coordinator commits and garbage collects through this; the
/// supervisor restores through it. Committing the newest image is the
/// atomic "latest valid checkpoint" pointer update: restore always
/// walks ids descending, so the newest readable committed image wins.
#[derive(Clone)]
pub(crate) struct CheckpointVault {
    store: Arc<Mutex<Box<dyn CheckpointStore>>>,
    retain: usize,
    commits: Arc<AtomicU64>,
}

impl CheckpointVault {
    pub(crate) fn new(store: Box<dyn CheckpointStore>, retain: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            retain,
            commits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of checkpoints committed over the life of this vault,
    /// across restarts.
    pub(crate) fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Durably commit an image, retrying transient storage errors with
    /// backoff, then garbage collect beyond the retention count.
    ///
    /// Returns `Ok(false)` when storage stayed unavailable through the
    /// whole retry schedule: the checkpoint attempt is abandoned, the
    /// previous committed checkpoint remains the latest, and the job
    /// keeps running.
    pub(crate) fn commit(&self, image: &CheckpointImage) -> EngineResult<bool> {
        let blob = image.seal()?;
        let saved = with_retry("checkpoint save", || {
            self.store
                .lock()
                .expect("checkpoint store poisoned")
                .save(image.checkpoint_id, &blob)
        });
        match saved {
            Ok(()) => {}
            Err(EngineError::TransientIo(reason)) => {
                tracing::warn!(
                    "abandoning {} after repeated storage errors: {reason}",
                    image.checkpoint_id
                );
                return Ok(false);
            }
            Err(err) => return Err(err),
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        tracing::info!("committed {}", image.checkpoint_id);
        self.gc();
        Ok(true)
    }

    /// Delete committed images beyond the retention count, oldest
    /// first. GC failure is logged and retried implicitly on the next
    /// commit; it never fails a commit.
    fn gc(&self) {
        let mut store = self.store.lock().expect("checkpoint store poisoned");
        let ids = match store.ids() {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!("skipping checkpoint GC, can't list store: {err}");
                return;
            }
        };
        if ids.len() <= self.retain {
            return;
        }
        let excess = ids.len() - self.retain;
        for id in ids.into_iter().take(excess) {
            match store.delete(id) {
                Ok(()) => tracing::debug!("garbage collected {id}"),
                Err(err) => tracing::warn!("can't garbage collect {id}: {err}"),
            }
        }
    }

    /// The newest committed checkpoint that validates, or `None` for a
    /// fresh start.
    ///
    /// Corrupt images are skipped with a warning and the next older
    /// committed image is tried, per the store fallback contract.
    #[instrument(name = "restore_latest", skip_all)]
    pub(crate) fn restore_latest(&self) -> EngineResult<Option<CheckpointImage>> {
        let mut ids = with_retry("checkpoint list", || {
            self.store.lock().expect("checkpoint store poisoned").ids()
        })?;
        ids.reverse();
        for id in ids {
            let Some(blob) = with_retry("checkpoint read", || {
                self.store
                    .lock()
                    .expect("checkpoint store poisoned")
                    .load(id)
            })?
            else {
                continue;
            };
            match CheckpointImage::unseal(&blob) {
                Ok(image) => {
                    tracing::info!("restoring from {id}");
                    return Ok(Some(image));
                }
                Err(err) => {
                    tracing::warn!("{id} is unusable, falling back to older: {err}");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    /// Delegates to an [`InMemStore`] but fails reads with transient
    /// errors while the shared counter is above zero.
    struct FlakyStore {
        inner: InMemStore,
        read_failures: Arc<AtomicU32>,
    }

    impl FlakyStore {
        fn hiccup(&self) -> EngineResult<()> {
            let left = self.read_failures.load(Ordering::Relaxed);
            if left > 0 {
                self.read_failures.store(left - 1, Ordering::Relaxed);
                return Err(EngineError::TransientIo(String::from(
                    "simulated storage hiccup",
                )));
            }
            Ok(())
        }
    }

    impl CheckpointStore for FlakyStore {
        fn save(&mut self, id: CheckpointId, blob: &[u8]) -> EngineResult<()> {
            self.inner.save(id, blob)
        }

        fn load(&self, id: CheckpointId) -> EngineResult<Option<Vec<u8>>> {
            self.hiccup()?;
            self.inner.load(id)
        }

        fn ids(&self) -> EngineResult<Vec<CheckpointId>> {
            self.hiccup()?;
            self.inner.ids()
        }

        fn delete(&mut self, id: CheckpointId) -> EngineResult<()> {
            self.inner.delete(id)
        }
    }

    fn sample_image(id: u64) -> CheckpointImage {
        CheckpointImage {
            checkpoint_id: CheckpointId(id),
            created_at: Utc::now(),
            sources: vec![(SourceIndex(0), OffsetMarker(17))],
            partitions: vec![(PartitionIndex(0), StateBytes(vec![1, 2, 3]))],
        }
    }

    #[test]
    fn seal_unseal_round_trip() {
        let image = sample_image(3);
        let blob = image.seal().unwrap();
        assert_eq!(CheckpointImage::unseal(&blob).unwrap(), image);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut blob = sample_image(3).seal().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(
            CheckpointImage::unseal(&blob),
            Err(EngineError::CorruptState(_))
        ));
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let blob = sample_image(3).seal().unwrap();
        assert!(matches!(
            CheckpointImage::unseal(&blob[..blob.len() / 2]),
            Err(EngineError::CorruptState(_))
        ));
    }

    #[test]
    fn vault_restores_newest_committed() {
        let vault = CheckpointVault::new(Box::new(InMemStore::default()), 5);
        assert!(vault.restore_latest().unwrap().is_none());
        assert!(vault.commit(&sample_image(1)).unwrap());
        assert!(vault.commit(&sample_image(2)).unwrap());
        let restored = vault.restore_latest().unwrap().unwrap();
        assert_eq!(restored.checkpoint_id, CheckpointId(2));
        assert_eq!(vault.commit_count(), 2);
    }

    #[test]
    fn vault_falls_back_past_corrupt_image() {
        let store = InMemStore::default();
        let vault = CheckpointVault::new(Box::new(store), 5);
        assert!(vault.commit(&sample_image(1)).unwrap());
        // Overwrite id 2 with garbage behind the vault's back.
        {
            let mut store = vault.store.lock().unwrap();
            store.save(CheckpointId(2), b"not an image").unwrap();
        }
        let restored = vault.restore_latest().unwrap().unwrap();
        assert_eq!(restored.checkpoint_id, CheckpointId(1));
    }

    #[test]
    fn vault_gc_keeps_retention_count() {
        let vault = CheckpointVault::new(Box::new(InMemStore::default()), 2);
        for id in 1..=5 {
            assert!(vault.commit(&sample_image(id)).unwrap());
        }
        let ids = vault.store.lock().unwrap().ids().unwrap();
        assert_eq!(ids, vec![CheckpointId(4), CheckpointId(5)]);
    }

    #[test]
    fn restore_retries_transient_store_errors() {
        let read_failures = Arc::new(AtomicU32::new(0));
        let vault = CheckpointVault::new(
            Box::new(FlakyStore {
                inner: InMemStore::new(),
                read_failures: Arc::clone(&read_failures),
            }),
            5,
        );
        assert!(vault.commit(&sample_image(1)).unwrap());
        // Two transient read errors in a row; restore must ride them
        // out instead of surfacing the error.
        read_failures.store(2, Ordering::Relaxed);
        let restored = vault.restore_latest().unwrap().unwrap();
        assert_eq!(restored.checkpoint_id, CheckpointId(1));
        assert_eq!(read_failures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn restore_of_same_image_is_idempotent() {
        let vault = CheckpointVault::new(Box::new(InMemStore::default()), 5);
        assert!(vault.commit(&sample_image(7)).unwrap());
        let once = vault.restore_latest().unwrap().unwrap();
        let twice = vault.restore_latest().unwrap().unwrap();
        assert_eq!(once, twice);
    }
}
