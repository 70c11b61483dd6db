//! Keyed state: the per-partition mapping from key to accumulator.
//!
//! A [`KeyedState`] is owned by exactly one operator task and is only
//! ever touched from that task's thread, so there is no locking here.
//! Snapshot consistency comes from the barrier protocol: a task only
//! calls [`KeyedState::snapshot`] while its inputs are aligned, never
//! concurrently with updates.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Key to route state within the dataflow.
///
/// Restricted to strings rather than any hashable type because the key
/// interfaces with routing, snapshots, and the checkpoint image format,
/// all of which need stable hashing, equality, and serde.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKey(pub String);

impl StateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for StateKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

/// Serialized state for one partition.
///
/// The checkpoint machinery only deals in bytes so it does not need to
/// be generic over every accumulator type that flows through a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub(crate) Vec<u8>);

impl StateBytes {
    /// Serialize a state object into bytes the checkpoint system can
    /// store.
    pub(crate) fn ser<T: Serialize>(obj: &T) -> EngineResult<Self> {
        let bytes = bincode::serialize(obj).map_err(|err| {
            EngineError::CorruptState(format!(
                "can't serialize {}: {err}",
                std::any::type_name::<T>()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Deserialize bytes from the checkpoint system back into a state
    /// object.
    pub(crate) fn de<T: DeserializeOwned>(&self) -> EngineResult<T> {
        bincode::deserialize(&self.0).map_err(|err| {
            EngineError::CorruptState(format!(
                "can't deserialize {}: {err}",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// A change to the value for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange<A> {
    /// Value was created or updated.
    Upsert(A),
    /// Key was evicted.
    Discard,
}

/// Per-partition key to accumulator map with snapshot and restore.
#[derive(Debug)]
pub struct KeyedState<A> {
    cache: HashMap<StateKey, A>,
}

impl<A> Default for KeyedState<A> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }
}

impl<A> KeyedState<A> {
    pub fn get(&self, key: &StateKey) -> Option<&A> {
        self.cache.get(key)
    }

    /// Take the accumulator for a key out of the map, building the
    /// default if this is the first occurrence of the key.
    pub fn take_or_init(&mut self, key: &StateKey, init: impl FnOnce() -> A) -> A {
        self.cache.remove(key).unwrap_or_else(init)
    }

    pub fn apply(&mut self, key: StateKey, change: StateChange<A>) {
        match change {
            StateChange::Upsert(acc) => {
                self.cache.insert(key, acc);
            }
            StateChange::Discard => {
                self.cache.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl<A> KeyedState<A>
where
    A: Serialize + DeserializeOwned,
{
    /// Serialize the full accumulator set into an immutable image.
    pub fn snapshot(&self) -> EngineResult<StateBytes> {
        // Stable order so identical states produce identical images.
        let mut entries: Vec<(&StateKey, &A)> = self.cache.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        StateBytes::ser(&entries)
    }

    /// Rebuild a state store from a snapshot image.
    ///
    /// Fails with [`EngineError::CorruptState`] if the bytes don't
    /// decode; the caller falls back to an earlier checkpoint.
    pub fn restore(image: &StateBytes) -> EngineResult<Self> {
        let entries: Vec<(StateKey, A)> = image.de()?;
        Ok(Self {
            cache: entries.into_iter().collect(),
        })
    }

    pub fn into_map(self) -> HashMap<StateKey, A> {
        self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> KeyedState<i64> {
        let mut state = KeyedState::default();
        state.apply(StateKey::from("a"), StateChange::Upsert(2));
        state.apply(StateKey::from("b"), StateChange::Upsert(1));
        state
    }

    #[test]
    fn take_or_init_builds_default_once() {
        let mut state: KeyedState<i64> = KeyedState::default();
        assert_eq!(state.take_or_init(&StateKey::from("a"), || 7), 7);
        state.apply(StateKey::from("a"), StateChange::Upsert(9));
        assert_eq!(state.take_or_init(&StateKey::from("a"), || 7), 9);
    }

    #[test]
    fn discard_evicts() {
        let mut state = sample_state();
        state.apply(StateKey::from("a"), StateChange::Discard);
        assert_eq!(state.get(&StateKey::from("a")), None);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let state = sample_state();
        let image = state.snapshot().unwrap();
        let restored = KeyedState::<i64>::restore(&image).unwrap();
        assert_eq!(restored.get(&StateKey::from("a")), Some(&2));
        assert_eq!(restored.get(&StateKey::from("b")), Some(&1));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn restore_is_idempotent() {
        let image = sample_state().snapshot().unwrap();
        let once = KeyedState::<i64>::restore(&image).unwrap().into_map();
        let twice = KeyedState::<i64>::restore(&image).unwrap().into_map();
        assert_eq!(once, twice);
    }

    #[test]
    fn identical_states_snapshot_identically() {
        let a = sample_state().snapshot().unwrap();
        let b = sample_state().snapshot().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn garbage_bytes_are_corrupt_state() {
        let image = StateBytes(vec![0xff, 0x00, 0xff]);
        assert!(matches!(
            KeyedState::<i64>::restore(&image),
            Err(EngineError::CorruptState(_))
        ));
    }
}
