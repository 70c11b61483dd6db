//! In-memory checkpoint store.
//!
//! Keeps committed blobs in a [`BTreeMap`] so ids come back in order.
//! Used by tests and by jobs that want rollback-on-failure within one
//! process without surviving a process restart.

use std::collections::BTreeMap;

use crate::errors::EngineResult;

use super::CheckpointId;
use super::CheckpointStore;

#[derive(Debug, Default)]
pub struct InMemStore {
    blobs: BTreeMap<CheckpointId, Vec<u8>>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemStore {
    fn save(&mut self, id: CheckpointId, blob: &[u8]) -> EngineResult<()> {
        self.blobs.insert(id, blob.to_vec());
        Ok(())
    }

    fn load(&self, id: CheckpointId) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(&id).cloned())
    }

    fn ids(&self) -> EngineResult<Vec<CheckpointId>> {
        Ok(self.blobs.keys().copied().collect())
    }

    fn delete(&mut self, id: CheckpointId) -> EngineResult<()> {
        self.blobs.remove(&id);
        Ok(())
    }
}
