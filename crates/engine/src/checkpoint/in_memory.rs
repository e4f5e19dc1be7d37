use std::collections::HashMap;
use std::sync::RwLock;

use batchforge_core::JobInstanceId;

use super::{Checkpoint, CheckpointKey, CheckpointStore, CheckpointStoreError};

/// In-memory checkpoint store.
///
/// Intended for tests/dev. Progress is lost with the process.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<CheckpointKey, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> CheckpointStoreError {
    CheckpointStoreError::Storage("lock poisoned".to_string())
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        let mut checkpoints = self.checkpoints.write().map_err(|_| poisoned())?;
        checkpoints.insert(key.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        let checkpoints = self.checkpoints.read().map_err(|_| poisoned())?;
        Ok(checkpoints.get(key).cloned())
    }

    fn remove(&self, key: &CheckpointKey) -> Result<(), CheckpointStoreError> {
        let mut checkpoints = self.checkpoints.write().map_err(|_| poisoned())?;
        checkpoints.remove(key);
        Ok(())
    }

    fn remove_instance(&self, instance_id: JobInstanceId) -> Result<(), CheckpointStoreError> {
        let mut checkpoints = self.checkpoints.write().map_err(|_| poisoned())?;
        checkpoints.retain(|k, _| k.instance_id != instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_remove() {
        let store = InMemoryCheckpointStore::new();
        let key = CheckpointKey::new(JobInstanceId::new(), "load");
        assert!(store.load(&key).unwrap().is_none());

        let mut cp = Checkpoint::default();
        cp.chunks_committed = 3;
        store.save(&key, &cp).unwrap();
        assert_eq!(store.load(&key).unwrap().unwrap().chunks_committed, 3);

        store.remove(&key).unwrap();
        assert!(store.load(&key).unwrap().is_none());
    }

    #[test]
    fn remove_instance_is_scoped() {
        let store = InMemoryCheckpointStore::new();
        let a = JobInstanceId::new();
        let b = JobInstanceId::new();
        store.save(&CheckpointKey::new(a, "one"), &Checkpoint::default()).unwrap();
        store.save(&CheckpointKey::new(a, "two"), &Checkpoint::default()).unwrap();
        store.save(&CheckpointKey::new(b, "one"), &Checkpoint::default()).unwrap();

        store.remove_instance(a).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.load(&CheckpointKey::new(b, "one")).unwrap().is_some());
    }
}
