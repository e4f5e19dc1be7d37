use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use batchforge_core::JobInstanceId;

use super::{Checkpoint, CheckpointKey, CheckpointStore, CheckpointStoreError};

/// Directory-backed checkpoint store.
///
/// Layout: `<root>/<instance_id>/<step>.json`. A save writes a temporary file
/// next to the target, syncs it, and renames it over the previous checkpoint,
/// so readers see either the old or the new document, never a torn one.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CheckpointStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| storage(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instance_dir(&self, instance_id: JobInstanceId) -> PathBuf {
        self.root.join(instance_id.to_string())
    }

    fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        self.instance_dir(key.instance_id)
            .join(format!("{}.json", encode_step_name(&key.step_name)))
    }
}

fn storage(path: &Path, err: std::io::Error) -> CheckpointStoreError {
    CheckpointStoreError::Storage(format!("{}: {err}", path.display()))
}

/// Make a step name safe to use as a file name; reversible, so distinct step
/// names never share a file.
fn encode_step_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        let dir = self.instance_dir(key.instance_id);
        fs::create_dir_all(&dir).map_err(|e| storage(&dir, e))?;

        let target = self.path_for(key);
        let tmp = target.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|e| CheckpointStoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let mut file = fs::File::create(&tmp).map_err(|e| storage(&tmp, e))?;
        file.write_all(&bytes).map_err(|e| storage(&tmp, e))?;
        file.sync_all().map_err(|e| storage(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &target).map_err(|e| storage(&target, e))
    }

    fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointStoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn remove(&self, key: &CheckpointKey) -> Result<(), CheckpointStoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage(&path, e)),
        }
    }

    fn remove_instance(&self, instance_id: JobInstanceId) -> Result<(), CheckpointStoreError> {
        let dir = self.instance_dir(instance_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage(&dir, e)),
        }
    }
}
