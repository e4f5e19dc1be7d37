//! Step checkpoint persistence.
//!
//! A checkpoint records how far a step got: reader/writer positions as of the
//! last committed chunk, the retry/skip counters, the step's metric totals, and
//! whether the step finished.
//! Checkpoints are keyed by `(instance, step)` so a restarted execution of the
//! same instance resumes where the previous one stopped.
//!
//! ## Write-ahead ordering
//!
//! The step executor saves the checkpoint with a `pending` marker *before*
//! handing a chunk to the writer, and saves it again with the marker cleared
//! (and the new positions) once the write succeeded. A checkpoint that is
//! loaded with a marker still set describes a chunk whose write may or may not
//! have landed; the step resumes from the committed positions and replays it,
//! which is why writers must be idempotent per item.

pub mod file;
pub mod in_memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use batchforge_core::{BatchError, JobExecutionId, JobInstanceId, StepMetrics};

use crate::policy::PolicyCounters;

pub use file::FileCheckpointStore;
pub use in_memory::InMemoryCheckpointStore;

/// Checkpoint key: one per step of a job instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub instance_id: JobInstanceId,
    pub step_name: String,
}

impl CheckpointKey {
    pub fn new(instance_id: JobInstanceId, step_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
        }
    }
}

impl core::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.step_name)
    }
}

/// Chunk announced to the store but not yet confirmed as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChunk {
    /// 1-based sequence number of the chunk within the step
    pub sequence: u64,
    pub item_count: usize,
    pub started_at: DateTime<Utc>,
}

/// Durable step progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Reader position after the last committed chunk (opaque to the engine)
    pub reader_position: Option<JsonValue>,
    /// Writer position after the last committed chunk (opaque to the engine)
    pub writer_position: Option<JsonValue>,
    pub chunks_committed: u64,
    pub items_written: u64,
    /// Metrics summed over every execution of the step, as of the last commit
    #[serde(default)]
    pub metrics: StepMetrics,
    pub counters: PolicyCounters,
    pub pending: Option<PendingChunk>,
    pub completed: bool,
    /// Execution that saved this checkpoint last
    pub execution_id: Option<JobExecutionId>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            reader_position: None,
            writer_position: None,
            chunks_committed: 0,
            items_written: 0,
            metrics: StepMetrics::default(),
            counters: PolicyCounters::default(),
            pending: None,
            completed: false,
            execution_id: None,
            updated_at: Utc::now(),
        }
    }
}

impl Checkpoint {
    /// Announce the next chunk (write-ahead record).
    pub fn begin_chunk(&mut self, item_count: usize) {
        self.pending = Some(PendingChunk {
            sequence: self.chunks_committed + 1,
            item_count,
            started_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Record a written chunk and the positions after it.
    pub fn commit_chunk(
        &mut self,
        reader_position: Option<JsonValue>,
        writer_position: Option<JsonValue>,
        items: usize,
        metrics: StepMetrics,
        counters: PolicyCounters,
    ) {
        self.reader_position = reader_position;
        self.writer_position = writer_position;
        self.chunks_committed += 1;
        self.items_written += items as u64;
        self.metrics = metrics;
        self.counters = counters;
        self.pending = None;
        self.updated_at = Utc::now();
    }

    /// Drop an unconfirmed chunk marker; the chunk will be replayed from the
    /// committed positions. Returns the dropped marker.
    pub fn discard_pending(&mut self) -> Option<PendingChunk> {
        self.pending.take()
    }
}

/// Checkpoint store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt checkpoint {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<CheckpointStoreError> for BatchError {
    fn from(value: CheckpointStoreError) -> Self {
        BatchError::Checkpoint(value.to_string())
    }
}

/// Checkpoint store abstraction.
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint` under `key`, replacing any previous one atomically.
    fn save(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError>;

    /// Load the checkpoint for `key`, if one was saved.
    fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointStoreError>;

    /// Forget the checkpoint for `key`.
    fn remove(&self, key: &CheckpointKey) -> Result<(), CheckpointStoreError>;

    /// Forget every checkpoint of an instance.
    fn remove_instance(&self, instance_id: JobInstanceId) -> Result<(), CheckpointStoreError>;
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    fn save(&self, key: &CheckpointKey, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        (**self).save(key, checkpoint)
    }

    fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        (**self).load(key)
    }

    fn remove(&self, key: &CheckpointKey) -> Result<(), CheckpointStoreError> {
        (**self).remove(key)
    }

    fn remove_instance(&self, instance_id: JobInstanceId) -> Result<(), CheckpointStoreError> {
        (**self).remove_instance(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_clears_pending_marker() {
        let mut cp = Checkpoint::default();
        cp.begin_chunk(5);
        assert_eq!(cp.pending.as_ref().map(|p| p.sequence), Some(1));

        let metrics = StepMetrics {
            read_count: 5,
            write_count: 5,
            commit_count: 1,
            ..Default::default()
        };
        cp.commit_chunk(Some(serde_json::json!(5)), None, 5, metrics, PolicyCounters::default());
        assert!(cp.pending.is_none());
        assert_eq!(cp.chunks_committed, 1);
        assert_eq!(cp.items_written, 5);
        assert_eq!(cp.reader_position, Some(serde_json::json!(5)));
        assert_eq!(cp.metrics, metrics);
    }

    #[test]
    fn discarding_pending_keeps_committed_positions() {
        let mut cp = Checkpoint::default();
        cp.commit_chunk(Some(serde_json::json!(10)), None, 10, StepMetrics::default(), PolicyCounters::default());
        cp.begin_chunk(10);

        let dropped = cp.discard_pending().unwrap();
        assert_eq!(dropped.sequence, 2);
        assert_eq!(cp.reader_position, Some(serde_json::json!(10)));
        assert_eq!(cp.chunks_committed, 1);
    }
}
