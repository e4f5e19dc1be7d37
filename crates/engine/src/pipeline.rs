//! Item reader/processor/writer abstractions.
//!
//! ## Contracts
//!
//! - A reader reports an opaque `position()` after every item; the executor
//!   stores it with each committed chunk and hands it back through `open` on
//!   restart or retry. Reopening at a position must replay exactly the items
//!   read after it.
//! - A writer receives one chunk per `write_items` call and must treat it as a
//!   unit: either everything is written or an error is returned. After an error
//!   the executor calls `rollback`.
//! - Writers must be idempotent per item: a chunk may be written again after a
//!   retry or a replayed pending checkpoint.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde_json::Value as JsonValue;

use batchforge_core::{ItemError, JobExecutionId, JobInstanceId, JobParameters, StepExecutionId};

/// Opaque position stored in checkpoints.
pub type Position = JsonValue;

/// Pipeline phase an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkPhase {
    Read,
    Process,
    Write,
}

impl core::fmt::Display for ChunkPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ChunkPhase::Read => "read",
            ChunkPhase::Process => "process",
            ChunkPhase::Write => "write",
        })
    }
}

pub trait ItemReader<T>: Send {
    /// Position the reader. `None` means from the beginning.
    fn open(&mut self, position: Option<&Position>) -> Result<(), ItemError>;

    /// Next item, or `None` at end of input.
    fn read_item(&mut self) -> Result<Option<T>, ItemError>;

    /// Position after the last item returned by `read_item`.
    fn position(&self) -> Position;

    fn close(&mut self) -> Result<(), ItemError> {
        Ok(())
    }
}

pub trait ItemProcessor<I, O>: Send {
    /// Transform an item. `Ok(None)` filters it out of the chunk.
    fn process_item(&mut self, item: I) -> Result<Option<O>, ItemError>;
}

pub trait ItemWriter<T>: Send {
    fn open(&mut self, _position: Option<&Position>) -> Result<(), ItemError> {
        Ok(())
    }

    fn write_items(&mut self, items: &[T]) -> Result<(), ItemError>;

    /// Discard whatever the failed `write_items` call left behind.
    fn rollback(&mut self) {}

    /// Position to store with the committed chunk, if the writer has one.
    fn position(&self) -> Option<Position> {
        None
    }

    fn close(&mut self) -> Result<(), ItemError> {
        Ok(())
    }
}

/// Hooks invoked before the executor acts on a retry or skip decision.
pub trait StepListener: Send {
    fn on_retry(&mut self, _phase: ChunkPhase, _error: &ItemError) {}

    fn on_skip(&mut self, _phase: ChunkPhase, _error: &ItemError) {}
}

/// Identity processor used when a step names none.
#[derive(Debug)]
pub struct PassThrough<T>(PhantomData<fn(T) -> T>);

impl<T> Default for PassThrough<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send> ItemProcessor<T, T> for PassThrough<T> {
    fn process_item(&mut self, item: T) -> Result<Option<T>, ItemError> {
        Ok(Some(item))
    }
}

/// What artifacts see of the step they run in.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_name: String,
    pub step_name: String,
    pub instance_id: JobInstanceId,
    pub execution_id: JobExecutionId,
    pub step_execution_id: StepExecutionId,
    pub parameters: JobParameters,
    pub properties: BTreeMap<String, String>,
}

impl StepContext {
    /// Job parameter lookup.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key)
    }

    /// Step property lookup, falling back to the job parameter of the same name.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .or_else(|| self.parameters.get(key))
    }

    /// Parse a property, `None` when absent or malformed.
    pub fn property_as<T: core::str::FromStr>(&self, key: &str) -> Option<T> {
        self.property(key).and_then(|v| v.trim().parse().ok())
    }
}
