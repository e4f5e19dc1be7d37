//! Step execution.
//!
//! A step is anything implementing [`StepTask`]; the engine's only kind is the
//! chunk-oriented [`ChunkStep`], whose loop lives in `executor`.

mod executor;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use batchforge_core::{BatchError, JobExecutionId, StepMetrics, StepOptions, StepStatus};

use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
use crate::pipeline::{ItemProcessor, ItemReader, ItemWriter, PassThrough, StepListener};
use crate::policy::RetrySkipPolicy;

/// Cooperative stop flag shared between the operator and a worker.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives progress of a running step.
pub trait StepObserver {
    fn status_changed(&self, status: StepStatus);

    fn chunk_committed(&self, metrics: &StepMetrics, checkpoint: &Checkpoint);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StepObserver for NoopObserver {
    fn status_changed(&self, _status: StepStatus) {}

    fn chunk_committed(&self, _metrics: &StepMetrics, _checkpoint: &Checkpoint) {}
}

/// Everything a step needs from its surroundings for one run.
pub struct StepRun<'a> {
    pub key: CheckpointKey,
    pub execution_id: JobExecutionId,
    pub options: StepOptions,
    pub policy: RetrySkipPolicy,
    pub checkpoints: &'a dyn CheckpointStore,
    pub stop: &'a StopSignal,
    pub observer: &'a dyn StepObserver,
}

/// How a step run ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Stop was observed at a chunk boundary
    Stopped,
}

/// Final state of a step run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub outcome: StepOutcome,
    pub metrics: StepMetrics,
}

pub trait StepTask: Send {
    /// Run the step to completion, to a stop, or to a failure
    /// (`BatchError::StepExecutionFailed` or `BatchError::Checkpoint`).
    fn execute(&mut self, run: &StepRun<'_>) -> Result<StepReport, BatchError>;
}

/// Chunk-oriented step: read → process → buffer, write per chunk.
pub struct ChunkStep<I, O> {
    reader: Box<dyn ItemReader<I>>,
    processor: Box<dyn ItemProcessor<I, O>>,
    writer: Box<dyn ItemWriter<O>>,
    listener: Option<Box<dyn StepListener>>,
}

impl<I, O> ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        reader: Box<dyn ItemReader<I>>,
        processor: Box<dyn ItemProcessor<I, O>>,
        writer: Box<dyn ItemWriter<O>>,
    ) -> Self {
        Self {
            reader,
            processor,
            writer,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn StepListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl<T: Send + 'static> ChunkStep<T, T> {
    /// Step without a processor.
    pub fn pass_through(reader: Box<dyn ItemReader<T>>, writer: Box<dyn ItemWriter<T>>) -> Self {
        Self::new(reader, Box::new(PassThrough::default()), writer)
    }
}

impl<I, O> StepTask for ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn execute(&mut self, run: &StepRun<'_>) -> Result<StepReport, BatchError> {
        self.run_chunks(run)
    }
}
