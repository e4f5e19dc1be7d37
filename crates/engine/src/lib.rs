//! Batch execution engine: chunk-oriented steps, checkpoints, retry/skip
//! policies and the job operator.
//!
//! ## Components
//!
//! - `JobOperator`: starts, stops, restarts and abandons job executions
//! - `ChunkStep`: read → process → write loop, one transaction per chunk
//! - `RetrySkipPolicy`: maps item errors to retry, skip or fail
//! - `CheckpointStore`: durable step progress (in-memory or file backed)
//! - `ArtifactRegistry`: named reader/processor/writer/listener factories

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod definitions;
pub mod operator;
pub mod pipeline;
pub mod policy;
pub mod step;

pub use artifacts::ArtifactRegistry;
pub use checkpoint::{
    Checkpoint, CheckpointKey, CheckpointStore, CheckpointStoreError, FileCheckpointStore,
    InMemoryCheckpointStore, PendingChunk,
};
pub use config::OperatorConfig;
pub use definitions::{InMemoryDefinitionSource, JobDefinitionSource, JsonDefinitionSource};
pub use operator::JobOperator;
pub use pipeline::{ChunkPhase, ItemProcessor, ItemReader, ItemWriter, Position, StepContext, StepListener};
pub use policy::{Decision, PolicyCounters, RetrySkipPolicy};
pub use step::{ChunkStep, NoopObserver, StepObserver, StepOutcome, StepReport, StepRun, StepTask, StopSignal};
