//! `batchforge-core`: batch model building blocks.
//!
//! This crate contains the **pure** job model (no threads, no IO): identifiers,
//! status machines, definitions, execution records and the error taxonomy.

pub mod definition;
pub mod error;
pub mod execution;
pub mod failure;
pub mod id;
pub mod status;

pub use definition::{
    CounterScope, JobDefinition, JobOptions, JobParameters, OccurrenceLimit, ParameterSpec,
    RetrySkipRule, RuleAction, StepArtifacts, StepDefinition, StepOptions,
};
pub use error::{BatchError, BatchResult, DefinitionError};
pub use execution::{JobExecution, JobInstance, StepExecution, StepMetrics};
pub use failure::{ErrorFamily, ErrorKind, ErrorPattern, ItemError};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId};
pub use status::{BatchStatus, StepStatus};
