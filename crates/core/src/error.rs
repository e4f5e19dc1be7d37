//! Error taxonomy for operator calls and job definitions.

use thiserror::Error;

use crate::failure::ItemError;
use crate::id::{JobExecutionId, JobInstanceId};
use crate::status::BatchStatus;

/// Result type used across the engine.
pub type BatchResult<T> = Result<T, BatchError>;

/// Operator-level error.
///
/// Validation failures (`NoSuchJob`, `NoSuchJobExecution`,
/// `JobRestartDisallowed`, `JobExecutionAlreadyComplete`, ...) are returned
/// synchronously from operator calls. `StepExecutionFailed` describes a job that
/// ran and failed; the operator records it on the execution instead of
/// returning it from `start`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BatchError {
    /// No job definition is known under this name.
    #[error("no such job: {0}")]
    NoSuchJob(String),

    /// The execution id is unknown, or the execution is already terminal.
    #[error("no such job execution: {0}")]
    NoSuchJobExecution(JobExecutionId),

    /// Restart requested for an execution that completed.
    #[error("job execution {0} already completed")]
    JobExecutionAlreadyComplete(JobExecutionId),

    /// The owning instance was not restartable.
    #[error("job instance {instance_id} is not restartable (execution {execution_id})")]
    JobRestartDisallowed {
        instance_id: JobInstanceId,
        execution_id: JobExecutionId,
    },

    /// Restart requested for an execution in a state that cannot be resumed.
    #[error("cannot restart execution {execution_id}: {reason}")]
    InvalidRestart {
        execution_id: JobExecutionId,
        reason: String,
    },

    /// The execution still has a live worker.
    #[error("job execution {0} is still running")]
    JobExecutionIsRunning(JobExecutionId),

    /// A status transition broke the execution lifecycle.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: BatchStatus, to: BatchStatus },

    /// A step failed and the retry/skip policy did not resolve it.
    #[error("step '{step}' failed: {cause}")]
    StepExecutionFailed { step: String, cause: ItemError },

    /// Job parameters carried a malformed value for a recognized key.
    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),

    /// Checkpoint persistence failed.
    #[error("checkpoint store: {0}")]
    Checkpoint(String),

    /// A worker thread could not be spawned or panicked.
    #[error("worker: {0}")]
    Worker(String),
}

impl BatchError {
    pub fn step_failed(step: impl Into<String>, cause: ItemError) -> Self {
        Self::StepExecutionFailed {
            step: step.into(),
            cause,
        }
    }

    pub fn invalid_restart(execution_id: JobExecutionId, reason: impl Into<String>) -> Self {
        Self::InvalidRestart {
            execution_id,
            reason: reason.into(),
        }
    }
}

/// A job or step definition is malformed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// A recognized option carried a value that does not parse.
    #[error("option '{key}' has invalid value '{value}'")]
    InvalidOption { key: String, value: String },

    /// Two steps share a name.
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    /// A job without steps.
    #[error("job '{0}' declares no steps")]
    NoSteps(String),

    /// A step references an artifact nobody registered.
    #[error("unknown artifact '{0}'")]
    UnknownArtifact(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The definition document could not be read or decoded.
    #[error("unreadable definition '{name}': {reason}")]
    Unreadable { name: String, reason: String },
}

impl DefinitionError {
    pub fn invalid_option(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.into(),
            value: value.into(),
        }
    }
}
