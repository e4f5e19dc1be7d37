//! Instance and execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::JobParameters;
use crate::error::BatchError;
use crate::id::{JobExecutionId, JobInstanceId, StepExecutionId};
use crate::status::{BatchStatus, StepStatus};

/// One logical run of a job. Owns every execution started for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    /// Fixed when the first execution is created.
    pub restartable: bool,
    pub created_at: DateTime<Utc>,
    /// Executions in creation order.
    pub executions: Vec<JobExecutionId>,
}

impl JobInstance {
    pub fn new(job_name: impl Into<String>, restartable: bool) -> Self {
        Self {
            id: JobInstanceId::new(),
            job_name: job_name.into(),
            restartable,
            created_at: Utc::now(),
            executions: Vec::new(),
        }
    }

    pub fn latest_execution(&self) -> Option<JobExecutionId> {
        self.executions.last().copied()
    }
}

/// One start or restart attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub instance_id: JobInstanceId,
    pub job_name: String,
    pub status: BatchStatus,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Cause attached when the execution failed.
    pub failure: Option<String>,
    pub exit_status: Option<String>,
    /// Step runs in execution order.
    pub steps: Vec<StepExecution>,
}

impl JobExecution {
    pub fn new(instance: &JobInstance, parameters: JobParameters) -> Self {
        let now = Utc::now();
        Self {
            id: JobExecutionId::new(),
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            status: BatchStatus::Starting,
            parameters,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
            failure: None,
            exit_status: None,
            steps: Vec::new(),
        }
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow.
    pub fn transition(&mut self, next: BatchStatus) -> Result<(), BatchError> {
        if !self.status.can_transition_to(next) {
            return Err(BatchError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            BatchStatus::Started => self.started_at = Some(now),
            BatchStatus::Stopped | BatchStatus::Completed | BatchStatus::Failed => {
                self.ended_at = Some(now);
                self.exit_status = Some(next.as_str().to_string());
            }
            BatchStatus::Abandoned => self.exit_status = Some(next.as_str().to_string()),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, cause: impl Into<String>) -> Result<(), BatchError> {
        self.transition(BatchStatus::Failed)?;
        self.failure = Some(cause.into());
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().rev().find(|s| s.step_name == name)
    }

    pub fn step_mut(&mut self, id: StepExecutionId) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.id == id)
    }
}

/// Counters for one step run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub retry_count: u64,
}

impl StepMetrics {
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Field-wise sum, used to carry step totals across executions.
    pub fn merged(self, other: StepMetrics) -> StepMetrics {
        StepMetrics {
            read_count: self.read_count + other.read_count,
            write_count: self.write_count + other.write_count,
            filter_count: self.filter_count + other.filter_count,
            commit_count: self.commit_count + other.commit_count,
            rollback_count: self.rollback_count + other.rollback_count,
            read_skip_count: self.read_skip_count + other.read_skip_count,
            process_skip_count: self.process_skip_count + other.process_skip_count,
            write_skip_count: self.write_skip_count + other.write_skip_count,
            retry_count: self.retry_count + other.retry_count,
        }
    }
}

/// One run of a step inside a job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub status: StepStatus,
    pub metrics: StepMetrics,
    /// Chunks committed as of the last persisted checkpoint.
    pub checkpoint_chunks: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl StepExecution {
    pub fn new(job_execution_id: JobExecutionId, step_name: impl Into<String>) -> Self {
        Self {
            id: StepExecutionId::new(),
            job_execution_id,
            step_name: step_name.into(),
            status: StepStatus::Ready,
            metrics: StepMetrics::default(),
            checkpoint_chunks: 0,
            started_at: Utc::now(),
            ended_at: None,
            failure: None,
        }
    }
}
