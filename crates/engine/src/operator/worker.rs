//! Worker thread body: runs the steps of one job execution.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use batchforge_core::{
    BatchError, BatchStatus, JobDefinition, JobExecutionId, JobInstanceId, JobParameters, StepExecution,
    StepExecutionId, StepMetrics, StepStatus,
};

use super::state::Shared;
use crate::artifacts::ArtifactRegistry;
use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
use crate::pipeline::StepContext;
use crate::policy::RetrySkipPolicy;
use crate::step::{StepObserver, StepOutcome, StepRun, StopSignal};

pub(crate) struct JobWorker {
    pub shared: Arc<Shared>,
    pub artifacts: Arc<ArtifactRegistry>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub definition: JobDefinition,
    pub instance_id: JobInstanceId,
    pub execution_id: JobExecutionId,
    pub parameters: JobParameters,
    pub stop: StopSignal,
}

enum JobOutcome {
    Completed,
    Stopped,
}

impl JobWorker {
    pub fn run(self) {
        let started = self.shared.update(self.execution_id, |exec| {
            // A stop that arrived while STARTING ends the execution before any step.
            if exec.status == BatchStatus::Stopping {
                exec.transition(BatchStatus::Stopped).map(|_| false)
            } else {
                exec.transition(BatchStatus::Started).map(|_| true)
            }
        });
        match started {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                info!(job = %self.definition.id, execution_id = %self.execution_id, "job execution stopped before start");
                return;
            }
            Ok(Err(e)) | Err(e) => {
                error!(execution_id = %self.execution_id, error = %e, "could not start job execution");
                return;
            }
        }

        info!(
            job = %self.definition.id,
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            steps = self.definition.steps.len(),
            "job execution started"
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_steps()))
            .unwrap_or_else(|payload| Err(BatchError::Worker(panic_message(payload.as_ref()))));

        let finished = self.shared.update(self.execution_id, |exec| -> Result<(), BatchError> {
            match &result {
                Ok(JobOutcome::Completed) => exec.transition(BatchStatus::Completed),
                Ok(JobOutcome::Stopped) => {
                    if exec.status == BatchStatus::Started {
                        exec.transition(BatchStatus::Stopping)?;
                    }
                    exec.transition(BatchStatus::Stopped)
                }
                Err(e) => exec.mark_failed(e.to_string()),
            }
        });

        match (&result, finished) {
            (_, Ok(Err(e))) | (_, Err(e)) => {
                error!(execution_id = %self.execution_id, error = %e, "could not record job outcome");
            }
            (Ok(JobOutcome::Completed), Ok(Ok(()))) => {
                info!(job = %self.definition.id, execution_id = %self.execution_id, "job execution completed");
            }
            (Ok(JobOutcome::Stopped), Ok(Ok(()))) => {
                info!(job = %self.definition.id, execution_id = %self.execution_id, "job execution stopped");
            }
            (Err(e), Ok(Ok(()))) => {
                error!(job = %self.definition.id, execution_id = %self.execution_id, error = %e, "job execution failed");
            }
        }
    }

    fn run_steps(&self) -> Result<JobOutcome, BatchError> {
        for step in &self.definition.steps {
            if self.stop.is_requested() {
                return Ok(JobOutcome::Stopped);
            }

            let options = step.options()?;
            let key = CheckpointKey::new(self.instance_id, step.name.clone());
            if self.checkpoints.load(&key)?.is_some_and(|cp| cp.completed) {
                if options.allow_start_if_complete {
                    debug!(step = %step.name, "re-running completed step");
                    self.checkpoints.remove(&key)?;
                } else {
                    info!(step = %step.name, execution_id = %self.execution_id, "step already completed, skipping");
                    continue;
                }
            }

            let step_execution = StepExecution::new(self.execution_id, step.name.clone());
            let step_execution_id = step_execution.id;
            self.shared.update(self.execution_id, |exec| exec.steps.push(step_execution))?;

            let ctx = StepContext {
                job_name: self.definition.id.clone(),
                step_name: step.name.clone(),
                instance_id: self.instance_id,
                execution_id: self.execution_id,
                step_execution_id,
                parameters: self.parameters.clone(),
                properties: step.properties.clone(),
            };
            let observer = TableObserver {
                shared: &self.shared,
                execution_id: self.execution_id,
                step_execution_id,
            };

            let result = self
                .artifacts
                .build_step(step, &ctx)
                .map_err(BatchError::from)
                .and_then(|mut task| {
                    let run = StepRun {
                        key,
                        execution_id: self.execution_id,
                        options,
                        policy: RetrySkipPolicy::new(step.rules.clone(), &options),
                        checkpoints: self.checkpoints.as_ref(),
                        stop: &self.stop,
                        observer: &observer,
                    };
                    task.execute(&run)
                });

            observer.finish(&result);
            match result?.outcome {
                StepOutcome::Completed => {}
                StepOutcome::Stopped => return Ok(JobOutcome::Stopped),
            }
        }
        Ok(JobOutcome::Completed)
    }
}

/// Mirrors step progress into the execution table.
struct TableObserver<'a> {
    shared: &'a Shared,
    execution_id: JobExecutionId,
    step_execution_id: StepExecutionId,
}

impl TableObserver<'_> {
    fn with_step(&self, f: impl FnOnce(&mut StepExecution)) {
        let step_id = self.step_execution_id;
        let updated = self.shared.update(self.execution_id, |exec| {
            exec.updated_at = Utc::now();
            exec.step_mut(step_id).map(f)
        });
        if !matches!(updated, Ok(Some(()))) {
            warn!(step_execution_id = %step_id, "step execution missing from table");
        }
    }

    fn finish(&self, result: &Result<crate::step::StepReport, BatchError>) {
        self.with_step(|step| {
            step.ended_at = Some(Utc::now());
            match result {
                Ok(report) => step.metrics = report.metrics,
                Err(e) => {
                    step.status = StepStatus::Failed;
                    step.failure = Some(e.to_string());
                }
            }
        });
    }
}

impl StepObserver for TableObserver<'_> {
    fn status_changed(&self, status: StepStatus) {
        self.with_step(|step| step.status = status);
    }

    fn chunk_committed(&self, metrics: &StepMetrics, checkpoint: &Checkpoint) {
        let metrics = *metrics;
        let chunks = checkpoint.chunks_committed;
        self.with_step(|step| {
            step.metrics = metrics;
            step.checkpoint_chunks = chunks;
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {detail}")
}
