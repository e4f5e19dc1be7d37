//! Job operator: owns instances and executions, starts workers, and enforces
//! the start/stop/restart/abandon rules.
//!
//! ## Model
//!
//! - `start` creates a [`JobInstance`] and its first [`JobExecution`] and hands
//!   the execution to a dedicated worker thread.
//! - `stop` is cooperative: the execution moves to `STOPPING` and the worker
//!   finalizes to `STOPPED` at the next chunk or step boundary.
//! - `restart` creates a new execution of the same instance; steps resume from
//!   their checkpoints.
//!
//! Validation errors are returned synchronously. Failures inside a running job
//! are recorded on the execution and observed by polling or waiting.

mod state;
mod worker;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use batchforge_core::{
    BatchError, BatchResult, BatchStatus, JobDefinition, JobExecution, JobExecutionId, JobInstance,
    JobInstanceId, JobOptions, JobParameters, StepExecution,
};

use crate::artifacts::ArtifactRegistry;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::config::OperatorConfig;
use crate::definitions::JobDefinitionSource;
use crate::step::StopSignal;
use state::Shared;
use worker::JobWorker;

/// Entry point for running batch jobs.
pub struct JobOperator {
    shared: Arc<Shared>,
    definitions: Arc<dyn JobDefinitionSource>,
    artifacts: Arc<ArtifactRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: OperatorConfig,
}

impl core::fmt::Debug for JobOperator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobOperator")
            .field("artifacts", &self.artifacts)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobOperator {
    pub fn new(
        definitions: impl JobDefinitionSource + 'static,
        artifacts: ArtifactRegistry,
        checkpoints: impl CheckpointStore + 'static,
        config: OperatorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            definitions: Arc::new(definitions),
            artifacts: Arc::new(artifacts),
            checkpoints: Arc::new(checkpoints),
            config,
        }
    }

    /// Operator whose checkpoint store follows `config.checkpoint_dir`.
    pub fn from_config(
        definitions: impl JobDefinitionSource + 'static,
        artifacts: ArtifactRegistry,
        config: OperatorConfig,
    ) -> BatchResult<Self> {
        Ok(match &config.checkpoint_dir {
            Some(dir) => {
                let store = FileCheckpointStore::new(dir)?;
                Self::new(definitions, artifacts, store, config)
            }
            None => Self::new(definitions, artifacts, InMemoryCheckpointStore::new(), config),
        })
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    fn definition(&self, job_name: &str) -> BatchResult<JobDefinition> {
        let definition = self
            .definitions
            .load(job_name)?
            .ok_or_else(|| BatchError::NoSuchJob(job_name.to_string()))?;
        definition.validate()?;
        for step in &definition.steps {
            self.artifacts.check(step)?;
        }
        Ok(definition)
    }

    /// Start a new instance of `job_name`.
    ///
    /// Returns the execution as created (`STARTING`); the worker moves it on.
    pub fn start(&self, job_name: &str, parameters: JobParameters) -> BatchResult<JobExecution> {
        let definition = self.definition(job_name)?;
        let parameters = definition.resolve_parameters(&parameters)?;
        let options = JobOptions::resolve(&definition, &parameters)?;

        let instance = JobInstance::new(job_name, options.restartable);
        let execution = JobExecution::new(&instance, parameters);
        info!(
            job = %job_name,
            instance_id = %instance.id,
            execution_id = %execution.id,
            restartable = options.restartable,
            "starting job"
        );

        {
            let mut table = self.shared.lock()?;
            table.instances.insert(instance.id, instance);
            table.insert(execution.clone(), StopSignal::new());
        }
        self.launch(definition, &execution)?;
        Ok(execution)
    }

    /// Restart the latest execution of a stopped or failed instance.
    pub fn restart(&self, execution_id: JobExecutionId) -> BatchResult<JobExecution> {
        self.restart_with(execution_id, JobParameters::new())
    }

    /// As [`restart`](Self::restart), overlaying `overrides` on the previous
    /// execution's parameters.
    pub fn restart_with(&self, execution_id: JobExecutionId, overrides: JobParameters) -> BatchResult<JobExecution> {
        let (instance_id, job_name, parameters) = {
            let table = self.shared.lock()?;
            let previous = &table.entry(execution_id)?.execution;
            let instance = table.instance_of(execution_id)?;
            // Restartability is decided first and hides every other problem.
            if !instance.restartable {
                return Err(BatchError::JobRestartDisallowed {
                    instance_id: instance.id,
                    execution_id,
                });
            }
            check_restartable_status(previous)?;
            if instance.latest_execution() != Some(execution_id) {
                return Err(BatchError::invalid_restart(
                    execution_id,
                    "not the most recent execution of its instance",
                ));
            }
            (
                instance.id,
                instance.job_name.clone(),
                previous.parameters.merged(&overrides),
            )
        };

        let definition = self.definition(&job_name)?;
        let parameters = definition.resolve_parameters(&parameters)?;
        JobOptions::resolve(&definition, &parameters)?;

        let execution = {
            let mut table = self.shared.lock()?;
            // Re-check under the lock: a concurrent restart may have won.
            let instance = table
                .instances
                .get(&instance_id)
                .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
            if instance.latest_execution() != Some(execution_id) {
                return Err(BatchError::invalid_restart(
                    execution_id,
                    "not the most recent execution of its instance",
                ));
            }
            let execution = JobExecution::new(instance, parameters);
            table.insert(execution.clone(), StopSignal::new());
            execution
        };

        info!(
            job = %job_name,
            instance_id = %instance_id,
            previous_execution_id = %execution_id,
            execution_id = %execution.id,
            "restarting job"
        );
        self.launch(definition, &execution)?;
        Ok(execution)
    }

    fn launch(&self, definition: JobDefinition, execution: &JobExecution) -> BatchResult<()> {
        let stop = self.shared.lock()?.entry(execution.id)?.stop.clone();
        let worker = JobWorker {
            shared: self.shared.clone(),
            artifacts: self.artifacts.clone(),
            checkpoints: self.checkpoints.clone(),
            definition,
            instance_id: execution.instance_id,
            execution_id: execution.id,
            parameters: execution.parameters.clone(),
            stop,
        };

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.config.worker_prefix, execution.id))
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                self.shared.lock()?.entry_mut(execution.id)?.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let cause = format!("failed to spawn worker: {e}");
                self.shared.update(execution.id, |exec| exec.mark_failed(cause.clone()))??;
                Err(BatchError::Worker(cause))
            }
        }
    }

    /// Request a cooperative stop.
    pub fn stop(&self, execution_id: JobExecutionId) -> BatchResult<()> {
        let mut table = self.shared.lock()?;
        let entry = table.entry_mut(execution_id)?;
        match entry.execution.status {
            BatchStatus::Starting | BatchStatus::Started => {
                entry.execution.transition(BatchStatus::Stopping)?;
                entry.stop.request();
                info!(execution_id = %execution_id, "stop requested");
            }
            BatchStatus::Stopping | BatchStatus::Stopped => {}
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Abandoned => {
                return Err(BatchError::NoSuchJobExecution(execution_id));
            }
        }
        drop(table);
        self.shared.notify();
        Ok(())
    }

    /// Stop and wait for the worker to acknowledge. On timeout the current
    /// status is returned.
    pub fn stop_and_wait(&self, execution_id: JobExecutionId, timeout: Duration) -> BatchResult<BatchStatus> {
        self.stop(execution_id)?;
        self.wait_for_status(
            execution_id,
            &[BatchStatus::Stopped, BatchStatus::Completed, BatchStatus::Failed],
            timeout,
        )
    }

    /// Block until the execution reaches one of `targets` or `timeout` elapses,
    /// returning the last observed status.
    pub fn wait_for_status(
        &self,
        execution_id: JobExecutionId,
        targets: &[BatchStatus],
        timeout: Duration,
    ) -> BatchResult<BatchStatus> {
        let execution = self
            .shared
            .wait_until(execution_id, timeout, |exec| targets.contains(&exec.status))?;
        Ok(execution.status)
    }

    /// Block until the execution leaves the active statuses.
    pub fn wait_until_finished(&self, execution_id: JobExecutionId, timeout: Duration) -> BatchResult<JobExecution> {
        self.shared
            .wait_until(execution_id, timeout, |exec| !exec.status.is_active())
    }

    /// Mark a stopped or failed execution as never to be restarted.
    pub fn abandon(&self, execution_id: JobExecutionId) -> BatchResult<JobExecution> {
        let mut table = self.shared.lock()?;
        let execution = &mut table.entry_mut(execution_id)?.execution;
        if execution.status.is_active() {
            return Err(BatchError::JobExecutionIsRunning(execution_id));
        }
        execution.transition(BatchStatus::Abandoned)?;
        let snapshot = execution.clone();
        drop(table);
        self.shared.notify();
        info!(execution_id = %execution_id, "job execution abandoned");
        Ok(snapshot)
    }

    pub fn get_job_execution(&self, execution_id: JobExecutionId) -> BatchResult<JobExecution> {
        Ok(self.shared.lock()?.entry(execution_id)?.execution.clone())
    }

    /// Ids of executions of `job_name` that are starting, started or stopping.
    pub fn get_running_executions(&self, job_name: &str) -> BatchResult<Vec<JobExecutionId>> {
        let table = self.shared.lock()?;
        let known = table.instances.values().any(|i| i.job_name == job_name);
        if !known && self.definitions.load(job_name)?.is_none() {
            return Err(BatchError::NoSuchJob(job_name.to_string()));
        }
        let mut running: Vec<&JobExecution> = table
            .executions
            .values()
            .map(|e| &e.execution)
            .filter(|e| e.job_name == job_name && e.status.is_active())
            .collect();
        running.sort_by_key(|e| e.created_at);
        Ok(running.into_iter().map(|e| e.id).collect())
    }

    pub fn get_job_instance(&self, execution_id: JobExecutionId) -> BatchResult<JobInstance> {
        Ok(self.shared.lock()?.instance_of(execution_id)?.clone())
    }

    /// Executions of an instance in creation order.
    pub fn get_job_executions(&self, instance_id: JobInstanceId) -> BatchResult<Vec<JobExecution>> {
        let table = self.shared.lock()?;
        let Some(instance) = table.instances.get(&instance_id) else {
            return Ok(Vec::new());
        };
        instance
            .executions
            .iter()
            .map(|id| table.entry(*id).map(|e| e.execution.clone()))
            .collect()
    }

    pub fn get_step_executions(&self, execution_id: JobExecutionId) -> BatchResult<Vec<StepExecution>> {
        Ok(self.shared.lock()?.entry(execution_id)?.execution.steps.clone())
    }

    pub fn get_parameters(&self, execution_id: JobExecutionId) -> BatchResult<JobParameters> {
        Ok(self.shared.lock()?.entry(execution_id)?.execution.parameters.clone())
    }

    pub fn job_names(&self) -> Vec<String> {
        self.definitions.job_names()
    }

    /// Stop every active execution and join the workers. Workers that do not
    /// finish within `timeout` are left detached.
    pub fn shutdown(&self, timeout: Duration) -> BatchResult<()> {
        let active: Vec<JobExecutionId> = {
            let table = self.shared.lock()?;
            table
                .executions
                .values()
                .filter(|e| e.execution.status.is_active())
                .map(|e| e.execution.id)
                .collect()
        };
        for id in &active {
            if let Err(e) = self.stop(*id) {
                warn!(execution_id = %id, error = %e, "stop during shutdown failed");
            }
        }

        let deadline = Instant::now() + timeout;
        let mut detached = 0usize;
        for id in &active {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let execution = self.wait_until_finished(*id, remaining)?;
            if execution.status.is_active() {
                detached += 1;
                continue;
            }
            let handle = self.shared.lock()?.entry_mut(*id)?.worker.take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(execution_id = %id, "worker thread panicked");
                }
            }
        }

        info!(stopped = active.len() - detached, detached, "operator shut down");
        Ok(())
    }
}

fn check_restartable_status(previous: &JobExecution) -> BatchResult<()> {
    match previous.status {
        BatchStatus::Stopped | BatchStatus::Failed => Ok(()),
        BatchStatus::Completed => Err(BatchError::JobExecutionAlreadyComplete(previous.id)),
        BatchStatus::Abandoned => Err(BatchError::invalid_restart(previous.id, "execution was abandoned")),
        BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping => Err(
            BatchError::invalid_restart(previous.id, format!("execution is still {}", previous.status)),
        ),
    }
}
