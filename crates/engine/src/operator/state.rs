//! Execution table shared between the operator and its workers.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use batchforge_core::{BatchError, JobExecution, JobExecutionId, JobInstance, JobInstanceId};

use crate::step::StopSignal;

pub(crate) struct ExecutionEntry {
    pub execution: JobExecution,
    pub stop: StopSignal,
    pub worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct ExecutionTable {
    pub instances: HashMap<JobInstanceId, JobInstance>,
    pub executions: HashMap<JobExecutionId, ExecutionEntry>,
}

impl ExecutionTable {
    pub fn entry(&self, id: JobExecutionId) -> Result<&ExecutionEntry, BatchError> {
        self.executions.get(&id).ok_or(BatchError::NoSuchJobExecution(id))
    }

    pub fn entry_mut(&mut self, id: JobExecutionId) -> Result<&mut ExecutionEntry, BatchError> {
        self.executions.get_mut(&id).ok_or(BatchError::NoSuchJobExecution(id))
    }

    pub fn instance_of(&self, id: JobExecutionId) -> Result<&JobInstance, BatchError> {
        let instance_id = self.entry(id)?.execution.instance_id;
        self.instances
            .get(&instance_id)
            .ok_or(BatchError::NoSuchJobExecution(id))
    }

    /// Insert a new execution and link it to its instance.
    pub fn insert(&mut self, execution: JobExecution, stop: StopSignal) {
        if let Some(instance) = self.instances.get_mut(&execution.instance_id) {
            instance.executions.push(execution.id);
        }
        self.executions.insert(
            execution.id,
            ExecutionEntry {
                execution,
                stop,
                worker: None,
            },
        );
    }
}

/// Table plus the condition variable waiters block on.
#[derive(Default)]
pub(crate) struct Shared {
    table: Mutex<ExecutionTable>,
    changed: Condvar,
}

impl Shared {
    pub fn lock(&self) -> Result<MutexGuard<'_, ExecutionTable>, BatchError> {
        self.table
            .lock()
            .map_err(|_| BatchError::Worker("execution table lock poisoned".to_string()))
    }

    /// Mutate one execution and wake every waiter.
    pub fn update<R>(
        &self,
        id: JobExecutionId,
        f: impl FnOnce(&mut JobExecution) -> R,
    ) -> Result<R, BatchError> {
        let mut table = self.lock()?;
        let out = f(&mut table.entry_mut(id)?.execution);
        drop(table);
        self.changed.notify_all();
        Ok(out)
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Block until `done` holds for the execution or `timeout` elapses.
    /// Returns the last observed snapshot either way.
    pub fn wait_until(
        &self,
        id: JobExecutionId,
        timeout: Duration,
        done: impl Fn(&JobExecution) -> bool,
    ) -> Result<JobExecution, BatchError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.lock()?;
        loop {
            let execution = &table.entry(id)?.execution;
            if done(execution) {
                return Ok(execution.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(execution.clone());
            }
            let (guard, _) = self
                .changed
                .wait_timeout(table, deadline - now)
                .map_err(|_| BatchError::Worker("execution table lock poisoned".to_string()))?;
            table = guard;
        }
    }
}
