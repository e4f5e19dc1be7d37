//! Chunk loop with checkpoint, retry and skip handling.

use tracing::{debug, error, info, warn};

use batchforge_core::{BatchError, ItemError, RuleAction, StepMetrics, StepStatus};

use super::{ChunkStep, StepOutcome, StepReport, StepRun};
use crate::checkpoint::Checkpoint;
use crate::pipeline::ChunkPhase;
use crate::policy::PolicyCounters;

/// Mutable state of one step run.
struct Progress {
    /// Last committed state, as persisted
    checkpoint: Checkpoint,
    /// Working counters, ahead of the checkpoint within a chunk
    counters: PolicyCounters,
    /// Totals of earlier executions of this step
    carried: StepMetrics,
    /// This run only
    metrics: StepMetrics,
    status: StepStatus,
}

impl Progress {
    fn load(run: &StepRun<'_>) -> Result<Self, BatchError> {
        let mut checkpoint = run.checkpoints.load(&run.key)?.unwrap_or_default();

        if let Some(pending) = checkpoint.discard_pending() {
            warn!(
                step = %run.key.step_name,
                chunk = pending.sequence,
                items = pending.item_count,
                "unconfirmed chunk found in checkpoint, replaying from last commit"
            );
        }

        if checkpoint
            .execution_id
            .is_some_and(|previous| previous != run.execution_id)
        {
            checkpoint.counters.reset_for_restart(&run.policy);
        }

        Ok(Self {
            counters: checkpoint.counters.clone(),
            carried: checkpoint.metrics,
            checkpoint,
            metrics: StepMetrics::default(),
            status: StepStatus::Ready,
        })
    }

    fn transition(&mut self, run: &StepRun<'_>, next: StepStatus) {
        if self.status == next {
            return;
        }
        if !self.status.can_transition_to(next) {
            warn!(step = %run.key.step_name, from = ?self.status, to = ?next, "unexpected step transition");
        }
        self.status = next;
        run.observer.status_changed(next);
    }

    fn persist(&mut self, run: &StepRun<'_>) -> Result<(), BatchError> {
        self.checkpoint.execution_id = Some(run.execution_id);
        run.checkpoints.save(&run.key, &self.checkpoint)?;
        Ok(())
    }
}

enum ChunkEnd {
    More,
    EndOfInput,
}

enum Resolution {
    Retry,
    Skip,
}

impl<I, O> ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(super) fn run_chunks(&mut self, run: &StepRun<'_>) -> Result<StepReport, BatchError> {
        let mut progress = Progress::load(run)?;
        progress.transition(run, StepStatus::Executing);

        info!(
            step = %run.key.step_name,
            execution_id = %run.execution_id,
            resumed_chunks = progress.checkpoint.chunks_committed,
            chunk_size = run.options.chunk_size,
            "step started"
        );

        if let Err(e) = self.open(&progress.checkpoint) {
            error!(step = %run.key.step_name, error = %e, "failed to open step artifacts");
            progress.transition(run, StepStatus::Failed);
            self.close(run);
            return Err(BatchError::step_failed(run.key.step_name.clone(), e));
        }

        loop {
            if run.stop.is_requested() {
                info!(
                    step = %run.key.step_name,
                    chunks = progress.checkpoint.chunks_committed,
                    "stop observed at chunk boundary"
                );
                progress.transition(run, StepStatus::Stopped);
                self.close(run);
                return Ok(StepReport {
                    outcome: StepOutcome::Stopped,
                    metrics: progress.metrics,
                });
            }

            match self.run_chunk(run, &mut progress) {
                Ok(ChunkEnd::More) => continue,
                Ok(ChunkEnd::EndOfInput) => break,
                Err(e) => {
                    self.writer.rollback();
                    // The lost chunk is read again on restart: keep its retries, not its skips.
                    let mut counters = progress.counters.clone();
                    counters.rewind_skips(&progress.checkpoint.counters, &run.policy);
                    progress.checkpoint.counters = counters;
                    progress.checkpoint.discard_pending();
                    if let Err(save_err) = progress.persist(run) {
                        error!(step = %run.key.step_name, error = %save_err, "failed to persist counters of failed step");
                    }
                    progress.transition(run, StepStatus::Failed);
                    self.close(run);
                    return Err(e);
                }
            }
        }

        progress.checkpoint.completed = true;
        progress.persist(run)?;
        progress.transition(run, StepStatus::Completed);
        self.close(run);

        info!(
            step = %run.key.step_name,
            read = progress.metrics.read_count,
            written = progress.metrics.write_count,
            skipped = progress.metrics.skip_count(),
            retried = progress.metrics.retry_count,
            "step completed"
        );

        Ok(StepReport {
            outcome: StepOutcome::Completed,
            metrics: progress.metrics,
        })
    }

    fn open(&mut self, checkpoint: &Checkpoint) -> Result<(), ItemError> {
        self.reader.open(checkpoint.reader_position.as_ref())?;
        self.writer.open(checkpoint.writer_position.as_ref())
    }

    fn close(&mut self, run: &StepRun<'_>) {
        if let Err(e) = self.reader.close() {
            warn!(step = %run.key.step_name, error = %e, "reader close failed");
        }
        if let Err(e) = self.writer.close() {
            warn!(step = %run.key.step_name, error = %e, "writer close failed");
        }
    }

    /// Read, process and write one chunk. Retries restart the chunk from the
    /// last committed reader position.
    fn run_chunk(&mut self, run: &StepRun<'_>, progress: &mut Progress) -> Result<ChunkEnd, BatchError> {
        let start_metrics = progress.metrics;
        let start_counters = progress.checkpoint.counters.clone();
        let chunk_size = run.options.chunk_size;

        'attempt: loop {
            let mut buffer: Vec<O> = Vec::with_capacity(chunk_size);
            let mut consumed = 0usize;
            let mut end_of_input = false;

            while consumed < chunk_size {
                let item = match self.reader.read_item() {
                    Ok(Some(item)) => item,
                    Ok(None) => {
                        end_of_input = true;
                        break;
                    }
                    Err(e) => match self.resolve(run, progress, ChunkPhase::Read, e)? {
                        Resolution::Skip => {
                            progress.metrics.read_skip_count += 1;
                            continue;
                        }
                        Resolution::Retry => {
                            self.rewind(run, progress, &start_metrics, &start_counters)?;
                            continue 'attempt;
                        }
                    },
                };
                consumed += 1;
                progress.metrics.read_count += 1;

                match self.processor.process_item(item) {
                    Ok(Some(out)) => buffer.push(out),
                    Ok(None) => progress.metrics.filter_count += 1,
                    Err(e) => match self.resolve(run, progress, ChunkPhase::Process, e)? {
                        Resolution::Skip => progress.metrics.process_skip_count += 1,
                        Resolution::Retry => {
                            self.rewind(run, progress, &start_metrics, &start_counters)?;
                            continue 'attempt;
                        }
                    },
                }
            }

            if end_of_input && progress.metrics == start_metrics {
                // Nothing was read since the last commit.
                return Ok(ChunkEnd::EndOfInput);
            }

            progress.transition(run, StepStatus::Committing);
            progress.checkpoint.begin_chunk(buffer.len());
            progress.persist(run)?;

            while !buffer.is_empty() {
                match self.writer.write_items(&buffer) {
                    Ok(()) => break,
                    Err(e) => {
                        self.writer.rollback();
                        let offending = e.item_index.filter(|&idx| idx < buffer.len());
                        let rejected = e.clone();
                        match self.resolve(run, progress, ChunkPhase::Write, e)? {
                            Resolution::Skip => {
                                progress.metrics.rollback_count += 1;
                                match offending {
                                    Some(idx) => {
                                        buffer.remove(idx);
                                        progress.metrics.write_skip_count += 1;
                                    }
                                    None => {
                                        // Every item in the buffer is dropped and counts as a skip.
                                        self.charge_skips(run, progress, &rejected, buffer.len() - 1)?;
                                        progress.metrics.write_skip_count += buffer.len() as u64;
                                        buffer.clear();
                                    }
                                }
                            }
                            Resolution::Retry => {
                                self.rewind(run, progress, &start_metrics, &start_counters)?;
                                progress.transition(run, StepStatus::Executing);
                                continue 'attempt;
                            }
                        }
                    }
                }
            }

            let written = buffer.len();
            progress.metrics.write_count += written as u64;
            progress.metrics.commit_count += 1;
            progress.checkpoint.commit_chunk(
                Some(self.reader.position()),
                self.writer.position(),
                written,
                progress.carried.merged(progress.metrics),
                progress.counters.clone(),
            );
            progress.persist(run)?;
            run.observer.chunk_committed(&progress.metrics, &progress.checkpoint);

            debug!(
                step = %run.key.step_name,
                chunk = progress.checkpoint.chunks_committed,
                items = written,
                "chunk committed"
            );

            progress.transition(run, StepStatus::Executing);
            return Ok(if end_of_input {
                ChunkEnd::EndOfInput
            } else {
                ChunkEnd::More
            });
        }
    }

    /// Consult the policy; `Err` means the step fails with this error.
    fn resolve(
        &mut self,
        run: &StepRun<'_>,
        progress: &mut Progress,
        phase: ChunkPhase,
        error: ItemError,
    ) -> Result<Resolution, BatchError> {
        let decision = run.policy.decide(&error, &progress.counters);
        match decision.action {
            RuleAction::Retry => {
                progress.counters.record(&decision);
                warn!(step = %run.key.step_name, %phase, error = %error, rule = ?decision.rule, "retrying chunk");
                if let Some(listener) = self.listener.as_mut() {
                    listener.on_retry(phase, &error);
                }
                Ok(Resolution::Retry)
            }
            RuleAction::Skip => {
                progress.counters.record(&decision);
                warn!(step = %run.key.step_name, %phase, error = %error, rule = ?decision.rule, "skipping item");
                if let Some(listener) = self.listener.as_mut() {
                    listener.on_skip(phase, &error);
                }
                Ok(Resolution::Skip)
            }
            RuleAction::Fail => {
                error!(
                    step = %run.key.step_name,
                    %phase,
                    error = %error,
                    rule = ?decision.rule,
                    limit_exceeded = decision.limit_exceeded,
                    "step failed"
                );
                Err(BatchError::step_failed(run.key.step_name.clone(), error))
            }
        }
    }

    /// Count `extra` further skips for an error that dropped a whole buffer;
    /// the first item was already counted by `resolve`. Fails the step once a
    /// limit would be exceeded.
    fn charge_skips(
        &mut self,
        run: &StepRun<'_>,
        progress: &mut Progress,
        error: &ItemError,
        extra: usize,
    ) -> Result<(), BatchError> {
        for _ in 0..extra {
            let decision = run.policy.decide(error, &progress.counters);
            if decision.action != RuleAction::Skip {
                error!(
                    step = %run.key.step_name,
                    error = %error,
                    rule = ?decision.rule,
                    "skip limit exceeded while dropping a rejected chunk"
                );
                return Err(BatchError::step_failed(run.key.step_name.clone(), error.clone()));
            }
            progress.counters.record(&decision);
        }
        Ok(())
    }

    /// Roll the chunk back to its start: metrics and skip counters return to
    /// their chunk-start values, the reader goes back to the committed position.
    fn rewind(
        &mut self,
        run: &StepRun<'_>,
        progress: &mut Progress,
        start_metrics: &StepMetrics,
        start_counters: &PolicyCounters,
    ) -> Result<(), BatchError> {
        progress.metrics = StepMetrics {
            retry_count: progress.metrics.retry_count + 1,
            rollback_count: progress.metrics.rollback_count + 1,
            ..*start_metrics
        };
        progress.counters.rewind_skips(start_counters, &run.policy);

        if let Err(e) = self.reader.close() {
            warn!(step = %run.key.step_name, error = %e, "reader close before retry failed");
        }
        self.reader
            .open(progress.checkpoint.reader_position.as_ref())
            .map_err(|e| BatchError::step_failed(run.key.step_name.clone(), e))
    }
}
