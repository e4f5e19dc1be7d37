//! Chunk-level properties: skip limits, retry idempotence and resuming from a
//! durable checkpoint.

mod support;

use std::sync::atomic::{AtomicU64, Ordering};

use batchforge_core::{
    BatchError, ErrorFamily, ErrorPattern, JobExecutionId, JobInstanceId, OccurrenceLimit, RetrySkipRule,
    StepMetrics, StepOptions, StepStatus,
};
use batchforge_engine::{
    Checkpoint, CheckpointKey, CheckpointStore, ChunkStep, FileCheckpointStore, InMemoryCheckpointStore,
    NoopObserver, RetrySkipPolicy, StepObserver, StepOutcome, StepReport, StepRun, StepTask, StopSignal,
};
use proptest::prelude::*;

use support::{KeyedSink, RangeReader, retry_transient};

fn execute(
    step: &mut dyn StepTask,
    checkpoints: &dyn CheckpointStore,
    instance: JobInstanceId,
    options: StepOptions,
    rules: Vec<RetrySkipRule>,
    stop: &StopSignal,
    observer: &dyn StepObserver,
) -> Result<StepReport, BatchError> {
    let run = StepRun {
        key: CheckpointKey::new(instance, "load"),
        execution_id: JobExecutionId::new(),
        policy: RetrySkipPolicy::new(rules, &options),
        options,
        checkpoints,
        stop,
        observer,
    };
    step.execute(&run)
}

fn chunked(chunk_size: usize) -> StepOptions {
    StepOptions {
        chunk_size,
        ..StepOptions::default()
    }
}

/// Requests a stop once `after` chunks were committed.
struct StopAfter<'a> {
    stop: &'a StopSignal,
    after: u64,
    commits: AtomicU64,
}

impl StepObserver for StopAfter<'_> {
    fn status_changed(&self, _status: StepStatus) {}

    fn chunk_committed(&self, _metrics: &StepMetrics, _checkpoint: &Checkpoint) {
        if self.commits.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.stop.request();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn skip_limit_is_inclusive(failures in 0u64..8, limit in 0u32..8, chunk_size in 1usize..6) {
        let sink = KeyedSink::default();
        let bad: Vec<u64> = (0..failures).map(|i| i * 3 + 1).collect();
        let mut step = ChunkStep::pass_through(
            Box::new(RangeReader::new(30).failing_at(bad.clone())),
            Box::new(sink.writer()),
        );
        let options = StepOptions { skip_limit: Some(limit), ..chunked(chunk_size) };
        let rules = vec![RetrySkipRule::skip(ErrorPattern::Family(ErrorFamily::Data), OccurrenceLimit::Unlimited)];
        let store = InMemoryCheckpointStore::new();

        let result = execute(&mut step, &store, JobInstanceId::new(), options, rules, &StopSignal::new(), &NoopObserver);

        if failures <= limit as u64 {
            let report = result.unwrap();
            prop_assert_eq!(report.outcome, StepOutcome::Completed);
            prop_assert_eq!(report.metrics.read_skip_count, failures);
            let expected: Vec<u64> = (0..30).filter(|i| !bad.contains(i)).collect();
            prop_assert_eq!(sink.keys(), expected);
        } else {
            let is_step_failure = matches!(result, Err(BatchError::StepExecutionFailed { .. }));
            prop_assert!(is_step_failure);
        }
    }

    #[test]
    fn retried_chunks_write_the_same_data(len in 1u64..40, chunk_size in 1usize..8, fail_call in 1u64..6) {
        let clean = KeyedSink::default();
        let mut step = ChunkStep::pass_through(Box::new(RangeReader::new(len)), Box::new(clean.writer()));
        let store = InMemoryCheckpointStore::new();
        execute(&mut step, &store, JobInstanceId::new(), chunked(chunk_size), vec![], &StopSignal::new(), &NoopObserver)
            .unwrap();

        let flaky = KeyedSink::default();
        let mut step = ChunkStep::pass_through(
            Box::new(RangeReader::new(len)),
            Box::new(flaky.writer().failing_calls(vec![fail_call])),
        );
        let store = InMemoryCheckpointStore::new();
        let report = execute(
            &mut step,
            &store,
            JobInstanceId::new(),
            chunked(chunk_size),
            vec![retry_transient(1)],
            &StopSignal::new(),
            &NoopObserver,
        )
        .unwrap();

        prop_assert_eq!(flaky.keys(), clean.keys());
        let chunks = clean.write_calls();
        if fail_call <= chunks {
            // Exactly one extra attempt for the failed chunk.
            prop_assert_eq!(flaky.write_calls(), chunks + 1);
            prop_assert_eq!(report.metrics.retry_count, 1);
            prop_assert_eq!(flaky.rollbacks(), 1);
        } else {
            prop_assert_eq!(flaky.write_calls(), chunks);
            prop_assert_eq!(report.metrics.retry_count, 0);
        }
        prop_assert_eq!(report.metrics.write_count, len);
    }
}

#[test]
fn file_checkpoint_resumes_in_a_new_store() {
    let dir = tempfile::tempdir().unwrap();
    let instance = JobInstanceId::new();
    let sink = KeyedSink::default();

    let stop = StopSignal::new();
    let observer = StopAfter {
        stop: &stop,
        after: 2,
        commits: AtomicU64::new(0),
    };
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    let mut step = ChunkStep::pass_through(Box::new(RangeReader::new(23)), Box::new(sink.writer()));
    let report = execute(&mut step, &store, instance, chunked(4), vec![], &stop, &observer).unwrap();
    assert_eq!(report.outcome, StepOutcome::Stopped);
    assert_eq!(sink.keys(), (0..8).collect::<Vec<_>>());

    let reopened = FileCheckpointStore::new(dir.path()).unwrap();
    let checkpoint = reopened.load(&CheckpointKey::new(instance, "load")).unwrap().unwrap();
    assert_eq!(checkpoint.chunks_committed, 2);
    assert_eq!(checkpoint.metrics.write_count, 8);
    assert!(!checkpoint.completed);

    let writes_before = sink.write_calls();
    let mut step = ChunkStep::pass_through(Box::new(RangeReader::new(23)), Box::new(sink.writer()));
    let report = execute(&mut step, &reopened, instance, chunked(4), vec![], &StopSignal::new(), &NoopObserver)
        .unwrap();
    assert_eq!(report.outcome, StepOutcome::Completed);
    assert_eq!(report.metrics.read_count, 15);
    assert_eq!(sink.write_calls() - writes_before, 4);
    assert_eq!(sink.keys(), (0..23).collect::<Vec<_>>());

    let checkpoint = reopened.load(&CheckpointKey::new(instance, "load")).unwrap().unwrap();
    assert!(checkpoint.completed);
    assert_eq!(checkpoint.metrics.read_count, 23);
    assert_eq!(checkpoint.metrics.write_count, 23);
    assert_eq!(checkpoint.metrics.commit_count, 6);
}

#[test]
fn write_skip_drops_only_the_offending_item() {
    use batchforge_core::{ErrorKind, ItemError};
    use batchforge_engine::ItemWriter;

    /// Rejects odd numbers, pointing at the first one in the chunk.
    struct RejectOdd(support::KeyedWriter);

    impl ItemWriter<u64> for RejectOdd {
        fn write_items(&mut self, items: &[u64]) -> Result<(), ItemError> {
            if let Some(idx) = items.iter().position(|i| i % 2 == 1) {
                return Err(ItemError::new(ErrorKind::Constraint, "odd").at_item(idx));
            }
            self.0.write_items(items)
        }
    }

    let sink = KeyedSink::default();
    let mut step = ChunkStep::pass_through(
        Box::new(RangeReader::new(10)),
        Box::new(RejectOdd(sink.writer())),
    );
    let rules = vec![RetrySkipRule::skip(
        ErrorPattern::Kind(ErrorKind::Constraint),
        OccurrenceLimit::AtMost(5),
    )];
    let store = InMemoryCheckpointStore::new();
    let report = execute(&mut step, &store, JobInstanceId::new(), chunked(4), rules, &StopSignal::new(), &NoopObserver)
        .unwrap();

    assert_eq!(sink.keys(), vec![0, 2, 4, 6, 8]);
    assert_eq!(report.metrics.write_skip_count, 5);
    assert_eq!(report.metrics.write_count, 5);
}
