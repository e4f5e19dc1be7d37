use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use batchforge_core::{ItemError, JobExecutionId, JobInstanceId, StepOptions};
use batchforge_engine::{
    CheckpointKey, ChunkStep, InMemoryCheckpointStore, ItemProcessor, ItemReader, ItemWriter, NoopObserver,
    Position, RetrySkipPolicy, StepRun, StepTask, StopSignal,
};

const ITEMS: u64 = 10_000;

struct Counter {
    next: u64,
}

impl ItemReader<u64> for Counter {
    fn open(&mut self, position: Option<&Position>) -> Result<(), ItemError> {
        self.next = position.and_then(|p| p.as_u64()).unwrap_or(0);
        Ok(())
    }

    fn read_item(&mut self) -> Result<Option<u64>, ItemError> {
        if self.next >= ITEMS {
            return Ok(None);
        }
        self.next += 1;
        Ok(Some(self.next - 1))
    }

    fn position(&self) -> Position {
        serde_json::json!(self.next)
    }
}

struct Square;

impl ItemProcessor<u64, u64> for Square {
    fn process_item(&mut self, item: u64) -> Result<Option<u64>, ItemError> {
        Ok(Some(item * item))
    }
}

/// Sums what it is given so the work is not optimized away.
struct Sum(u64);

impl ItemWriter<u64> for Sum {
    fn write_items(&mut self, items: &[u64]) -> Result<(), ItemError> {
        self.0 = self.0.wrapping_add(items.iter().sum::<u64>());
        Ok(())
    }
}

fn run_once(chunk_size: usize) {
    let options = StepOptions {
        chunk_size,
        ..StepOptions::default()
    };
    let store = InMemoryCheckpointStore::new();
    let stop = StopSignal::new();
    let run = StepRun {
        key: CheckpointKey::new(JobInstanceId::new(), "bench"),
        execution_id: JobExecutionId::new(),
        policy: RetrySkipPolicy::new(Vec::new(), &options),
        options,
        checkpoints: &store,
        stop: &stop,
        observer: &NoopObserver,
    };
    let mut step = ChunkStep::new(Box::new(Counter { next: 0 }), Box::new(Square), Box::new(Sum(0)));
    black_box(step.execute(&run).ok());
}

fn bench_chunk_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_throughput");
    group.throughput(Throughput::Elements(ITEMS));

    // Every chunk costs two checkpoint saves, so small chunks pay for them.
    for chunk_size in [1usize, 10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &chunk_size, |b, &size| {
            b.iter(|| run_once(size));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chunk_sizes);
criterion_main!(benches);
