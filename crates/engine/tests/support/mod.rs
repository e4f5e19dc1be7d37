//! Artifacts and fixtures shared by the engine's scenario tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use batchforge_core::{
    ErrorFamily, ErrorKind, ErrorPattern, ItemError, JobDefinition, OccurrenceLimit, RetrySkipRule,
    StepDefinition,
};
use batchforge_engine::{
    ArtifactRegistry, InMemoryCheckpointStore, InMemoryDefinitionSource, ItemReader, ItemWriter,
    JobOperator, OperatorConfig, Position, StepContext,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Reads `start..end`, sleeping `delay` before each item. Bad records listed
/// in `fail_at` fail once with a parse error.
pub struct RangeReader {
    pub start: u64,
    pub end: u64,
    pub next: u64,
    pub delay: Duration,
    pub fail_at: Vec<u64>,
}

impl RangeReader {
    pub fn new(end: u64) -> Self {
        Self {
            start: 0,
            end,
            next: 0,
            delay: Duration::ZERO,
            fail_at: Vec::new(),
        }
    }

    pub fn failing_at(mut self, fail_at: Vec<u64>) -> Self {
        self.fail_at = fail_at;
        self
    }

    fn from_context(ctx: &StepContext) -> Self {
        let start = ctx.property_as("range.start").unwrap_or(0);
        Self {
            start,
            end: ctx.property_as("range.end").unwrap_or(20),
            next: start,
            delay: Duration::from_millis(ctx.property_as("read.delay.ms").unwrap_or(0)),
            fail_at: Vec::new(),
        }
    }
}

impl ItemReader<u64> for RangeReader {
    fn open(&mut self, position: Option<&Position>) -> Result<(), ItemError> {
        self.next = position.and_then(|p| p.as_u64()).unwrap_or(self.start);
        Ok(())
    }

    fn read_item(&mut self) -> Result<Option<u64>, ItemError> {
        if self.next >= self.end {
            return Ok(None);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let item = self.next;
        self.next += 1;
        if let Some(idx) = self.fail_at.iter().position(|&f| f == item) {
            self.fail_at.remove(idx);
            return Err(ItemError::new(ErrorKind::Parse, format!("bad record {item}")));
        }
        Ok(Some(item))
    }

    fn position(&self) -> Position {
        serde_json::json!(self.next)
    }
}

/// Idempotent sink: items are stored by key, every write call is counted.
#[derive(Debug, Clone, Default)]
pub struct KeyedSink {
    items: Arc<Mutex<BTreeMap<u64, u64>>>,
    /// How many committed writes carried each key
    landings: Arc<Mutex<BTreeMap<u64, u32>>>,
    writes: Arc<Mutex<u64>>,
    rollbacks: Arc<Mutex<u64>>,
}

impl KeyedSink {
    pub fn keys(&self) -> Vec<u64> {
        self.items.lock().unwrap().keys().copied().collect()
    }

    pub fn times_written(&self, key: u64) -> u32 {
        self.landings.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    pub fn write_calls(&self) -> u64 {
        *self.writes.lock().unwrap()
    }

    pub fn rollbacks(&self) -> u64 {
        *self.rollbacks.lock().unwrap()
    }

    pub fn writer(&self) -> KeyedWriter {
        KeyedWriter {
            sink: self.clone(),
            failures_left: 0,
            fail_chunks: Vec::new(),
            chunk: 0,
            staged: Vec::new(),
        }
    }
}

/// Writer into a [`KeyedSink`]. Items are staged first and only land in the
/// sink when the whole call succeeds.
pub struct KeyedWriter {
    sink: KeyedSink,
    /// Number of write calls still to fail with a timeout
    failures_left: u32,
    /// 1-based write calls that fail once
    fail_chunks: Vec<u64>,
    chunk: u64,
    staged: Vec<u64>,
}

impl KeyedWriter {
    pub fn failing(mut self, count: u32) -> Self {
        self.failures_left = count;
        self
    }

    pub fn failing_calls(mut self, calls: Vec<u64>) -> Self {
        self.fail_chunks = calls;
        self
    }
}

impl ItemWriter<u64> for KeyedWriter {
    fn write_items(&mut self, items: &[u64]) -> Result<(), ItemError> {
        *self.sink.writes.lock().unwrap() += 1;
        self.chunk += 1;
        self.staged.extend_from_slice(items);

        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(ItemError::new(ErrorKind::Timeout, "forced write failure"));
        }
        if let Some(idx) = self.fail_chunks.iter().position(|&c| c == self.chunk) {
            self.fail_chunks.remove(idx);
            return Err(ItemError::new(ErrorKind::Timeout, "forced write failure"));
        }

        let mut items = self.sink.items.lock().unwrap();
        let mut landings = self.sink.landings.lock().unwrap();
        for item in self.staged.drain(..) {
            items.insert(item, item * item);
            *landings.entry(item).or_default() += 1;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged.clear();
        *self.sink.rollbacks.lock().unwrap() += 1;
    }
}

pub fn retry_transient(limit: u32) -> RetrySkipRule {
    RetrySkipRule::retry(ErrorPattern::Family(ErrorFamily::Transient), OccurrenceLimit::AtMost(limit))
}

pub fn registry(sink: &KeyedSink) -> ArtifactRegistry {
    let mut registry = ArtifactRegistry::new();
    let keyed = sink.clone();
    let forced = sink.clone();
    registry
        .register_reader::<u64, _>("rangeReader", |ctx| Box::new(RangeReader::from_context(ctx)))
        .register_writer::<u64, _>("keyedWriter", move |_| Box::new(keyed.writer()))
        .register_writer::<u64, _>("forcedFailureWriter", move |ctx| {
            Box::new(forced.writer().failing(ctx.property_as("forced.fail.count.write").unwrap_or(0)))
        });
    registry
}

/// Jobs known to the test operator:
///
/// - `numbers`: one step writing `0..range.end` in chunks of 5
/// - `retryWriter`: same, through a writer that fails
///   `forced.fail.count.write` times, with one retry allowed per run
/// - `twoSteps`: `extract` writes keys `1000..1010`, then a slow `load` writes
///   `0..200`
/// - `twoStepsRerun`: same, with `extract` re-run on every restart
pub fn definitions() -> InMemoryDefinitionSource {
    let source = InMemoryDefinitionSource::new();
    source
        .register(
            JobDefinition::new("numbers")
                .step(StepDefinition::new("load", "rangeReader", "keyedWriter").chunk_size(5)),
        )
        .unwrap();
    source
        .register(
            JobDefinition::new("retryWriter").step(
                StepDefinition::new("load", "rangeReader", "forcedFailureWriter")
                    .chunk_size(5)
                    .rule(retry_transient(1).reset_on_restart()),
            ),
        )
        .unwrap();
    source.register(two_steps("twoSteps", false)).unwrap();
    source.register(two_steps("twoStepsRerun", true)).unwrap();
    source
}

fn two_steps(name: &str, rerun_extract: bool) -> JobDefinition {
    let mut extract = StepDefinition::new("extract", "rangeReader", "keyedWriter")
        .chunk_size(5)
        .property("range.start", "1000")
        .property("range.end", "1010");
    if rerun_extract {
        extract = extract.property("allow-start-if-complete", "true");
    }
    let load = StepDefinition::new("load", "rangeReader", "keyedWriter")
        .chunk_size(5)
        .property("range.end", "200")
        .property("read.delay.ms", "5");
    JobDefinition::new(name).step(extract).step(load)
}

pub fn operator(sink: &KeyedSink) -> JobOperator {
    JobOperator::new(
        definitions(),
        registry(sink),
        InMemoryCheckpointStore::new(),
        OperatorConfig::default().with_worker_prefix("test-worker"),
    )
}
