//! Artifacts available to job definitions run from the command line.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use tracing::info;

use batchforge_core::{ErrorKind, ItemError};
use batchforge_engine::{ArtifactRegistry, ItemProcessor, ItemReader, ItemWriter, Position, StepContext};

pub fn registry() -> ArtifactRegistry {
    let mut registry = ArtifactRegistry::new();
    registry
        .register_reader::<u64, _>("rangeReader", |ctx| Box::new(RangeReader::from_context(ctx)))
        .register_reader::<String, _>("lineReader", |ctx| Box::new(LineReader::from_context(ctx)))
        .register_processor::<u64, u64, _>("squareProcessor", |_| Box::new(Square))
        .register_processor::<String, u64, _>("lineLengthProcessor", |ctx| {
            Box::new(LineLength {
                max: ctx.property_as("line.max.length"),
            })
        })
        .register_writer::<u64, _>("logWriter", |ctx| {
            Box::new(LogWriter {
                step: ctx.step_name.clone(),
                written: 0,
            })
        });
    registry
}

/// Numbers from `range.start` (default 0) up to `range.end` (exclusive).
struct RangeReader {
    start: u64,
    end: u64,
    next: u64,
}

impl RangeReader {
    fn from_context(ctx: &StepContext) -> Self {
        let start = ctx.property_as("range.start").unwrap_or(0);
        Self {
            start,
            end: ctx.property_as("range.end").unwrap_or(start),
            next: start,
        }
    }
}

impl ItemReader<u64> for RangeReader {
    fn open(&mut self, position: Option<&Position>) -> Result<(), ItemError> {
        self.next = match position {
            None => self.start,
            Some(p) => p
                .as_u64()
                .ok_or_else(|| ItemError::new(ErrorKind::Parse, format!("bad range position {p}")))?,
        };
        Ok(())
    }

    fn read_item(&mut self) -> Result<Option<u64>, ItemError> {
        if self.next >= self.end {
            return Ok(None);
        }
        self.next += 1;
        Ok(Some(self.next - 1))
    }

    fn position(&self) -> Position {
        serde_json::json!(self.next)
    }
}

/// Lines of the file at `input.path`; the position is the line number.
struct LineReader {
    path: Option<PathBuf>,
    lines: Option<Lines<BufReader<File>>>,
    line: u64,
}

impl LineReader {
    fn from_context(ctx: &StepContext) -> Self {
        Self {
            path: ctx.property("input.path").map(PathBuf::from),
            lines: None,
            line: 0,
        }
    }
}

impl ItemReader<String> for LineReader {
    fn open(&mut self, position: Option<&Position>) -> Result<(), ItemError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ItemError::new(ErrorKind::Validation, "input.path is not set"))?;
        let file = File::open(path)
            .map_err(|e| ItemError::new(ErrorKind::Io, format!("{}: {e}", path.display())))?;
        let mut lines = BufReader::new(file).lines();

        let skip = position.and_then(|p| p.as_u64()).unwrap_or(0);
        for _ in 0..skip {
            if lines.next().is_none() {
                break;
            }
        }
        self.line = skip;
        self.lines = Some(lines);
        Ok(())
    }

    fn read_item(&mut self) -> Result<Option<String>, ItemError> {
        let Some(lines) = self.lines.as_mut() else {
            return Err(ItemError::other("reader is not open"));
        };
        match lines.next() {
            None => Ok(None),
            Some(line) => {
                self.line += 1;
                line.map(Some)
                    .map_err(|e| ItemError::new(ErrorKind::Io, format!("line {}: {e}", self.line)))
            }
        }
    }

    fn position(&self) -> Position {
        serde_json::json!(self.line)
    }

    fn close(&mut self) -> Result<(), ItemError> {
        self.lines = None;
        Ok(())
    }
}

struct Square;

impl ItemProcessor<u64, u64> for Square {
    fn process_item(&mut self, item: u64) -> Result<Option<u64>, ItemError> {
        item.checked_mul(item)
            .map(Some)
            .ok_or_else(|| ItemError::new(ErrorKind::Validation, format!("{item} squared overflows")))
    }
}

/// Length of each non-blank line; blank lines are filtered, lines longer than
/// `line.max.length` are rejected.
struct LineLength {
    max: Option<u64>,
}

impl ItemProcessor<String, u64> for LineLength {
    fn process_item(&mut self, item: String) -> Result<Option<u64>, ItemError> {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let len = trimmed.chars().count() as u64;
        match self.max {
            Some(max) if len > max => Err(ItemError::new(
                ErrorKind::Validation,
                format!("line of {len} characters exceeds {max}"),
            )),
            _ => Ok(Some(len)),
        }
    }
}

/// Logs each chunk. Repeating a chunk only repeats the log line.
struct LogWriter {
    step: String,
    written: u64,
}

impl ItemWriter<u64> for LogWriter {
    fn write_items(&mut self, items: &[u64]) -> Result<(), ItemError> {
        self.written += items.len() as u64;
        info!(
            step = %self.step,
            items = items.len(),
            first = items.first().copied(),
            last = items.last().copied(),
            total = self.written,
            "chunk written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn line_reader_resumes_at_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alpha\nbeta\ngamma").unwrap();

        let mut reader = LineReader {
            path: Some(file.path().to_path_buf()),
            lines: None,
            line: 0,
        };
        reader.open(Some(&serde_json::json!(1))).unwrap();
        assert_eq!(reader.read_item().unwrap().as_deref(), Some("beta"));
        assert_eq!(reader.position(), serde_json::json!(2));
        assert_eq!(reader.read_item().unwrap().as_deref(), Some("gamma"));
        assert_eq!(reader.read_item().unwrap(), None);
    }

    #[test]
    fn line_length_filters_blank_and_rejects_long_lines() {
        let mut p = LineLength { max: Some(3) };
        assert_eq!(p.process_item("  ".into()).unwrap(), None);
        assert_eq!(p.process_item("abc".into()).unwrap(), Some(3));
        assert_eq!(p.process_item("abcd".into()).unwrap_err().kind, ErrorKind::Validation);
    }

    #[test]
    fn square_overflow_is_a_data_error() {
        assert_eq!(Square.process_item(u64::MAX).unwrap_err().kind, ErrorKind::Validation);
        assert_eq!(Square.process_item(12).unwrap(), Some(144));
    }
}
