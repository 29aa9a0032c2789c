//! Resource parser strategies
//!
//! A [`ResourceParser`] is a configured, immutable strategy. Every call to
//! [`ResourceParser::parse`] or [`ResourceParser::parse_stream`] builds its
//! own row cursor, so one configured parser can convert any number of
//! resources, sequentially or from several workers at once.
//!
//! # Progress reporting
//!
//! `parse_stream` yields the cumulative record count after every
//! [`PROGRESS_BATCH_SIZE`] records and once more at the end, unless the
//! final count was just reported. An empty resource yields a single `0`.

pub mod delimited;
pub mod fixed_width;
pub(crate) mod params;

use futures::{stream, Stream, StreamExt};
use std::io::{self, Write};
use std::path::Path;
use std::pin::Pin;
use tracing::debug;

use crate::emitter::JsonlEmitter;
use crate::error::{ParserError, Result};
use crate::record::Record;

use self::delimited::{DelimitedParser, DelimitedRows};
use self::fixed_width::{FixedWidthParser, FixedWidthRows};

/// Records between two progress reports
pub const PROGRESS_BATCH_SIZE: u64 = 1_000;

/// What to do with a row that cannot be converted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Drop the row and keep going
    #[default]
    Skip,
    /// Abort the conversion with the row's error
    Fail,
}

impl ErrorPolicy {
    pub(crate) fn parse_name(name: &str) -> Option<Self> {
        match name {
            "skip" => Some(ErrorPolicy::Skip),
            "fail" => Some(ErrorPolicy::Fail),
            _ => None,
        }
    }
}

/// A row that could not be converted
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowError {
    pub row: u64,
    pub reason: String,
}

/// A configured resource parsing strategy
#[derive(Debug, Clone)]
pub enum ResourceParser {
    Delimited(DelimitedParser),
    FixedWidth(FixedWidthParser),
}

impl ResourceParser {
    /// Registry name of the strategy
    pub fn strategy_name(&self) -> &'static str {
        match self {
            ResourceParser::Delimited(_) => "csv",
            ResourceParser::FixedWidth(_) => "fixed_width",
        }
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        match self {
            ResourceParser::Delimited(parser) => parser.error_policy(),
            ResourceParser::FixedWidth(parser) => parser.error_policy(),
        }
    }

    fn rows(&self, lines: Vec<String>) -> Result<RowCursor<'_>> {
        Ok(match self {
            ResourceParser::Delimited(parser) => RowCursor::Delimited(DelimitedRows::new(parser, lines)?),
            ResourceParser::FixedWidth(parser) => RowCursor::FixedWidth(FixedWidthRows::new(parser, lines)),
        })
    }

    /// Convert a local file, writing JSONL to `sink`
    ///
    /// Returns the number of records written.
    pub fn parse<W: Write>(&self, resource: impl AsRef<Path>, sink: W) -> Result<u64> {
        let bytes = std::fs::read(resource.as_ref())?;
        let text = String::from_utf8_lossy(&bytes);
        let mut emitter = JsonlEmitter::new(sink);
        self.parse_text(&text, &mut emitter)?;
        emitter.flush()?;
        Ok(emitter.records_written())
    }

    /// Convert in-memory text; lines are split on `\n`
    pub fn parse_text<W: Write>(&self, text: &str, emitter: &mut JsonlEmitter<W>) -> Result<u64> {
        let lines = text.split_terminator('\n').map(str::to_string).collect();
        let mut conversion = Conversion::new(self.rows(lines)?, self.error_policy(), emitter);
        conversion.advance(false)?;
        Ok(conversion.written)
    }

    /// Convert a stream of decoded lines, yielding progress counts
    ///
    /// Records are written to `emitter` as they are produced. The stream ends
    /// after the first error.
    pub fn parse_stream<'a, S, W>(
        &'a self,
        lines: S,
        emitter: &'a mut JsonlEmitter<W>,
    ) -> impl Stream<Item = Result<u64>> + 'a
    where
        S: Stream<Item = io::Result<String>> + 'a,
        W: Write + 'a,
    {
        let initial = StreamState::Pending {
            lines: Box::pin(lines),
            emitter,
        };

        stream::unfold(initial, move |state| async move {
            match state {
                StreamState::Pending { mut lines, emitter } => {
                    let mut collected = Vec::new();
                    while let Some(line) = lines.next().await {
                        match line {
                            Ok(line) => collected.push(line),
                            Err(e) => return Some((Err(ParserError::Io(e)), StreamState::Finished)),
                        }
                    }
                    match self.rows(collected) {
                        Ok(rows) => Conversion::new(rows, self.error_policy(), emitter).step(),
                        Err(e) => Some((Err(e), StreamState::Finished)),
                    }
                },
                StreamState::Converting(conversion) => conversion.step(),
                StreamState::Finished => None,
            }
        })
    }
}

/// Per-call row source
pub(crate) enum RowCursor<'a> {
    Delimited(DelimitedRows<'a>),
    FixedWidth(FixedWidthRows<'a>),
}

impl Iterator for RowCursor<'_> {
    type Item = std::result::Result<Record, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RowCursor::Delimited(rows) => rows.next(),
            RowCursor::FixedWidth(rows) => rows.next(),
        }
    }
}

enum StreamState<'a, S, W: Write> {
    Pending {
        lines: Pin<Box<S>>,
        emitter: &'a mut JsonlEmitter<W>,
    },
    Converting(Conversion<'a, W>),
    Finished,
}

/// Drives a row cursor into an emitter, applying the error policy
struct Conversion<'a, W: Write> {
    rows: RowCursor<'a>,
    policy: ErrorPolicy,
    emitter: &'a mut JsonlEmitter<W>,
    written: u64,
    last_reported: Option<u64>,
}

impl<'a, W: Write> Conversion<'a, W> {
    fn new(rows: RowCursor<'a>, policy: ErrorPolicy, emitter: &'a mut JsonlEmitter<W>) -> Self {
        Self {
            rows,
            policy,
            emitter,
            written: 0,
            last_reported: None,
        }
    }

    /// Emit rows until a batch boundary (when `report` is set) or the end
    ///
    /// Returns `Some(count)` at a batch boundary and `None` once exhausted.
    fn advance(&mut self, report: bool) -> Result<Option<u64>> {
        for outcome in self.rows.by_ref() {
            match outcome {
                Ok(record) => {
                    self.emitter.write_record(&record)?;
                    self.written += 1;
                    if report && self.written % PROGRESS_BATCH_SIZE == 0 {
                        return Ok(Some(self.written));
                    }
                },
                Err(RowError { row, reason }) => match self.policy {
                    ErrorPolicy::Fail => return Err(ParserError::Record { row, reason }),
                    ErrorPolicy::Skip => debug!(row, %reason, "Skipping row"),
                },
            }
        }
        Ok(None)
    }

    fn step<S>(mut self) -> Option<(Result<u64>, StreamState<'a, S, W>)> {
        match self.advance(true) {
            Ok(Some(count)) => {
                self.last_reported = Some(count);
                Some((Ok(count), StreamState::Converting(self)))
            },
            Ok(None) if self.last_reported == Some(self.written) => None,
            Ok(None) => Some((Ok(self.written), StreamState::Finished)),
            Err(e) => Some((Err(e), StreamState::Finished)),
        }
    }
}
