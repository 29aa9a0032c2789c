//! JSONL record emitter

use serde_jsonlines::JsonLinesWriter;
use std::io::Write;

use crate::error::Result;
use crate::record::Record;

/// Writes records as newline-terminated JSON objects and counts them
pub struct JsonlEmitter<W: Write> {
    writer: JsonLinesWriter<W>,
    records_written: u64,
}

impl<W: Write> JsonlEmitter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: JsonLinesWriter::new(sink),
            records_written: 0,
        }
    }

    /// Serialize one record as a single JSON line
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.writer.write(record)?;
        self.records_written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and hand back the underlying sink
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer.into_inner())
    }
}
