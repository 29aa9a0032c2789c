//! Delimited (CSV-like) resource parser
//!
//! Column handling per row, in order: pad or truncate to the header length,
//! trim, map `null_values` to null, coerce, attach markers, filter.

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use serde_json::{Number, Value};
use std::io::Cursor;
use tracing::warn;

use crate::error::{ParserError, Result};
use crate::filter::{filter_from_entry, RecordFilter};
use crate::record::{attach_markers, Record};
use crate::registry::{ResourceParserCapability, StrategyFactory, StrategyRegistry};

use super::params::Params;
use super::{ErrorPolicy, ResourceParser, RowError};

const STRATEGY: &str = "csv";

const KNOWN_PARAMS: &[&str] = &[
    "delimiter",
    "quote",
    "quotechar",
    "escape",
    "escapechar",
    "encoding",
    "has_header",
    "headers",
    "include",
    "rename",
    "coerce",
    "null_values",
    "trim_whitespace",
    "skip_rows",
    "limit_rows",
    "on_error",
    "extra_fields_policy",
    "schema_version",
    "filter",
];

/// Values treated as null when `null_values` is not configured
pub const DEFAULT_NULL_VALUES: &[&str] = &["", "NULL", "null"];

/// Target type of a field coercion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coercion {
    Int,
    Float,
    /// `true` for `true`, `1`, `yes`, `on` (case-insensitive), else `false`
    Bool,
    /// Declared date format; the value is kept as text
    Date(String),
    /// `str` or an unrecognised target; the value is kept as text
    Text,
}

impl Coercion {
    fn parse_name(name: &str) -> Self {
        match name {
            "int" => Coercion::Int,
            "float" => Coercion::Float,
            "bool" => Coercion::Bool,
            _ => match name.strip_prefix("date:") {
                Some(format) => Coercion::Date(format.to_string()),
                None => Coercion::Text,
            },
        }
    }

    fn apply(&self, value: &str) -> std::result::Result<Value, String> {
        match self {
            Coercion::Int => {
                let text = value.trim();
                text.parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| text.parse::<u64>().map(Value::from))
                    .map_err(|_| format!("invalid integer: {value:?}"))
            },
            Coercion::Float => value
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("invalid float: {value:?}")),
            Coercion::Bool => Ok(Value::Bool(matches!(
                value.trim().to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ))),
            Coercion::Date(_) | Coercion::Text => Ok(Value::String(value.to_string())),
        }
    }
}

/// Treatment of columns not selected by `include` or `rename`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtraFieldsPolicy {
    #[default]
    Keep,
    Drop,
}

/// Configured delimited parser
#[derive(Debug, Clone)]
pub struct DelimitedParser {
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    has_header: bool,
    headers: Option<Vec<String>>,
    include: Option<Vec<String>>,
    rename: Vec<(String, String)>,
    coerce: Vec<(String, Coercion)>,
    null_values: Vec<String>,
    trim_whitespace: bool,
    skip_rows: u64,
    limit_rows: Option<u64>,
    on_error: ErrorPolicy,
    extra_fields: ExtraFieldsPolicy,
    schema_version: Option<String>,
    filter: Option<RecordFilter>,
}

impl Default for DelimitedParser {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            escape: None,
            has_header: true,
            headers: None,
            include: None,
            rename: Vec::new(),
            coerce: Vec::new(),
            null_values: DEFAULT_NULL_VALUES.iter().map(|v| v.to_string()).collect(),
            trim_whitespace: true,
            skip_rows: 0,
            limit_rows: None,
            on_error: ErrorPolicy::Skip,
            extra_fields: ExtraFieldsPolicy::Keep,
            schema_version: None,
            filter: None,
        }
    }
}

/// A selected source column and how it is written out
#[derive(Debug)]
struct Column {
    index: usize,
    name: String,
    coercion: Option<Coercion>,
}

impl DelimitedParser {
    pub fn error_policy(&self) -> ErrorPolicy {
        self.on_error
    }

    fn reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .delimiter(self.delimiter)
            .quote(self.quote)
            .escape(self.escape)
            .has_headers(false)
            .flexible(true);
        builder
    }

    fn renamed<'a>(&'a self, header: &'a str) -> &'a str {
        self.rename
            .iter()
            .find(|(from, _)| from == header)
            .map_or(header, |(_, to)| to.as_str())
    }

    fn coercion_for(&self, output: &str, source: &str) -> Option<&Coercion> {
        let lookup = |name: &str| {
            self.coerce
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, coercion)| coercion)
        };
        lookup(output).or_else(|| lookup(source))
    }

    /// Select, order and name the output columns for a header row
    fn columns(&self, headers: &[String]) -> Vec<Column> {
        let selected: Vec<usize> = match &self.include {
            Some(include) => include
                .iter()
                .filter_map(|name| {
                    let index = headers.iter().position(|header| header == name);
                    if index.is_none() {
                        warn!(field = %name, "Included field not present in header; ignoring");
                    }
                    index
                })
                .collect(),
            None if self.extra_fields == ExtraFieldsPolicy::Drop && !self.rename.is_empty() => headers
                .iter()
                .enumerate()
                .filter(|(_, header)| self.rename.iter().any(|(from, _)| from == *header))
                .map(|(index, _)| index)
                .collect(),
            None => (0..headers.len()).collect(),
        };

        selected
            .into_iter()
            .map(|index| {
                let source = headers[index].as_str();
                let name = self.renamed(source);
                Column {
                    index,
                    name: name.to_string(),
                    coercion: self.coercion_for(name, source).cloned(),
                }
            })
            .collect()
    }

    fn build_record(
        &self,
        columns: &[Column],
        cells: &StringRecord,
        source_row: u64,
    ) -> std::result::Result<Record, RowError> {
        let mut record = Record::new();
        for column in columns {
            let raw = cells.get(column.index).unwrap_or("");
            let text = if self.trim_whitespace { raw.trim() } else { raw };

            let value = if self.null_values.iter().any(|null| null == text) {
                Value::Null
            } else {
                match column.coercion.as_ref().map(|coercion| coercion.apply(text)) {
                    None => Value::String(text.to_string()),
                    Some(Ok(value)) => value,
                    Some(Err(reason)) => match self.on_error {
                        ErrorPolicy::Skip => Value::String(text.to_string()),
                        ErrorPolicy::Fail => {
                            return Err(RowError {
                                row: source_row,
                                reason: format!("field '{}': {reason}", column.name),
                            });
                        },
                    },
                }
            };
            record.insert(column.name.clone(), value);
        }

        attach_markers(&mut record, self.schema_version.as_deref(), source_row);
        Ok(record)
    }
}

/// Row cursor over one delimited resource
pub(crate) struct DelimitedRows<'a> {
    parser: &'a DelimitedParser,
    records: StringRecordsIntoIter<Cursor<Vec<u8>>>,
    columns: Vec<Column>,
    emitted: u64,
}

impl<'a> DelimitedRows<'a> {
    pub fn new(parser: &'a DelimitedParser, lines: Vec<String>) -> Result<Self> {
        let mut data = String::new();
        for line in &lines {
            data.push_str(line.strip_suffix('\r').unwrap_or(line));
            data.push('\n');
        }
        let mut records = parser.reader_builder().from_reader(Cursor::new(data.into_bytes())).into_records();

        let file_headers = if parser.has_header {
            match records.next() {
                Some(header) => Some(header?.iter().map(str::to_string).collect::<Vec<_>>()),
                None => None,
            }
        } else {
            None
        };

        let mut headers = match (&parser.headers, file_headers) {
            (Some(explicit), _) => explicit.clone(),
            (None, Some(found)) => found,
            (None, None) if parser.has_header => Vec::new(),
            (None, None) => {
                return Err(ParserError::Configuration(
                    "delimited resource has no header row and no explicit headers".to_string(),
                ));
            },
        };
        if let Some(first) = headers.first_mut() {
            if let Some(stripped) = first.strip_prefix('\u{feff}') {
                *first = stripped.to_string();
            }
        }

        for _ in 0..parser.skip_rows {
            if records.next().is_none() {
                break;
            }
        }

        Ok(Self {
            parser,
            records,
            columns: parser.columns(&headers),
            emitted: 0,
        })
    }

    /// Line the reader stopped on; every row ends with a consumed `\n`
    fn end_line(&self) -> u64 {
        self.records.reader().position().line().saturating_sub(1)
    }

    /// First line of a row, counting blank lines and quoted line breaks
    fn start_line(&self, cells: &StringRecord) -> u64 {
        let breaks: usize = cells.iter().map(|field| field.matches('\n').count()).sum();
        self.end_line().saturating_sub(breaks as u64)
    }
}

impl Iterator for DelimitedRows<'_> {
    type Item = std::result::Result<Record, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.parser.limit_rows.is_some_and(|limit| self.emitted >= limit) {
                return None;
            }

            let cells = match self.records.next()? {
                Ok(cells) => cells,
                Err(e) => {
                    return Some(Err(RowError {
                        row: self.end_line(),
                        reason: e.to_string(),
                    }));
                },
            };
            let row = self.start_line(&cells);

            let record = match self.parser.build_record(&self.columns, &cells, row) {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };

            if let Some(filter) = &self.parser.filter {
                if !filter.accepts(&record) {
                    continue;
                }
            }

            self.emitted += 1;
            return Some(Ok(record));
        }
    }
}

/// Builds [`DelimitedParser`]s from `csv` parameters
pub struct DelimitedParserFactory;

impl StrategyFactory<ResourceParserCapability> for DelimitedParserFactory {
    fn create(&self, params: &Value, registry: &StrategyRegistry) -> Result<ResourceParser> {
        let params = Params::new(STRATEGY, params)?;
        params.reject_unknown(KNOWN_PARAMS)?;
        let defaults = DelimitedParser::default();

        let encoding = params.string("encoding")?.unwrap_or("utf-8");
        if !matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8") {
            return Err(params.error("encoding", format!("only utf-8 is supported, got '{encoding}'")));
        }

        let has_header = params.boolean("has_header")?.unwrap_or(defaults.has_header);
        let headers = params.string_list("headers")?;
        if !has_header && headers.is_none() {
            return Err(params.error("headers", "is required when has_header is false"));
        }

        let on_error = match params.string("on_error")? {
            None => defaults.on_error,
            Some(name) => ErrorPolicy::parse_name(name)
                .ok_or_else(|| params.error("on_error", format!("must be 'skip' or 'fail', got '{name}'")))?,
        };

        let extra_fields = match params.string("extra_fields_policy")? {
            None | Some("keep") => ExtraFieldsPolicy::Keep,
            Some("drop") => ExtraFieldsPolicy::Drop,
            Some(other) => {
                return Err(params.error(
                    "extra_fields_policy",
                    format!("must be 'keep' or 'drop', got '{other}'"),
                ));
            },
        };

        let limit_rows = params.count("limit_rows")?;
        if limit_rows == Some(0) {
            return Err(params.error("limit_rows", "must be at least 1"));
        }

        let coerce = params
            .string_map("coerce")?
            .into_iter()
            .map(|(field, target)| (field, Coercion::parse_name(&target)))
            .collect();

        let filter = params
            .get("filter")
            .map(|entry| filter_from_entry(STRATEGY, "filter", entry, registry))
            .transpose()?;

        Ok(ResourceParser::Delimited(DelimitedParser {
            delimiter: params.ascii_char(&["delimiter"])?.unwrap_or(defaults.delimiter),
            quote: params.ascii_char(&["quote", "quotechar"])?.unwrap_or(defaults.quote),
            escape: params.ascii_char(&["escape", "escapechar"])?,
            has_header,
            headers,
            include: params.string_list("include")?,
            rename: params.string_map("rename")?,
            coerce,
            null_values: params.string_list("null_values")?.unwrap_or(defaults.null_values),
            trim_whitespace: params.boolean("trim_whitespace")?.unwrap_or(defaults.trim_whitespace),
            skip_rows: params.count("skip_rows")?.unwrap_or(defaults.skip_rows),
            limit_rows,
            on_error,
            extra_fields,
            schema_version: params.string("schema_version")?.map(str::to_string),
            filter,
        }))
    }
}
