//! Fixed-width resource parser
//!
//! Fields are sliced from each line by 1-based character offsets. Offsets past
//! the end of a line read as null instead of failing the line.

use dp_common::digest::short_sha256_hex;
use serde_json::Value;

use crate::error::Result;
use crate::filter::{filter_from_entry, RecordFilter};
use crate::record::{attach_markers, Record, OCID_KEY};
use crate::registry::{ResourceParserCapability, StrategyFactory, StrategyRegistry};

use super::params::{type_name, Params};
use super::{ErrorPolicy, ResourceParser, RowError};

const STRATEGY: &str = "fixed_width";

const OCID_PREFIX: &str = "ocid:v1:co:";
const OCID_HASH_LEN: usize = 16;

/// One field of a fixed-width layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    /// 1-based character offset
    pub start: usize,
    /// Width in characters
    pub length: usize,
}

impl FieldSpec {
    fn extract<'l>(&self, line: &'l str) -> &'l str {
        let begin = self.start - 1;
        let end = begin.saturating_add(self.length);
        if line.is_ascii() {
            let len = line.len();
            return &line[begin.min(len)..end.min(len)];
        }
        &line[char_offset(line, begin)..char_offset(line, end)]
    }
}

/// Byte offset of the `n`th character, clamped to the end of the line
fn char_offset(line: &str, n: usize) -> usize {
    line.char_indices().nth(n).map_or(line.len(), |(offset, _)| offset)
}

/// Derives `oc:ocid` from the jurisdiction and a company number field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcidGenerator {
    pub jurisdiction_code: String,
    pub company_number_field: String,
}

impl OcidGenerator {
    pub fn generate(&self, record: &Record) -> String {
        match record.get(&self.company_number_field) {
            Some(Value::String(number)) if !number.is_empty() => {
                let key = format!("{}|{}", self.jurisdiction_code, number);
                format!("{OCID_PREFIX}{}", short_sha256_hex(key.as_bytes(), OCID_HASH_LEN))
            },
            _ => format!("{OCID_PREFIX}unknown"),
        }
    }
}

/// Configured fixed-width parser
#[derive(Debug, Clone)]
pub struct FixedWidthParser {
    field_specs: Vec<FieldSpec>,
    skip_rows: u64,
    limit_rows: Option<u64>,
    on_error: ErrorPolicy,
    schema_version: Option<String>,
    ocid_generator: Option<OcidGenerator>,
    filter: Option<RecordFilter>,
}

impl FixedWidthParser {
    pub fn error_policy(&self) -> ErrorPolicy {
        self.on_error
    }

    pub fn field_specs(&self) -> &[FieldSpec] {
        &self.field_specs
    }

    fn build_record(&self, line: &str, source_row: u64) -> Record {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let mut record = Record::new();
        for spec in &self.field_specs {
            let value = spec.extract(line).trim();
            let value = if value.is_empty() {
                Value::Null
            } else {
                Value::String(value.to_string())
            };
            record.insert(spec.name.clone(), value);
        }

        attach_markers(&mut record, self.schema_version.as_deref(), source_row);
        if let Some(generator) = &self.ocid_generator {
            let ocid = generator.generate(&record);
            record.insert(OCID_KEY.to_string(), Value::String(ocid));
        }
        record
    }
}

/// Row cursor over the configured line window of one resource
pub(crate) struct FixedWidthRows<'a> {
    parser: &'a FixedWidthParser,
    lines: std::iter::Take<std::iter::Skip<std::iter::Enumerate<std::vec::IntoIter<String>>>>,
}

impl<'a> FixedWidthRows<'a> {
    pub fn new(parser: &'a FixedWidthParser, lines: Vec<String>) -> Self {
        let skip = usize::try_from(parser.skip_rows).unwrap_or(usize::MAX);
        let take = parser
            .limit_rows
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        Self {
            parser,
            lines: lines.into_iter().enumerate().skip(skip).take(take),
        }
    }
}

impl Iterator for FixedWidthRows<'_> {
    type Item = std::result::Result<Record, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        for (index, line) in self.lines.by_ref() {
            let record = self.parser.build_record(&line, index as u64 + 1);
            if self.parser.filter.as_ref().is_none_or(|filter| filter.accepts(&record)) {
                return Some(Ok(record));
            }
        }
        None
    }
}

/// Builds [`FixedWidthParser`]s from `fixed_width` parameters
pub struct FixedWidthParserFactory;

impl FixedWidthParserFactory {
    fn field_specs(params: &Params<'_>) -> Result<Vec<FieldSpec>> {
        let entries = match params.get("field_specs") {
            Some(Value::Array(entries)) if !entries.is_empty() => entries,
            Some(Value::Array(_)) | None => {
                return Err(params.error("field_specs", "is required and must not be empty"));
            },
            Some(other) => {
                return Err(params.error(
                    "field_specs",
                    format!("must be a list, got {}", type_name(other)),
                ));
            },
        };

        entries
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let spec = Params::new(STRATEGY, entry)
                    .map_err(|_| params.error("field_specs", format!("entry {position} must be a mapping")))?;
                let name = spec
                    .string("name")?
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| params.error("field_specs", format!("entry {position} needs a name")))?;
                let offset = |key: &str| -> Result<usize> {
                    match spec.count(key)? {
                        Some(value) if value >= 1 => usize::try_from(value)
                            .map_err(|_| params.error("field_specs", format!("'{name}' {key} is too large"))),
                        _ => Err(params.error(
                            "field_specs",
                            format!("'{name}' needs a {key} of at least 1"),
                        )),
                    }
                };
                Ok(FieldSpec {
                    name: name.to_string(),
                    start: offset("start")?,
                    length: offset("length")?,
                })
            })
            .collect()
    }

    fn ocid_generator(params: &Params<'_>, field_specs: &[FieldSpec]) -> Result<Option<OcidGenerator>> {
        let Some(value) = params.get("ocid_generator") else {
            return Ok(None);
        };
        let generator = Params::new(STRATEGY, value)
            .map_err(|_| params.error("ocid_generator", "must be a mapping"))?;
        generator.reject_unknown(&["jurisdiction_code", "company_number_field"])?;

        let jurisdiction_code = generator
            .string("jurisdiction_code")?
            .ok_or_else(|| params.error("ocid_generator", "needs a jurisdiction_code"))?;
        let company_number_field = match generator.string("company_number_field")? {
            Some(field) => field.to_string(),
            None => field_specs
                .first()
                .map(|spec| spec.name.clone())
                .unwrap_or_default(),
        };

        Ok(Some(OcidGenerator {
            jurisdiction_code: jurisdiction_code.to_string(),
            company_number_field,
        }))
    }
}

impl StrategyFactory<ResourceParserCapability> for FixedWidthParserFactory {
    fn create(&self, params: &Value, registry: &StrategyRegistry) -> Result<ResourceParser> {
        let params = Params::new(STRATEGY, params)?;
        params.reject_unknown(&[
            "field_specs",
            "encoding",
            "skip_rows",
            "limit_rows",
            "on_error",
            "schema_version",
            "ocid_generator",
            "filter",
        ])?;

        let encoding = params.string("encoding")?.unwrap_or("utf-8");
        if !matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8") {
            return Err(params.error("encoding", format!("only utf-8 is supported, got '{encoding}'")));
        }

        let field_specs = Self::field_specs(&params)?;
        let ocid_generator = Self::ocid_generator(&params, &field_specs)?;

        let on_error = match params.string("on_error")? {
            None => ErrorPolicy::default(),
            Some(name) => ErrorPolicy::parse_name(name)
                .ok_or_else(|| params.error("on_error", format!("must be 'skip' or 'fail', got '{name}'")))?,
        };

        let limit_rows = params.count("limit_rows")?;
        if limit_rows == Some(0) {
            return Err(params.error("limit_rows", "must be at least 1"));
        }

        let filter = params
            .get("filter")
            .map(|entry| filter_from_entry(STRATEGY, "filter", entry, registry))
            .transpose()?;

        Ok(ResourceParser::FixedWidth(FixedWidthParser {
            field_specs,
            skip_rows: params.count("skip_rows")?.unwrap_or(0),
            limit_rows,
            on_error,
            schema_version: params.string("schema_version")?.map(str::to_string),
            ocid_generator,
            filter,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::emitter::JsonlEmitter;
    use crate::registry::default_registry;
    use serde_json::json;

    fn parser(params: Value) -> ResourceParser {
        default_registry()
            .unwrap()
            .create(ResourceParserCapability, STRATEGY, &params)
            .unwrap()
    }

    fn parse(params: Value, text: &str) -> Vec<Value> {
        let mut emitter = JsonlEmitter::new(Vec::new());
        parser(params).parse_text(text, &mut emitter).unwrap();
        let output = String::from_utf8(emitter.into_inner().unwrap()).unwrap();
        output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn company_specs() -> Value {
        json!([
            {"name": "company_number", "start": 1, "length": 8},
            {"name": "company_name", "start": 9, "length": 20}
        ])
    }

    #[test]
    fn test_parse_fixed_width() {
        let text = "12345678Acme Corporation    \n87654321Widget Industries   \n";
        let records = parse(
            json!({
                "field_specs": company_specs(),
                "ocid_generator": {"jurisdiction_code": "gb"},
                "schema_version": "v1.0"
            }),
            text,
        );

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["company_number"], "12345678");
        assert_eq!(records[0]["company_name"], "Acme Corporation");
        assert_eq!(records[0]["oc:source_row"], "1");
        assert_eq!(records[1]["company_name"], "Widget Industries");
        assert_eq!(records[1]["oc:source_row"], "2");

        let keys: Vec<&str> = records[0].as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["company_number", "company_name", "_schema_version", "oc:source_row", "oc:ocid"]
        );

        let expected = format!("ocid:v1:co:{}", short_sha256_hex(b"gb|12345678", 16));
        assert_eq!(records[0]["oc:ocid"], expected.as_str());
        assert_ne!(records[0]["oc:ocid"], records[1]["oc:ocid"]);
    }

    #[test]
    fn test_ocid_is_deterministic_across_runs() {
        let params = json!({
            "field_specs": company_specs(),
            "ocid_generator": {"jurisdiction_code": "gb", "company_number_field": "company_number"}
        });
        let first = parse(params.clone(), "12345678Acme\n");
        let second = parse(params, "12345678Acme Renamed\n");
        assert_eq!(first[0]["oc:ocid"], second[0]["oc:ocid"]);
    }

    #[test]
    fn test_ocid_unknown_when_company_number_empty() {
        let records = parse(
            json!({"field_specs": company_specs(), "ocid_generator": {"jurisdiction_code": "gb"}}),
            "        Nameless Ltd\n",
        );
        assert_eq!(records[0]["company_number"], Value::Null);
        assert_eq!(records[0]["oc:ocid"], "ocid:v1:co:unknown");
    }

    #[test]
    fn test_out_of_range_offsets_are_null() {
        let records = parse(
            json!({"field_specs": [
                {"name": "code", "start": 1, "length": 3},
                {"name": "tail", "start": 10, "length": 5}
            ]}),
            "ABC\n",
        );
        assert_eq!(records[0]["code"], "ABC");
        assert_eq!(records[0]["tail"], Value::Null);
    }

    #[test]
    fn test_offsets_count_characters() {
        let records = parse(
            json!({"field_specs": [
                {"name": "city", "start": 1, "length": 9},
                {"name": "code", "start": 10, "length": 2}
            ]}),
            "São PauloSP\r\n",
        );
        assert_eq!(records[0]["city"], "São Paulo");
        assert_eq!(records[0]["code"], "SP");
    }

    #[test]
    fn test_line_window() {
        let records = parse(
            json!({
                "field_specs": [{"name": "n", "start": 1, "length": 1}],
                "skip_rows": 1,
                "limit_rows": 2
            }),
            "a\nb\nc\nd\n",
        );
        let values: Vec<&str> = records.iter().map(|r| r["n"].as_str().unwrap()).collect();
        assert_eq!(values, vec!["b", "c"]);
        assert_eq!(records[0]["oc:source_row"], "2");
    }

    #[test]
    fn test_filter_applies_within_window() {
        let records = parse(
            json!({
                "field_specs": [{"name": "status", "start": 1, "length": 1}],
                "filter": {"field_value_filter": {"field_name": "status", "exclude_values": ["D"]}}
            }),
            "A\nD\nA\n",
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["oc:source_row"], "3");
    }

    #[test]
    fn test_invalid_field_specs() {
        let registry = default_registry().unwrap();
        let invalid = [
            json!({}),
            json!({"field_specs": []}),
            json!({"field_specs": "name"}),
            json!({"field_specs": [{"name": "a", "start": 0, "length": 1}]}),
            json!({"field_specs": [{"name": "a", "start": 1}]}),
            json!({"field_specs": [{"start": 1, "length": 1}]}),
            json!({"field_specs": [{"name": "a", "start": 1, "length": 1}], "ocid_generator": {}}),
            json!({"field_specs": [{"name": "a", "start": 1, "length": 1}], "encoding": "cp1252"}),
        ];
        for params in invalid {
            assert!(
                registry.create(ResourceParserCapability, STRATEGY, &params).is_err(),
                "accepted {params}"
            );
        }
    }
}
