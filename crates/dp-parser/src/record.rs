//! Structured records produced by the parser strategies
//!
//! A record is an insertion-ordered JSON object: fields appear in source
//! column order followed by the `oc:` markers.

use serde_json::{Map, Value};

/// One parsed row or line
pub type Record = Map<String, Value>;

/// 1-based source line of the row, serialised as a string
pub const SOURCE_ROW_KEY: &str = "oc:source_row";

/// Content-derived company identifier
pub const OCID_KEY: &str = "oc:ocid";

/// Schema version tag requested by the strategy configuration
pub const SCHEMA_VERSION_KEY: &str = "_schema_version";

/// Append the schema-version and source-row markers to a finished record
pub fn attach_markers(record: &mut Record, schema_version: Option<&str>, source_row: u64) {
    if let Some(version) = schema_version {
        record.insert(SCHEMA_VERSION_KEY.to_string(), Value::String(version.to_string()));
    }
    record.insert(SOURCE_ROW_KEY.to_string(), Value::String(source_row.to_string()));
}
