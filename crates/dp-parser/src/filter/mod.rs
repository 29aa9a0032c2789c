//! Record filters
//!
//! A filter decides whether an already-parsed record is emitted. Parsers take
//! an optional `filter: {strategy_name: params}` parameter; rejected records
//! are dropped without counting toward the parser's row limit.

use chrono::NaiveDate;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::Result;
use crate::record::Record;
use crate::registry::{RecordFilterCapability, StrategyFactory, StrategyRegistry};
use crate::strategy::params::{single_entry, Params};

#[derive(Debug, Clone)]
pub enum RecordFilter {
    Date(DateFilter),
    FieldValue(FieldValueFilter),
    Composite(CompositeFilter),
}

impl RecordFilter {
    pub fn accepts(&self, record: &Record) -> bool {
        match self {
            RecordFilter::Date(filter) => filter.accepts(record),
            RecordFilter::FieldValue(filter) => filter.accepts(record),
            RecordFilter::Composite(filter) => filter.accepts(record),
        }
    }
}

/// Build a filter from a `{strategy_name: params}` mapping
pub(crate) fn filter_from_entry(
    owner: &str,
    field: &str,
    value: &Value,
    registry: &StrategyRegistry,
) -> Result<RecordFilter> {
    let (name, params) = single_entry(owner, field, value)?;
    registry.create(RecordFilterCapability, name, params)
}

/// Text form of a field value used for comparisons; null reads as `"null"`
fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Date filter
// ============================================================================

/// Accepted textual date layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePattern {
    /// `YYYYMMDD`
    Compact,
    /// `YYYY-MM-DD`
    Iso,
    /// `MM/DD/YYYY`
    MonthFirst,
    /// `DD/MM/YYYY`
    DayFirst,
}

impl DatePattern {
    fn parse_name(name: &str) -> Option<Self> {
        match name {
            "YYYYMMDD" => Some(DatePattern::Compact),
            "YYYY-MM-DD" => Some(DatePattern::Iso),
            "MM/DD/YYYY" => Some(DatePattern::MonthFirst),
            "DD/MM/YYYY" => Some(DatePattern::DayFirst),
            _ => None,
        }
    }

    fn format(self) -> &'static str {
        match self {
            DatePattern::Compact => "%Y%m%d",
            DatePattern::Iso => "%Y-%m-%d",
            DatePattern::MonthFirst => "%m/%d/%Y",
            DatePattern::DayFirst => "%d/%m/%Y",
        }
    }

    pub fn parse(self, text: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(text.trim(), self.format()).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOperator {
    /// Bounds are inclusive; a missing bound is open
    Between,
    /// On or after the start date
    After,
    /// On or before the end date
    Before,
    /// Same calendar day as the start date
    Equals,
}

impl DateOperator {
    fn parse_name(name: &str) -> Option<Self> {
        match name {
            "between" => Some(DateOperator::Between),
            "after" => Some(DateOperator::After),
            "before" => Some(DateOperator::Before),
            "equals" => Some(DateOperator::Equals),
            _ => None,
        }
    }
}

/// Keeps records whose date field satisfies a comparison
#[derive(Debug, Clone)]
pub struct DateFilter {
    date_field: String,
    pattern: DatePattern,
    operator: DateOperator,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl DateFilter {
    /// Missing, null, empty or unparseable dates are rejected
    pub fn accepts(&self, record: &Record) -> bool {
        let Some(date) = record
            .get(&self.date_field)
            .filter(|value| !value.is_null())
            .map(field_text)
            .and_then(|text| self.pattern.parse(&text))
        else {
            return false;
        };

        match self.operator {
            DateOperator::Between => {
                self.start.is_none_or(|start| date >= start) && self.end.is_none_or(|end| date <= end)
            },
            DateOperator::After => self.start.is_none_or(|start| date >= start),
            DateOperator::Before => self.end.is_none_or(|end| date <= end),
            DateOperator::Equals => self.start == Some(date),
        }
    }
}

pub struct DateFilterFactory;

impl StrategyFactory<RecordFilterCapability> for DateFilterFactory {
    fn create(&self, params: &Value, _registry: &StrategyRegistry) -> Result<RecordFilter> {
        let params = Params::new("date_filter", params)?;
        params.reject_unknown(&[
            "date_field",
            "start_date",
            "end_date",
            "date_pattern",
            "comparison_operator",
        ])?;

        let date_field = params.required_string("date_field")?.to_string();

        let pattern_name = params.string("date_pattern")?.unwrap_or("YYYYMMDD");
        let pattern = DatePattern::parse_name(pattern_name).ok_or_else(|| {
            params.error(
                "date_pattern",
                format!(
                    "must be one of YYYYMMDD, YYYY-MM-DD, MM/DD/YYYY, DD/MM/YYYY, got '{pattern_name}'"
                ),
            )
        })?;

        let operator_name = params.string("comparison_operator")?.unwrap_or("between");
        let operator = DateOperator::parse_name(operator_name).ok_or_else(|| {
            params.error(
                "comparison_operator",
                format!("must be one of between, after, before, equals, got '{operator_name}'"),
            )
        })?;

        let parse_bound = |field: &str| -> Result<Option<NaiveDate>> {
            params
                .string(field)?
                .map(|text| {
                    pattern.parse(text).ok_or_else(|| {
                        params.error(field, format!("'{text}' does not match pattern {pattern_name}"))
                    })
                })
                .transpose()
        };
        let start = parse_bound("start_date")?;
        let end = parse_bound("end_date")?;

        match operator {
            DateOperator::Between if start.is_none() && end.is_none() => {
                return Err(params.error("start_date", "or end_date is required for operator 'between'"));
            },
            DateOperator::After | DateOperator::Equals if start.is_none() => {
                return Err(params.error("start_date", format!("is required for operator '{operator_name}'")));
            },
            DateOperator::Before if end.is_none() => {
                return Err(params.error("end_date", "is required for operator 'before'"));
            },
            _ => {},
        }

        Ok(RecordFilter::Date(DateFilter {
            date_field,
            pattern,
            operator,
            start,
            end,
        }))
    }
}

// ============================================================================
// Field value filter
// ============================================================================

/// Keeps records by allowed values, excluded values, or a regex
#[derive(Debug, Clone)]
pub struct FieldValueFilter {
    field_name: String,
    allowed: Option<Vec<String>>,
    excluded: Vec<String>,
    /// `case_sensitive` only shapes this; list membership is always exact
    pattern: Option<Regex>,
}

fn listed(candidates: &[String], value: &str) -> bool {
    candidates.iter().any(|candidate| candidate == value)
}

impl FieldValueFilter {
    /// Missing fields are rejected
    pub fn accepts(&self, record: &Record) -> bool {
        let Some(value) = record.get(&self.field_name).map(field_text) else {
            return false;
        };

        if listed(&self.excluded, &value) {
            return false;
        }
        if let Some(allowed) = &self.allowed {
            if !listed(allowed, &value) {
                return false;
            }
        }
        self.pattern.as_ref().is_none_or(|pattern| pattern.is_match(&value))
    }
}

pub struct FieldValueFilterFactory;

impl StrategyFactory<RecordFilterCapability> for FieldValueFilterFactory {
    fn create(&self, params: &Value, _registry: &StrategyRegistry) -> Result<RecordFilter> {
        let params = Params::new("field_value_filter", params)?;
        params.reject_unknown(&[
            "field_name",
            "filter_values",
            "exclude_values",
            "pattern",
            "case_sensitive",
        ])?;

        let field_name = params.required_string("field_name")?.to_string();
        let allowed = params.string_list("filter_values")?;
        let excluded = params.string_list("exclude_values")?.unwrap_or_default();
        let case_sensitive = params.boolean("case_sensitive")?.unwrap_or(true);

        let pattern = params
            .string("pattern")?
            .map(|source| {
                RegexBuilder::new(source)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|e| params.error("pattern", format!("is not a valid regex: {e}")))
            })
            .transpose()?;

        if allowed.is_none() && excluded.is_empty() && pattern.is_none() {
            return Err(params.error(
                "filter_values",
                "or exclude_values or pattern must be provided",
            ));
        }

        Ok(RecordFilter::FieldValue(FieldValueFilter {
            field_name,
            allowed,
            excluded,
            pattern,
        }))
    }
}

// ============================================================================
// Composite filter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOperator {
    And,
    Or,
}

/// Combines child filters with AND or OR
#[derive(Debug, Clone)]
pub struct CompositeFilter {
    filters: Vec<RecordFilter>,
    operator: LogicOperator,
}

impl CompositeFilter {
    pub fn accepts(&self, record: &Record) -> bool {
        match self.operator {
            LogicOperator::And => self.filters.iter().all(|filter| filter.accepts(record)),
            LogicOperator::Or => self.filters.iter().any(|filter| filter.accepts(record)),
        }
    }
}

pub struct CompositeFilterFactory;

impl StrategyFactory<RecordFilterCapability> for CompositeFilterFactory {
    fn create(&self, params: &Value, registry: &StrategyRegistry) -> Result<RecordFilter> {
        let strategy = "composite_filter";
        let params = Params::new(strategy, params)?;
        params.reject_unknown(&["filters", "operator"])?;

        let operator_name = params.string("operator")?.unwrap_or("AND");
        let operator = if operator_name.eq_ignore_ascii_case("and") {
            LogicOperator::And
        } else if operator_name.eq_ignore_ascii_case("or") {
            LogicOperator::Or
        } else {
            return Err(params.error("operator", format!("must be AND or OR, got '{operator_name}'")));
        };

        let entries = match params.get("filters") {
            Some(Value::Array(entries)) if !entries.is_empty() => entries,
            Some(Value::Array(_)) | None => {
                return Err(params.error("filters", "must list at least one filter"));
            },
            Some(_) => return Err(params.error("filters", "must be a list of {filter_name: params}")),
        };

        let filters = entries
            .iter()
            .map(|entry| filter_from_entry(strategy, "filters", entry, registry))
            .collect::<Result<Vec<_>>>()?;

        Ok(RecordFilter::Composite(CompositeFilter { filters, operator }))
    }
}
