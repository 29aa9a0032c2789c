//! Typed access to loosely-typed strategy parameters
//!
//! Factories receive their parameters as JSON values taken straight from the
//! configuration document. `Params` reads them field by field so every
//! rejection names the offending field. An explicit `null` is treated the same
//! as an absent key.

use serde_json::{Map, Value};

use crate::error::{ParserError, Result};

pub(crate) struct Params<'a> {
    strategy: &'a str,
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Params<'a> {
    /// Wrap a parameter value; `null` is an empty parameter set
    pub fn new(strategy: &'a str, value: &'a Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self { strategy, map: None }),
            Value::Object(map) => Ok(Self {
                strategy,
                map: Some(map),
            }),
            other => Err(ParserError::invalid(
                strategy,
                "<params>",
                format!("must be a mapping, got {}", type_name(other)),
            )),
        }
    }

    pub fn error(&self, field: &str, reason: impl Into<String>) -> ParserError {
        ParserError::invalid(self.strategy, field, reason)
    }

    /// Fail on keys outside `known`
    pub fn reject_unknown(&self, known: &[&str]) -> Result<()> {
        if let Some(map) = self.map {
            if let Some(key) = map.keys().find(|key| !known.contains(&key.as_str())) {
                return Err(self.error(key, "is not a recognised parameter"));
            }
        }
        Ok(())
    }

    pub fn get(&self, field: &str) -> Option<&'a Value> {
        self.map
            .and_then(|map| map.get(field))
            .filter(|value| !value.is_null())
    }

    /// First present key among `aliases`, with the key that matched
    fn get_any(&self, aliases: &[&'a str]) -> Option<(&'a str, &'a Value)> {
        aliases
            .iter()
            .find_map(|alias| self.get(alias).map(|value| (*alias, value)))
    }

    pub fn string(&self, field: &str) -> Result<Option<&'a str>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.error(field, format!("must be a string, got {}", type_name(other)))),
        }
    }

    pub fn required_string(&self, field: &str) -> Result<&'a str> {
        self.string(field)?
            .ok_or_else(|| self.error(field, "is required"))
    }

    /// Single ASCII character, looked up under any of `aliases`
    pub fn ascii_char(&self, aliases: &[&'a str]) -> Result<Option<u8>> {
        let Some((field, value)) = self.get_any(aliases) else {
            return Ok(None);
        };
        let Value::String(s) = value else {
            return Err(self.error(field, format!("must be a string, got {}", type_name(value))));
        };
        match s.as_bytes() {
            [byte] if byte.is_ascii() => Ok(Some(*byte)),
            _ => Err(self.error(field, format!("must be a single ASCII character, got {s:?}"))),
        }
    }

    pub fn boolean(&self, field: &str) -> Result<Option<bool>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.error(field, format!("must be a boolean, got {}", type_name(other)))),
        }
    }

    /// Non-negative integer
    pub fn count(&self, field: &str) -> Result<Option<u64>> {
        match self.get(field) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                self.error(field, format!("must be a non-negative integer, got {value}"))
            }),
        }
    }

    pub fn string_list(&self, field: &str) -> Result<Option<Vec<String>>> {
        let Some(value) = self.get(field) else {
            return Ok(None);
        };
        let Value::Array(items) = value else {
            return Err(self.error(field, format!("must be a list of strings, got {}", type_name(value))));
        };
        items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(self.error(field, format!("must contain only strings, found {other}"))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Mapping of string to string, in declaration order
    pub fn string_map(&self, field: &str) -> Result<Vec<(String, String)>> {
        let Some(value) = self.get(field) else {
            return Ok(Vec::new());
        };
        let Value::Object(map) = value else {
            return Err(self.error(field, format!("must be a mapping, got {}", type_name(value))));
        };
        map.iter()
            .map(|(key, value)| match value {
                Value::String(s) => Ok((key.clone(), s.clone())),
                other => Err(self.error(
                    field,
                    format!("entry '{key}' must map to a string, got {}", type_name(other)),
                )),
            })
            .collect()
    }
}

/// Split a `{name: params}` mapping with exactly one entry
pub(crate) fn single_entry<'a>(
    strategy: &str,
    field: &str,
    value: &'a Value,
) -> Result<(&'a str, &'a Value)> {
    match value {
        Value::Object(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(name, params)| (name.as_str(), params))
            .ok_or_else(|| ParserError::invalid(strategy, field, "must name exactly one strategy")),
        _ => Err(ParserError::invalid(
            strategy,
            field,
            "must be a mapping with exactly one {strategy_name: params} entry",
        )),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_params_are_empty() {
        let value = Value::Null;
        let params = Params::new("csv", &value).unwrap();
        assert_eq!(params.string("delimiter").unwrap(), None);
        assert!(params.reject_unknown(&[]).is_ok());
    }

    #[test]
    fn test_non_mapping_params_rejected() {
        let value = json!(["delimiter"]);
        let err = Params::new("csv", &value).err().unwrap();
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn test_mistyped_field_is_named() {
        let value = json!({"delimiter": 5});
        let params = Params::new("csv", &value).unwrap();
        let err = params.ascii_char(&["delimiter"]).unwrap_err();
        match err {
            ParserError::InvalidConfiguration { field, .. } => assert_eq!(field, "delimiter"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_ascii_char_aliases() {
        let value = json!({"quotechar": "'"});
        let params = Params::new("csv", &value).unwrap();
        assert_eq!(params.ascii_char(&["quote", "quotechar"]).unwrap(), Some(b'\''));

        let value = json!({"delimiter": "||"});
        let params = Params::new("csv", &value).unwrap();
        assert!(params.ascii_char(&["delimiter"]).is_err());
    }

    #[test]
    fn test_explicit_null_counts_as_absent() {
        let value = json!({"limit_rows": null});
        let params = Params::new("csv", &value).unwrap();
        assert_eq!(params.count("limit_rows").unwrap(), None);
    }

    #[test]
    fn test_count_rejects_negative() {
        let value = json!({"skip_rows": -1});
        let params = Params::new("csv", &value).unwrap();
        assert!(params.count("skip_rows").is_err());
    }

    #[test]
    fn test_string_map_keeps_order() {
        let value = json!({"rename": {"b": "beta", "a": "alpha"}});
        let params = Params::new("csv", &value).unwrap();
        let map = params.string_map("rename").unwrap();
        assert_eq!(map[0], ("b".to_string(), "beta".to_string()));
        assert_eq!(map[1], ("a".to_string(), "alpha".to_string()));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let value = json!({"delimeter": ";"});
        let params = Params::new("csv", &value).unwrap();
        let err = params.reject_unknown(&["delimiter"]).unwrap_err();
        assert!(err.to_string().contains("delimeter"));
    }

    #[test]
    fn test_single_entry() {
        let value = json!({"csv": {"delimiter": ";"}});
        let (name, params) = single_entry("config", "resource_parsers", &value).unwrap();
        assert_eq!(name, "csv");
        assert_eq!(params["delimiter"], ";");

        let value = json!({"csv": {}, "fixed_width": {}});
        assert!(single_entry("config", "resource_parsers", &value).is_err());
    }
}
