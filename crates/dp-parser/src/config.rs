//! Configuration management
//!
//! Two layers:
//! - [`ParserConfig`]: the parser document mapping resource-name patterns to
//!   strategies, compiled eagerly so every strategy is validated at load time
//! - [`AppConfig`]: process settings read from the environment

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{ParserError, Result};
use crate::registry::{ResourceParserCapability, StrategyRegistry};
use crate::strategy::params::{single_entry, type_name};
use crate::strategy::ResourceParser;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default number of concurrent workers.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default root directory of the local bundle bus.
pub const DEFAULT_BUS_ROOT: &str = "./bundles";

/// Default pipeline stage resources are read from.
pub const DEFAULT_STAGE: &str = "raw";

/// Default data registry identifier.
pub const DEFAULT_DATA_REGISTRY_ID: &str = "local";

/// A resource-name pattern bound to a configured strategy
#[derive(Debug, Clone)]
pub struct ResourceRoute {
    pattern: Regex,
    source: String,
    strategy_name: String,
    parser: ResourceParser,
}

impl ResourceRoute {
    /// Compile `pattern` and build the strategy through `registry`
    ///
    /// Patterns match at the start of the resource name; they need not cover
    /// the whole name.
    pub fn new(
        pattern: &str,
        strategy_name: &str,
        params: &Value,
        registry: &StrategyRegistry,
    ) -> Result<Self> {
        let compiled = Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
            ParserError::Configuration(format!("Invalid resource pattern '{pattern}': {e}"))
        })?;
        let parser = registry.create(ResourceParserCapability, strategy_name, params)?;

        Ok(Self {
            pattern: compiled,
            source: pattern.to_string(),
            strategy_name: strategy_name.to_string(),
            parser,
        })
    }

    pub fn matches(&self, resource_name: &str) -> bool {
        self.pattern.is_match(resource_name)
    }

    /// The pattern as written in the configuration
    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn parser(&self) -> &ResourceParser {
        &self.parser
    }
}

/// Compiled parser configuration
#[derive(Debug, Clone)]
pub struct ParserConfig {
    routes: Vec<ResourceRoute>,
    concurrency: usize,
    config_id: String,
}

impl ParserConfig {
    /// Configuration with no routes
    pub fn new(concurrency: usize) -> Result<Self> {
        validate_concurrency(concurrency)?;
        Ok(Self {
            routes: Vec::new(),
            concurrency,
            config_id: String::new(),
        })
    }

    /// Append a route; earlier routes win
    pub fn with_route(mut self, route: ResourceRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_config_id(mut self, config_id: impl Into<String>) -> Self {
        self.config_id = config_id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Result<Self> {
        validate_concurrency(concurrency)?;
        self.concurrency = concurrency;
        Ok(self)
    }

    /// Compile a parsed configuration document
    pub fn from_value(document: &Value, registry: &StrategyRegistry) -> Result<Self> {
        let Value::Object(document) = document else {
            return Err(ParserError::Configuration(format!(
                "Parser configuration must be a mapping, got {}",
                type_name(document)
            )));
        };

        let concurrency = match document.get("concurrency") {
            None | Some(Value::Null) => DEFAULT_CONCURRENCY,
            Some(value) => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    ParserError::Configuration(format!(
                        "concurrency must be a positive integer, got {value}"
                    ))
                })?,
        };

        let config_id = match document.get("config_id") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
        };

        let routes = match document.get("resource_parsers") {
            Some(Value::Object(routes)) => routes,
            Some(other) => {
                return Err(ParserError::Configuration(format!(
                    "resource_parsers must be a mapping of pattern to strategy, got {}",
                    type_name(other)
                )));
            },
            None => {
                return Err(ParserError::Configuration(
                    "resource_parsers is required".to_string(),
                ));
            },
        };

        let mut config = Self::new(concurrency)?.with_config_id(config_id);
        for (pattern, entry) in routes {
            let (strategy_name, params) = single_entry("resource_parsers", pattern, entry)?;
            config = config.with_route(ResourceRoute::new(pattern, strategy_name, params, registry)?);
        }
        Ok(config)
    }

    pub fn from_yaml_str(text: &str, registry: &StrategyRegistry) -> Result<Self> {
        let document: Value = serde_yaml::from_str(text)?;
        Self::from_value(&document, registry)
    }

    pub fn from_json_str(text: &str, registry: &StrategyRegistry) -> Result<Self> {
        let document: Value = serde_json::from_str(text)?;
        Self::from_value(&document, registry)
    }

    /// Load a document from disk; `.json` files are JSON, anything else YAML
    pub fn load(path: impl AsRef<Path>, registry: &StrategyRegistry) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text, registry)
        } else {
            Self::from_yaml_str(&text, registry)
        }
    }

    /// First route, in declaration order, whose pattern matches the name
    pub fn resolve(&self, resource_name: &str) -> Result<&ResourceRoute> {
        self.routes
            .iter()
            .find(|route| route.matches(resource_name))
            .ok_or_else(|| {
                ParserError::Configuration(format!("No parser found for resource: {resource_name}"))
            })
    }

    pub fn routes(&self) -> &[ResourceRoute] {
        &self.routes
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }
}

fn validate_concurrency(concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        return Err(ParserError::Configuration(
            "concurrency must be at least 1".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Application settings
// ============================================================================

/// Process settings for the `dp-parser` binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bus_root: PathBuf,
    pub stage: String,
    pub data_registry_id: String,
    /// Overrides the parser document's `concurrency` when set
    pub concurrency: Option<usize>,
}

impl AppConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let concurrency = match std::env::var("DP_CONCURRENCY") {
            Ok(value) => Some(value.trim().parse().map_err(|_| {
                ParserError::Configuration(format!("DP_CONCURRENCY must be an integer, got '{value}'"))
            })?),
            Err(_) => None,
        };

        let config = AppConfig {
            bus_root: std::env::var("DP_BUS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_BUS_ROOT)),
            stage: std::env::var("DP_STAGE").unwrap_or_else(|_| DEFAULT_STAGE.to_string()),
            data_registry_id: std::env::var("DP_DATA_REGISTRY_ID")
                .unwrap_or_else(|_| DEFAULT_DATA_REGISTRY_ID.to_string()),
            concurrency,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.stage.trim().is_empty() {
            return Err(ParserError::Configuration("stage cannot be empty".to_string()));
        }

        if self.data_registry_id.trim().is_empty() {
            return Err(ParserError::Configuration(
                "data registry id cannot be empty".to_string(),
            ));
        }

        if let Some(concurrency) = self.concurrency {
            validate_concurrency(concurrency)?;
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus_root: PathBuf::from(DEFAULT_BUS_ROOT),
            stage: DEFAULT_STAGE.to_string(),
            data_registry_id: DEFAULT_DATA_REGISTRY_ID.to_string(),
            concurrency: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::default_registry;
    use serde_json::json;

    const YAML: &str = r#"
config_id: companies-v1
concurrency: 4
resource_parsers:
  "companies_.*\\.csv":
    csv:
      coerce:
        age: int
  "companies_.*":
    fixed_width:
      field_specs:
        - {name: company_number, start: 1, length: 8}
  ".*\\.csv":
    csv: {}
"#;

    #[test]
    fn test_load_yaml_preserves_declaration_order() {
        let registry = default_registry().unwrap();
        let config = ParserConfig::from_yaml_str(YAML, &registry).unwrap();

        assert_eq!(config.concurrency(), 4);
        assert_eq!(config.config_id(), "companies-v1");
        let patterns: Vec<&str> = config.routes().iter().map(ResourceRoute::pattern).collect();
        assert_eq!(patterns, vec!["companies_.*\\.csv", "companies_.*", ".*\\.csv"]);
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let registry = default_registry().unwrap();
        let config = ParserConfig::from_yaml_str(YAML, &registry).unwrap();

        assert_eq!(config.resolve("companies_2024.csv").unwrap().strategy_name(), "csv");
        assert_eq!(config.resolve("companies_2024.txt").unwrap().strategy_name(), "fixed_width");
        assert_eq!(config.resolve("people.csv").unwrap().pattern(), ".*\\.csv");
    }

    #[test]
    fn test_resolve_anchors_at_start() {
        let registry = default_registry().unwrap();
        let config = ParserConfig::new(1)
            .unwrap()
            .with_route(ResourceRoute::new("data", "csv", &json!({}), &registry).unwrap());

        assert!(config.resolve("data_2024.csv").is_ok());
        assert!(config.resolve("old_data.csv").is_err());
    }

    #[test]
    fn test_unmatched_resource_is_configuration_error() {
        let registry = default_registry().unwrap();
        let config = ParserConfig::from_yaml_str(YAML, &registry).unwrap();

        let err = config.resolve("readme.md").unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Configuration error: No parser found for resource: readme.md");
    }

    #[test]
    fn test_defaults_and_json_documents() {
        let registry = default_registry().unwrap();
        let config = ParserConfig::from_json_str(
            r#"{"resource_parsers": {".*": {"csv": null}}}"#,
            &registry,
        )
        .unwrap();
        assert_eq!(config.concurrency(), DEFAULT_CONCURRENCY);
        assert_eq!(config.config_id(), "");
    }

    #[test]
    fn test_invalid_documents_fail_eagerly() {
        let registry = default_registry().unwrap();
        let invalid = [
            json!({"resource_parsers": {".*": {"csv": {}}}, "concurrency": 0}),
            json!({"resource_parsers": {".*": {"csv": {}}}, "concurrency": -2}),
            json!({"resource_parsers": ["csv"]}),
            json!({"concurrency": 2}),
            json!({"resource_parsers": {"(": {"csv": {}}}}),
            json!({"resource_parsers": {".*": {"xml": {}}}}),
            json!({"resource_parsers": {".*": {"fixed_width": {}}}}),
            json!({"resource_parsers": {".*": {"csv": {}, "fixed_width": {}}}}),
        ];
        for document in invalid {
            let err = ParserConfig::from_value(&document, &registry).unwrap_err();
            assert!(err.is_configuration(), "unexpected error for {document}: {err}");
        }
    }

    #[test]
    fn test_load_from_file_by_extension() {
        let registry = default_registry().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("parsers.yaml");
        std::fs::write(&yaml_path, YAML).unwrap();
        assert_eq!(ParserConfig::load(&yaml_path, &registry).unwrap().routes().len(), 3);

        let json_path = dir.path().join("parsers.JSON");
        std::fs::write(&json_path, r#"{"resource_parsers": {".*": {"csv": {}}}}"#).unwrap();
        assert_eq!(ParserConfig::load(&json_path, &registry).unwrap().routes().len(), 1);
    }

    #[test]
    fn test_app_config_validation() {
        assert!(AppConfig::default().validate().is_ok());

        let config = AppConfig {
            concurrency: Some(0),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            stage: " ".to_string(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
