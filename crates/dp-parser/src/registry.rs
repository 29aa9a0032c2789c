//! Strategy registry
//!
//! Strategies are registered per capability under a unique name. A capability
//! is a marker type fixing what its factories produce, so looking up a
//! resource parser can never hand back a record filter.
//!
//! ```no_run
//! use dp_parser::registry::{default_registry, ResourceParserCapability};
//! use serde_json::json;
//!
//! # fn main() -> dp_parser::Result<()> {
//! let registry = default_registry()?;
//! let parser = registry.create(ResourceParserCapability, "csv", &json!({"delimiter": ";"}))?;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::error::{ParserError, Result};
use crate::filter::{
    CompositeFilterFactory, DateFilterFactory, FieldValueFilterFactory, RecordFilter,
};
use crate::strategy::delimited::DelimitedParserFactory;
use crate::strategy::fixed_width::FixedWidthParserFactory;
use crate::strategy::ResourceParser;

type FactoryMap<C> = HashMap<String, Box<dyn StrategyFactory<C>>>;

/// A family of interchangeable strategies
pub trait Capability: Copy + Send + Sync + 'static {
    /// What the factories of this capability construct
    type Strategy;

    /// Name used in log lines and error messages
    const NAME: &'static str;

    #[doc(hidden)]
    fn factories(registry: &StrategyRegistry) -> &FactoryMap<Self>;

    #[doc(hidden)]
    fn factories_mut(registry: &mut StrategyRegistry) -> &mut FactoryMap<Self>;
}

/// Converts a resource's lines into records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceParserCapability;

impl Capability for ResourceParserCapability {
    type Strategy = ResourceParser;
    const NAME: &'static str = "resource_parser";

    fn factories(registry: &StrategyRegistry) -> &FactoryMap<Self> {
        &registry.parsers
    }

    fn factories_mut(registry: &mut StrategyRegistry) -> &mut FactoryMap<Self> {
        &mut registry.parsers
    }
}

/// Accepts or rejects already-parsed records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFilterCapability;

impl Capability for RecordFilterCapability {
    type Strategy = RecordFilter;
    const NAME: &'static str = "record_filter";

    fn factories(registry: &StrategyRegistry) -> &FactoryMap<Self> {
        &registry.filters
    }

    fn factories_mut(registry: &mut StrategyRegistry) -> &mut FactoryMap<Self> {
        &mut registry.filters
    }
}

/// Validates parameters and builds strategy instances
///
/// Factories receive the registry so nested strategies (a parser's filter, a
/// composite filter's children) resolve through the same registrations.
pub trait StrategyFactory<C: Capability>: Send + Sync {
    fn create(&self, params: &Value, registry: &StrategyRegistry) -> Result<C::Strategy>;

    /// Check parameters without keeping the instance
    fn validate(&self, params: &Value, registry: &StrategyRegistry) -> Result<()> {
        self.create(params, registry).map(|_| ())
    }
}

/// Registered strategy factories, keyed by capability and name
#[derive(Default)]
pub struct StrategyRegistry {
    parsers: FactoryMap<ResourceParserCapability>,
    filters: FactoryMap<RecordFilterCapability>,
}

impl StrategyRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`; names are unique per capability
    pub fn register<C, F>(&mut self, _capability: C, name: &str, factory: F) -> Result<()>
    where
        C: Capability,
        F: StrategyFactory<C> + 'static,
    {
        let factories = C::factories_mut(self);
        if factories.contains_key(name) {
            return Err(ParserError::DuplicateStrategy {
                capability: C::NAME.to_string(),
                name: name.to_string(),
            });
        }
        factories.insert(name.to_string(), Box::new(factory));
        Ok(())
    }

    pub fn validate<C: Capability>(&self, capability: C, name: &str, params: &Value) -> Result<()> {
        self.factory(capability, name)?.validate(params, self)
    }

    pub fn create<C: Capability>(
        &self,
        capability: C,
        name: &str,
        params: &Value,
    ) -> Result<C::Strategy> {
        self.factory(capability, name)?.create(params, self)
    }

    pub fn contains<C: Capability>(&self, _capability: C, name: &str) -> bool {
        C::factories(self).contains_key(name)
    }

    /// Registered names for a capability, sorted
    pub fn names<C: Capability>(&self, _capability: C) -> Vec<&str> {
        let mut names: Vec<&str> = C::factories(self).keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn factory<C: Capability>(&self, _capability: C, name: &str) -> Result<&dyn StrategyFactory<C>> {
        C::factories(self)
            .get(name)
            .map(|factory| factory.as_ref())
            .ok_or_else(|| ParserError::UnknownStrategy {
                capability: C::NAME.to_string(),
                name: name.to_string(),
            })
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("parsers", &self.names(ResourceParserCapability))
            .field("filters", &self.names(RecordFilterCapability))
            .finish()
    }
}

/// Register the built-in resource parsers: `csv` and `fixed_width`
pub fn register_parser_strategies(registry: &mut StrategyRegistry) -> Result<()> {
    registry.register(ResourceParserCapability, "csv", DelimitedParserFactory)?;
    registry.register(ResourceParserCapability, "fixed_width", FixedWidthParserFactory)?;
    Ok(())
}

/// Register the built-in record filters
pub fn register_filter_strategies(registry: &mut StrategyRegistry) -> Result<()> {
    registry.register(RecordFilterCapability, "date_filter", DateFilterFactory)?;
    registry.register(RecordFilterCapability, "field_value_filter", FieldValueFilterFactory)?;
    registry.register(RecordFilterCapability, "composite_filter", CompositeFilterFactory)?;
    Ok(())
}

/// Registry holding every built-in strategy
pub fn default_registry() -> Result<StrategyRegistry> {
    let mut registry = StrategyRegistry::new();
    register_parser_strategies(&mut registry)?;
    register_filter_strategies(&mut registry)?;
    Ok(registry)
}
