//! Data Parser Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Converts flat-file resources (delimited text and fixed-width text) into
//! JSON Lines, one record object per line.
//!
//! # Components
//!
//! - **Strategies**: [`strategy::ResourceParser`] implementations for `csv`
//!   and `fixed_width`, plus [`filter::RecordFilter`]s, built by name through
//!   the [`registry::StrategyRegistry`]
//! - **Configuration**: [`config::ParserConfig`] maps resource-name patterns
//!   to configured strategies; first match wins
//! - **Streaming**: [`decode::decode_lines`] turns byte chunks into lines and
//!   [`emitter::JsonlEmitter`] writes records
//! - **Pipeline**: [`pipeline::convert_resource`] converts and uploads one
//!   resource through a [`bus::PipelineBus`]
//! - **Worker pool**: [`worker::run_parser`] converts a whole bundle with
//!   bounded concurrency and stops at the first failure
//!
//! # Example
//!
//! ```no_run
//! use dp_parser::bus::{ChangeEvent, LocalBundleBus};
//! use dp_parser::config::ParserConfig;
//! use dp_parser::registry::default_registry;
//! use dp_parser::worker::{run_parser, run_span};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> dp_parser::Result<()> {
//!     let registry = default_registry()?;
//!     let config = ParserConfig::load("parsers.yaml", &registry)?;
//!     let bus = LocalBundleBus::new("./bundles", ChangeEvent::new("companies-2024", "raw"));
//!
//!     let summary = run_parser(Arc::new(bus), "local", Arc::new(config), run_span("local")).await?;
//!     println!("converted {} records", summary.total_records());
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod decode;
pub mod emitter;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod strategy;
pub mod worker;

pub use error::{ParserError, Result};
