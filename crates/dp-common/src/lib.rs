//! Data Parser Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the data parser workspace.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Digests**: SHA-256 helpers used for output checksums and content-derived identifiers
//!
//! # Example
//!
//! ```no_run
//! use dp_common::digest::compute_checksum;
//!
//! fn main() -> dp_common::Result<()> {
//!     let mut file = std::fs::File::open("companies.csv.jsonl")?;
//!     let checksum = compute_checksum(&mut file)?;
//!     println!("{checksum}");
//!     Ok(())
//! }
//! ```

pub mod digest;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
