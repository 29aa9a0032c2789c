//! Pipeline bus interface
//!
//! The bus is the conversion engine's only view of the outside world: it
//! announces which bundle to process, serves resource bytes, accepts converted
//! outputs, and records bundle completion.
//!
//! Two implementations ship with the crate:
//! - [`LocalBundleBus`]: bundles laid out as directories on the local filesystem
//! - [`MemoryBus`]: bundles held in memory, recording what was uploaded

mod local;
mod memory;

pub use local::LocalBundleBus;
pub use memory::{MemoryBus, UploadedResource};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;

use crate::error::{ParserError, Result};

/// Chunked resource content
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Called with the cumulative number of bytes uploaded so far
pub type ProgressCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Notification that a bundle is ready at a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub stage: String,
    pub bundle_id: String,
}

impl ChangeEvent {
    pub fn new(bundle_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            bundle_id: bundle_id.into(),
        }
    }
}

#[async_trait]
pub trait PipelineBus: Send + Sync {
    /// The event that triggered this run
    async fn get_change_event(&self) -> Result<ChangeEvent>;

    /// Descriptive metadata for a bundle at a stage
    async fn get_bundle_metadata(&self, bundle_id: &str, stage: &str) -> Result<Value>;

    /// Names of the bundle's resources at the triggering stage
    async fn get_bundle_resource_list(&self, bundle_id: &str) -> Result<Vec<String>>;

    /// Read a resource as a stream of byte chunks
    async fn open_resource_stream(&self, bundle_id: &str, resource_name: &str) -> Result<ByteStream>;

    /// Store a converted output, reporting cumulative bytes to `progress`
    async fn upload_resource_stream(
        &self,
        bundle_id: &str,
        output_name: &str,
        metadata: Value,
        data: ByteStream,
        progress: ProgressCallback,
    ) -> Result<()>;

    /// Mark the bundle as fully converted
    async fn complete_bundle(&self, bundle_id: &str, completion_metadata: Value) -> Result<()>;
}

/// Reject names that could escape the bundle directory
pub(crate) fn validate_resource_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(ParserError::Bus(format!("Invalid resource name: {name:?}")));
    }
    Ok(())
}
