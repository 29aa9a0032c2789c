//! In-memory pipeline bus
//!
//! Holds one bundle's resources in memory and records every upload and the
//! completion call. Resources are served in fixed-size chunks so consumers see
//! the same chunk boundaries a network source would produce.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{validate_resource_name, ByteStream, ChangeEvent, PipelineBus, ProgressCallback};
use crate::error::{ParserError, Result};

/// Default size of served chunks
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// An output accepted by [`MemoryBus::upload_resource_stream`]
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedResource {
    pub bundle_id: String,
    pub output_name: String,
    pub metadata: Value,
    pub data: Vec<u8>,
    /// Cumulative byte counts reported during the upload
    pub progress: Vec<u64>,
}

impl UploadedResource {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Default)]
struct Recorded {
    uploads: Vec<UploadedResource>,
    completion: Option<Value>,
}

#[derive(Debug)]
pub struct MemoryBus {
    event: ChangeEvent,
    metadata: Value,
    resources: Vec<(String, Bytes)>,
    chunk_size: usize,
    recorded: Mutex<Recorded>,
}

impl MemoryBus {
    pub fn new(event: ChangeEvent) -> Self {
        Self {
            event,
            metadata: Value::Object(serde_json::Map::new()),
            resources: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Add a resource; resources are listed in insertion order
    pub fn with_resource(mut self, name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.resources.push((name.into(), content.into()));
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Uploads in the order they finished
    pub fn uploads(&self) -> Vec<UploadedResource> {
        self.recorded().uploads.clone()
    }

    pub fn upload(&self, output_name: &str) -> Option<UploadedResource> {
        self.recorded()
            .uploads
            .iter()
            .find(|upload| upload.output_name == output_name)
            .cloned()
    }

    /// Metadata passed to `complete_bundle`, if it was called
    pub fn completion(&self) -> Option<Value> {
        self.recorded().completion.clone()
    }

    fn check_bundle(&self, bundle_id: &str) -> Result<()> {
        if bundle_id != self.event.bundle_id {
            return Err(ParserError::Bus(format!("Unknown bundle: {bundle_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineBus for MemoryBus {
    async fn get_change_event(&self) -> Result<ChangeEvent> {
        Ok(self.event.clone())
    }

    async fn get_bundle_metadata(&self, bundle_id: &str, _stage: &str) -> Result<Value> {
        self.check_bundle(bundle_id)?;
        Ok(self.metadata.clone())
    }

    async fn get_bundle_resource_list(&self, bundle_id: &str) -> Result<Vec<String>> {
        self.check_bundle(bundle_id)?;
        Ok(self.resources.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn open_resource_stream(&self, bundle_id: &str, resource_name: &str) -> Result<ByteStream> {
        self.check_bundle(bundle_id)?;
        validate_resource_name(resource_name)?;
        let content = self
            .resources
            .iter()
            .find(|(name, _)| name == resource_name)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| ParserError::Bus(format!("Unknown resource: {resource_name}")))?;

        let chunks: Vec<std::io::Result<Bytes>> = (0..content.len())
            .step_by(self.chunk_size)
            .map(|start| {
                let end = (start + self.chunk_size).min(content.len());
                Ok(content.slice(start..end))
            })
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn upload_resource_stream(
        &self,
        bundle_id: &str,
        output_name: &str,
        metadata: Value,
        mut data: ByteStream,
        progress: ProgressCallback,
    ) -> Result<()> {
        self.check_bundle(bundle_id)?;
        validate_resource_name(output_name)?;

        let mut body = Vec::new();
        let mut reported = Vec::new();
        while let Some(chunk) = data.next().await {
            body.extend_from_slice(&chunk?);
            let uploaded = body.len() as u64;
            progress(uploaded);
            reported.push(uploaded);
        }

        self.recorded().uploads.push(UploadedResource {
            bundle_id: bundle_id.to_string(),
            output_name: output_name.to_string(),
            metadata,
            data: body,
            progress: reported,
        });
        Ok(())
    }

    async fn complete_bundle(&self, bundle_id: &str, completion_metadata: Value) -> Result<()> {
        self.check_bundle(bundle_id)?;
        self.recorded().completion = Some(completion_metadata);
        Ok(())
    }
}
