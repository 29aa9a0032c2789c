//! Filesystem-backed pipeline bus
//!
//! Layout under the bus root:
//!
//! ```text
//! <root>/<bundle_id>/bundle.json              optional bundle metadata
//! <root>/<bundle_id>/<stage>/<resource>       input resources
//! <root>/<bundle_id>/parsed/<output>          converted outputs
//! <root>/<bundle_id>/parsed/<output>.meta.json
//! <root>/<bundle_id>/_COMPLETED.json          written on completion
//! ```

use async_trait::async_trait;
use dp_common::digest::compute_checksum;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

use super::{validate_resource_name, ByteStream, ChangeEvent, PipelineBus, ProgressCallback};
use crate::error::{ParserError, Result};

/// Directory receiving converted outputs
pub const PARSED_DIR: &str = "parsed";

/// Optional bundle metadata document
pub const BUNDLE_METADATA_FILE: &str = "bundle.json";

/// Completion marker
pub const COMPLETED_FILE: &str = "_COMPLETED.json";

/// Suffix of the sidecar written next to each output
pub const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone)]
pub struct LocalBundleBus {
    root: PathBuf,
    event: ChangeEvent,
}

impl LocalBundleBus {
    pub fn new(root: impl Into<PathBuf>, event: ChangeEvent) -> Self {
        Self {
            root: root.into(),
            event,
        }
    }

    fn bundle_dir(&self, bundle_id: &str) -> Result<PathBuf> {
        validate_resource_name(bundle_id)?;
        Ok(self.root.join(bundle_id))
    }

    fn stage_dir(&self, bundle_id: &str) -> Result<PathBuf> {
        Ok(self.bundle_dir(bundle_id)?.join(&self.event.stage))
    }

    /// Where an output named `output_name` is written
    pub fn output_path(&self, bundle_id: &str, output_name: &str) -> Result<PathBuf> {
        validate_resource_name(output_name)?;
        Ok(self.bundle_dir(bundle_id)?.join(PARSED_DIR).join(output_name))
    }

    async fn write_json(path: &Path, value: &Value) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl PipelineBus for LocalBundleBus {
    async fn get_change_event(&self) -> Result<ChangeEvent> {
        Ok(self.event.clone())
    }

    #[instrument(skip(self))]
    async fn get_bundle_metadata(&self, bundle_id: &str, stage: &str) -> Result<Value> {
        let path = self.bundle_dir(bundle_id)?.join(BUNDLE_METADATA_FILE);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(serde_json::from_slice(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No bundle metadata at {}", path.display());
                Ok(json!({}))
            },
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn get_bundle_resource_list(&self, bundle_id: &str) -> Result<Vec<String>> {
        let dir = self.stage_dir(bundle_id)?;
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            ParserError::Bus(format!("Cannot list resources in {}: {e}", dir.display()))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => debug!("Skipping non UTF-8 resource name {:?}", name),
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn open_resource_stream(&self, bundle_id: &str, resource_name: &str) -> Result<ByteStream> {
        validate_resource_name(resource_name)?;
        let path = self.stage_dir(bundle_id)?.join(resource_name);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            ParserError::Bus(format!("Cannot open resource {}: {e}", path.display()))
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    #[instrument(skip(self, metadata, data, progress))]
    async fn upload_resource_stream(
        &self,
        bundle_id: &str,
        output_name: &str,
        metadata: Value,
        mut data: ByteStream,
        progress: ProgressCallback,
    ) -> Result<()> {
        let path = self.output_path(bundle_id, output_name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let mut uploaded = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            uploaded += chunk.len() as u64;
            progress(uploaded);
        }
        file.flush().await?;
        drop(file);

        let checksum_path = path.clone();
        let sha256 = tokio::task::spawn_blocking(move || -> Result<String> {
            let mut file = std::fs::File::open(&checksum_path)?;
            Ok(compute_checksum(&mut file)?)
        })
        .await??;

        let mut sidecar = match metadata {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("metadata".to_string(), other);
                map
            },
        };
        sidecar.insert("bytes".to_string(), json!(uploaded));
        sidecar.insert("sha256".to_string(), json!(sha256));

        let sidecar_path = path.with_file_name(format!("{output_name}{SIDECAR_SUFFIX}"));
        Self::write_json(&sidecar_path, &Value::Object(sidecar)).await?;

        info!("Wrote {} bytes to {}", uploaded, path.display());
        Ok(())
    }

    #[instrument(skip(self, completion_metadata))]
    async fn complete_bundle(&self, bundle_id: &str, completion_metadata: Value) -> Result<()> {
        let dir = self.bundle_dir(bundle_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Self::write_json(&dir.join(COMPLETED_FILE), &completion_metadata).await?;
        info!("Marked bundle {} complete", bundle_id);
        Ok(())
    }
}
