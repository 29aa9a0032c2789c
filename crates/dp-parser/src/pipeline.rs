//! Per-resource conversion pipeline
//!
//! open resource -> decode lines -> parse stream -> JSONL buffer -> upload

use bytes::Bytes;
use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::bus::{ByteStream, PipelineBus, ProgressCallback};
use crate::decode::decode_lines;
use crate::emitter::JsonlEmitter;
use crate::error::Result;
use crate::strategy::ResourceParser;

/// Suffix appended to a resource name to form its output name
pub const OUTPUT_SUFFIX: &str = ".jsonl";

/// Output name for a converted resource
pub fn output_name(resource_name: &str) -> String {
    format!("{resource_name}{OUTPUT_SUFFIX}")
}

/// Result of converting one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionOutcome {
    pub resource_name: String,
    pub output_name: String,
    pub records: u64,
    pub bytes: u64,
}

/// Convert one resource of a bundle and upload the JSONL output
#[instrument(skip(bus, parser), fields(strategy = parser.strategy_name()))]
pub async fn convert_resource(
    bus: &dyn PipelineBus,
    bundle_id: &str,
    resource_name: &str,
    parser: &ResourceParser,
) -> Result<ConversionOutcome> {
    let source = bus.open_resource_stream(bundle_id, resource_name).await?;
    let lines = decode_lines(source);

    let mut emitter = JsonlEmitter::new(Vec::new());
    let mut records = 0;
    {
        let progress = parser.parse_stream(lines, &mut emitter);
        futures::pin_mut!(progress);
        while let Some(count) = progress.try_next().await? {
            records = count;
            info!(resource = %resource_name, records = count, "PROGRESS");
        }
    }

    let body = emitter.into_inner()?;
    let bytes = body.len() as u64;
    let output_name = output_name(resource_name);
    let metadata = json!({
        "source_resource": resource_name,
        "parsed_at": Utc::now().to_rfc3339(),
    });

    let data: ByteStream = stream::once(async move { Ok(Bytes::from(body)) }).boxed();
    let resource = resource_name.to_string();
    let on_progress: ProgressCallback = Box::new(move |uploaded| {
        info!(resource = %resource, bytes_uploaded = uploaded, "UPLOAD_PROGRESS");
    });
    bus.upload_resource_stream(bundle_id, &output_name, metadata, data, on_progress)
        .await?;

    Ok(ConversionOutcome {
        resource_name: resource_name.to_string(),
        output_name,
        records,
        bytes,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::{ChangeEvent, MemoryBus};
    use crate::registry::{default_registry, ResourceParserCapability};
    use serde_json::Value;

    fn csv_parser(params: Value) -> ResourceParser {
        default_registry()
            .unwrap()
            .create(ResourceParserCapability, "csv", &params)
            .unwrap()
    }

    #[tokio::test]
    async fn test_convert_resource_uploads_jsonl() {
        let bus = MemoryBus::new(ChangeEvent::new("b", "raw"))
            .with_resource("test.csv", "name,age\nJohn,30\nJane,25\n")
            .with_chunk_size(5);
        let parser = csv_parser(json!({"coerce": {"age": "int"}}));

        let outcome = convert_resource(&bus, "b", "test.csv", &parser).await.unwrap();
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.output_name, "test.csv.jsonl");

        let upload = bus.upload("test.csv.jsonl").unwrap();
        assert_eq!(outcome.bytes, upload.data.len() as u64);
        assert_eq!(
            upload.text(),
            "{\"name\":\"John\",\"age\":30,\"oc:source_row\":\"2\"}\n\
             {\"name\":\"Jane\",\"age\":25,\"oc:source_row\":\"3\"}\n"
        );
        assert_eq!(upload.metadata["source_resource"], "test.csv");
        assert!(upload.metadata["parsed_at"].is_string());
        assert_eq!(upload.progress.last().copied(), Some(outcome.bytes));
    }

    #[tokio::test]
    async fn test_split_multibyte_input_converts_intact() {
        let bus = MemoryBus::new(ChangeEvent::new("b", "raw"))
            .with_resource("cities.csv", "city\nSão Paulo\nZürich\n")
            .with_chunk_size(1);
        let parser = csv_parser(json!({}));

        convert_resource(&bus, "b", "cities.csv", &parser).await.unwrap();
        let text = bus.upload("cities.csv.jsonl").unwrap().text();
        assert!(text.contains("São Paulo"));
        assert!(text.contains("Zürich"));
        assert!(!text.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn test_empty_resource_uploads_empty_output() {
        let bus = MemoryBus::new(ChangeEvent::new("b", "raw")).with_resource("empty.csv", "");
        let parser = csv_parser(json!({}));

        let outcome = convert_resource(&bus, "b", "empty.csv", &parser).await.unwrap();
        assert_eq!(outcome.records, 0);
        assert!(bus.upload("empty.csv.jsonl").unwrap().data.is_empty());
    }
}
