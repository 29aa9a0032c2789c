//! End-to-end tests for bundle conversion
//!
//! Each test drives `run_parser` against an in-memory or filesystem bus and
//! checks the uploaded JSONL and the completion marker.

use async_trait::async_trait;
use dp_parser::bus::{
    ByteStream, ChangeEvent, LocalBundleBus, MemoryBus, PipelineBus, ProgressCallback,
};
use dp_parser::config::ParserConfig;
use dp_parser::registry::default_registry;
use dp_parser::worker::{run_parser, run_span};
use dp_parser::{ParserError, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PARSERS_YAML: &str = r#"
concurrency: 2
config_id: companies
resource_parsers:
  'companies.*\.csv':
    csv:
      delimiter: ","
      coerce:
        employees: int
  'officers.*\.txt':
    fixed_width:
      field_specs:
        - {name: company_number, start: 1, length: 8}
        - {name: officer_name, start: 9, length: 12}
      ocid_generator:
        jurisdiction_code: gb
      schema_version: v1.0
"#;

fn parser_config(yaml: &str) -> Arc<ParserConfig> {
    let registry = default_registry().unwrap();
    Arc::new(ParserConfig::from_yaml_str(yaml, &registry).unwrap())
}

fn records(text: &str) -> Vec<Value> {
    text.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn companies_bus() -> MemoryBus {
    MemoryBus::new(ChangeEvent::new("bundle-1", "raw"))
        .with_metadata(json!({"source": "registry"}))
        .with_resource("companies_2024.csv", "name,employees,city\nAcme,12,NULL\nGlobex, 7 ,Paris\n")
        .with_resource(
            "officers_2024.txt",
            "00000001Jane Smith  \n00000002John Doe    \n",
        )
        .with_chunk_size(7)
}

#[tokio::test]
async fn test_converts_every_resource_and_completes_bundle() {
    let bus = Arc::new(companies_bus());

    let summary = run_parser(
        bus.clone() as Arc<dyn PipelineBus>,
        "local",
        parser_config(PARSERS_YAML),
        run_span("local"),
    )
    .await
    .unwrap();

    assert_eq!(summary.bundle_id, "bundle-1");
    assert_eq!(summary.stage, "raw");
    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.total_records(), 4);

    let companies = records(&bus.upload("companies_2024.csv.jsonl").unwrap().text());
    assert_eq!(
        companies,
        vec![
            json!({"name": "Acme", "employees": 12, "city": null, "oc:source_row": "2"}),
            json!({"name": "Globex", "employees": 7, "city": "Paris", "oc:source_row": "3"}),
        ]
    );

    let officers = records(&bus.upload("officers_2024.txt.jsonl").unwrap().text());
    assert_eq!(officers.len(), 2);
    assert_eq!(officers[0]["company_number"], "00000001");
    assert_eq!(officers[0]["officer_name"], "Jane Smith");
    assert_eq!(officers[0]["_schema_version"], "v1.0");
    assert_eq!(officers[0]["oc:source_row"], "1");
    assert_eq!(officers[1]["oc:source_row"], "2");

    let ocid = officers[0]["oc:ocid"].as_str().unwrap();
    assert!(ocid.starts_with("ocid:v1:co:"));
    assert_eq!(ocid.len(), "ocid:v1:co:".len() + 16);
    assert_ne!(officers[0]["oc:ocid"], officers[1]["oc:ocid"]);

    let completion = bus.completion().unwrap();
    assert!(completion["completed_at"].is_string());
}

#[tokio::test]
async fn test_first_matching_pattern_wins() {
    let yaml = r#"
resource_parsers:
  'data_special':
    csv:
      delimiter: "|"
  'data_.*':
    csv: {}
"#;
    let bus = Arc::new(
        MemoryBus::new(ChangeEvent::new("b", "raw"))
            .with_resource("data_special.csv", "a|b\n1|2\n")
            .with_resource("data_plain.csv", "a,b\n1,2\n"),
    );

    run_parser(bus.clone(), "local", parser_config(yaml), run_span("local"))
        .await
        .unwrap();

    let special = records(&bus.upload("data_special.csv.jsonl").unwrap().text());
    assert_eq!(special[0]["a"], "1");
    assert_eq!(special[0]["b"], "2");

    let plain = records(&bus.upload("data_plain.csv.jsonl").unwrap().text());
    assert_eq!(plain[0]["a"], "1");
    assert_eq!(plain[0]["b"], "2");
}

#[tokio::test]
async fn test_unmatched_resource_fails_run_without_completion() {
    let bus = Arc::new(
        MemoryBus::new(ChangeEvent::new("b", "raw"))
            .with_resource("companies.csv", "name\nAcme\n")
            .with_resource("unknown.bin", "\x00\x01"),
    );

    let err = run_parser(bus.clone(), "local", parser_config(PARSERS_YAML), run_span("local"))
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    match &err {
        ParserError::Worker { resource, source } => {
            assert_eq!(resource, "unknown.bin");
            assert!(source.to_string().contains("No parser found for resource: unknown.bin"));
        },
        other => panic!("expected worker error, got {other:?}"),
    }
    assert!(bus.completion().is_none());
}

#[tokio::test]
async fn test_fail_policy_stops_run() {
    let yaml = r#"
concurrency: 1
resource_parsers:
  '.*\.csv':
    csv:
      on_error: fail
      coerce:
        count: int
"#;
    let bus = Arc::new(
        MemoryBus::new(ChangeEvent::new("b", "raw"))
            .with_resource("a_bad.csv", "count\n1\nmany\n")
            .with_resource("b_good.csv", "count\n2\n"),
    );

    let err = run_parser(bus.clone(), "local", parser_config(yaml), run_span("local"))
        .await
        .unwrap_err();

    match err {
        ParserError::Worker { resource, source } => {
            assert_eq!(resource, "a_bad.csv");
            assert!(matches!(*source, ParserError::Record { row: 3, .. }));
        },
        other => panic!("expected worker error, got {other:?}"),
    }
    // A single worker never reaches the job queued after the failure
    assert!(bus.upload("b_good.csv.jsonl").is_none());
    assert!(bus.completion().is_none());
}

#[tokio::test]
async fn test_skip_policy_keeps_uncoercible_values() {
    let yaml = r#"
resource_parsers:
  '.*':
    csv:
      coerce:
        count: int
"#;
    let bus = Arc::new(
        MemoryBus::new(ChangeEvent::new("b", "raw"))
            .with_resource("counts.csv", "count\n1\nmany\n3\n"),
    );

    let summary = run_parser(bus.clone(), "local", parser_config(yaml), run_span("local"))
        .await
        .unwrap();

    let rows = records(&bus.upload("counts.csv.jsonl").unwrap().text());
    assert_eq!(summary.total_records(), 3);
    assert_eq!(rows[0]["count"], 1);
    assert_eq!(rows[1]["count"], "many");
    assert_eq!(rows[2]["count"], 3);
}

#[tokio::test]
async fn test_empty_bundle_is_an_error() {
    let bus = Arc::new(MemoryBus::new(ChangeEvent::new("b", "raw")));

    let err = run_parser(bus.clone(), "local", parser_config(PARSERS_YAML), run_span("local"))
        .await
        .unwrap_err();

    assert!(matches!(err, ParserError::Bundle(_)));
    assert!(bus.completion().is_none());
}

#[tokio::test]
async fn test_more_workers_than_resources() {
    let registry = default_registry().unwrap();
    let config = ParserConfig::from_yaml_str(PARSERS_YAML, &registry)
        .unwrap()
        .with_concurrency(16)
        .unwrap();
    let bus = Arc::new(companies_bus());

    let summary = run_parser(bus.clone(), "local", Arc::new(config), run_span("local"))
        .await
        .unwrap();

    assert_eq!(summary.outcomes.len(), 2);
    assert!(bus.completion().is_some());
}

#[tokio::test]
async fn test_many_resources_with_small_pool() {
    let yaml = "concurrency: 3\nresource_parsers:\n  'part_':\n    csv: {}\n";
    let mut bus = MemoryBus::new(ChangeEvent::new("b", "raw"));
    for i in 0..20 {
        bus = bus.with_resource(format!("part_{i:02}.csv"), format!("id\n{i}\n"));
    }
    let bus = Arc::new(bus);

    let summary = run_parser(bus.clone(), "local", parser_config(yaml), run_span("local"))
        .await
        .unwrap();

    assert_eq!(summary.outcomes.len(), 20);
    assert_eq!(summary.total_records(), 20);
    assert_eq!(bus.uploads().len(), 20);
}

/// Counts resources between open and upload, holding each open briefly
struct CountingBus {
    inner: MemoryBus,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl PipelineBus for CountingBus {
    async fn get_change_event(&self) -> Result<ChangeEvent> {
        self.inner.get_change_event().await
    }

    async fn get_bundle_metadata(&self, bundle_id: &str, stage: &str) -> Result<Value> {
        self.inner.get_bundle_metadata(bundle_id, stage).await
    }

    async fn get_bundle_resource_list(&self, bundle_id: &str) -> Result<Vec<String>> {
        self.inner.get_bundle_resource_list(bundle_id).await
    }

    async fn open_resource_stream(&self, bundle_id: &str, resource_name: &str) -> Result<ByteStream> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.open_resource_stream(bundle_id, resource_name).await
    }

    async fn upload_resource_stream(
        &self,
        bundle_id: &str,
        output_name: &str,
        metadata: Value,
        data: ByteStream,
        progress: ProgressCallback,
    ) -> Result<()> {
        let uploaded = self
            .inner
            .upload_resource_stream(bundle_id, output_name, metadata, data, progress)
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        uploaded
    }

    async fn complete_bundle(&self, bundle_id: &str, completion_metadata: Value) -> Result<()> {
        self.inner.complete_bundle(bundle_id, completion_metadata).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_never_exceeds_concurrency() {
    let yaml = "concurrency: 3\nresource_parsers:\n  'part_':\n    csv: {}\n";
    let mut inner = MemoryBus::new(ChangeEvent::new("b", "raw"));
    for i in 0..12 {
        inner = inner.with_resource(format!("part_{i:02}.csv"), format!("id\n{i}\n"));
    }
    let bus = Arc::new(CountingBus {
        inner,
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let summary = run_parser(bus.clone(), "local", parser_config(yaml), run_span("local"))
        .await
        .unwrap();

    assert_eq!(summary.outcomes.len(), 12);
    assert_eq!(bus.peak.load(Ordering::SeqCst), 3);
    assert_eq!(bus.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(bus.inner.uploads().len(), 12);
    assert!(bus.inner.completion().is_some());
}

#[tokio::test]
async fn test_reparse_produces_identical_output() {
    let config = parser_config(PARSERS_YAML);

    let first = Arc::new(companies_bus());
    run_parser(first.clone(), "local", Arc::clone(&config), run_span("local"))
        .await
        .unwrap();
    let second = Arc::new(companies_bus());
    run_parser(second.clone(), "local", config, run_span("local"))
        .await
        .unwrap();

    for name in ["companies_2024.csv.jsonl", "officers_2024.txt.jsonl"] {
        assert_eq!(first.upload(name).unwrap().data, second.upload(name).unwrap().data);
    }
}

#[tokio::test]
async fn test_local_bus_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let raw = root.path().join("bundle-1").join("raw");
    std::fs::create_dir_all(&raw).unwrap();
    std::fs::write(
        root.path().join("bundle-1").join("bundle.json"),
        r#"{"source": "registry"}"#,
    )
    .unwrap();
    std::fs::write(raw.join("companies.csv"), "name,employees\nAcme,12\n").unwrap();

    let bus = LocalBundleBus::new(root.path(), ChangeEvent::new("bundle-1", "raw"));
    let summary = run_parser(
        Arc::new(bus.clone()),
        "local",
        parser_config(PARSERS_YAML),
        run_span("local"),
    )
    .await
    .unwrap();
    assert_eq!(summary.total_records(), 1);

    let output = bus.output_path("bundle-1", "companies.csv.jsonl").unwrap();
    let text = std::fs::read_to_string(&output).unwrap();
    assert_eq!(
        records(&text),
        vec![json!({"name": "Acme", "employees": 12, "oc:source_row": "2"})]
    );

    let sidecar: Value = serde_json::from_str(
        &std::fs::read_to_string(output.with_file_name("companies.csv.jsonl.meta.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar["source_resource"], "companies.csv");
    assert_eq!(sidecar["bytes"], text.len() as u64);
    assert_eq!(
        sidecar["sha256"],
        dp_common::digest::sha256_hex(text.as_bytes())
    );

    assert!(root.path().join("bundle-1").join("_COMPLETED.json").is_file());
}
