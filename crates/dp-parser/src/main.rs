//! Data Parser - flat-file to JSONL conversion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dp_common::logging::{init_logging, LogConfig, LogLevel};
use dp_parser::bus::{ChangeEvent, LocalBundleBus};
use dp_parser::config::{AppConfig, ParserConfig};
use dp_parser::pipeline::output_name;
use dp_parser::registry::{default_registry, StrategyRegistry};
use dp_parser::worker::{run_parser, run_span};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dp-parser")]
#[command(author, version, about = "Convert delimited and fixed-width resources to JSONL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every resource of a bundle on the local bus
    Run {
        /// Parser configuration (YAML or JSON)
        #[arg(short, long, env = "DP_PARSER_CONFIG")]
        config: PathBuf,

        /// Bundle to convert
        #[arg(short, long)]
        bundle_id: String,

        /// Stage to read resources from (default: DP_STAGE or "raw")
        #[arg(long)]
        stage: Option<String>,

        /// Bus root directory (default: DP_BUS_ROOT or "./bundles")
        #[arg(long)]
        bus_root: Option<PathBuf>,

        /// Worker count, overriding the configuration
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Validate a parser configuration without converting anything
    Validate {
        /// Parser configuration (YAML or JSON)
        config: PathBuf,
    },

    /// Convert local files, writing `<name>.jsonl` into the output directory
    Convert {
        /// Parser configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Files to convert
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::new(log_level).merge_env()?;

    let _guard = init_logging(&log_config)?;

    let app_config = AppConfig::load().context("Failed to load application settings")?;
    let registry = default_registry()?;

    match cli.command {
        Command::Run {
            config,
            bundle_id,
            stage,
            bus_root,
            concurrency,
        } => {
            let mut parser_config = load_parser_config(&config, &registry)?;
            if let Some(concurrency) = concurrency.or(app_config.concurrency) {
                parser_config = parser_config.with_concurrency(concurrency)?;
            }

            let stage = stage.unwrap_or(app_config.stage);
            let bus_root = bus_root.unwrap_or(app_config.bus_root);
            let bus = LocalBundleBus::new(bus_root, ChangeEvent::new(bundle_id, stage));

            let summary = run_parser(
                Arc::new(bus),
                &app_config.data_registry_id,
                Arc::new(parser_config),
                run_span(&app_config.data_registry_id),
            )
            .await?;

            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::Validate { config } => {
            let parser_config = load_parser_config(&config, &registry)?;
            for route in parser_config.routes() {
                println!("{} -> {}", route.pattern(), route.strategy_name());
            }
            println!(
                "{} is valid ({} patterns, concurrency {})",
                config.display(),
                parser_config.routes().len(),
                parser_config.concurrency()
            );
        },
        Command::Convert {
            config,
            output_dir,
            inputs,
        } => {
            let parser_config = load_parser_config(&config, &registry)?;
            convert_files(&parser_config, &output_dir, &inputs)?;
        },
    }

    Ok(())
}

fn load_parser_config(path: &Path, registry: &StrategyRegistry) -> Result<ParserConfig> {
    ParserConfig::load(path, registry)
        .with_context(|| format!("Invalid parser configuration {}", path.display()))
}

fn convert_files(config: &ParserConfig, output_dir: &Path, inputs: &[PathBuf]) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let progress = ProgressBar::new(inputs.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    for input in inputs {
        let name = input
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("Input has no usable file name: {}", input.display()))?;
        progress.set_message(name.to_string());

        let route = config.resolve(name)?;
        let output_path = output_dir.join(output_name(name));
        let sink = BufWriter::new(
            File::create(&output_path)
                .with_context(|| format!("Failed to create {}", output_path.display()))?,
        );
        let records = route
            .parser()
            .parse(input, sink)
            .with_context(|| format!("Failed to convert {}", input.display()))?;

        info!(resource = %name, records, output = %output_path.display(), "RESOURCE_COMPLETED");
        progress.inc(1);
    }

    progress.finish_with_message("done");
    Ok(())
}
