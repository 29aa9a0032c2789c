//! `tracing` subscriber setup for the `dp-parser` binary
//!
//! Events always go to the console. Setting `DP_LOG_DIR` adds a daily rolling
//! file (`dp-parser.<date>`) in that directory.
//!
//! Library code never installs a subscriber. Conversion runs receive a
//! [`tracing::Span`] from their caller and attach their events to it.
//!
//! # Example
//!
//! ```no_run
//! use dp_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> dp_common::Result<()> {
//!     let config = LogConfig::new(LogLevel::Info).merge_env()?;
//!     let _guard = init_logging(&config)?;
//!
//!     tracing::info!("RUN_STARTED");
//!     Ok(())
//! }
//! ```

use crate::error::{CommonError, Result};
use std::path::PathBuf;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const LOG_FILE_PREFIX: &str = "dp-parser";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(CommonError::InvalidLogSetting(format!("log level '{s}'"))),
        }
    }
}

/// Event encoding, shared by console and file output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(CommonError::InvalidLogSetting(format!("log format '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Also write a daily rolling file here
    pub log_dir: Option<PathBuf>,
    /// Extra `EnvFilter` directives, comma separated (e.g. `dp_parser::worker=debug`)
    pub filter: Option<String>,
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Apply `DP_LOG_LEVEL`, `DP_LOG_FORMAT`, `DP_LOG_DIR` and `DP_LOG_FILTER`
    ///
    /// Variables that are set win over the values already in `self`.
    pub fn merge_env(self) -> Result<Self> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(level) = var("DP_LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Some(format) = var("DP_LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = var("DP_LOG_DIR").filter(|dir| !dir.is_empty()) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(filter) = var("DP_LOG_FILTER") {
            self.filter = Some(filter);
        }
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter =
            EnvFilter::from_default_env().add_directive(self.level.to_tracing_level().into());
        for directive in self.filter.iter().flat_map(|list| list.split(',')) {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }
            let parsed: Directive = directive
                .parse()
                .map_err(|e| CommonError::InvalidLogSetting(format!("filter '{directive}': {e}")))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Keeps the non-blocking file writer alive; hold it until exit
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.env_filter()?;
    let console_layer = fmt_layer(config.format, std::io::stderr, true);

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt_layer(config.format, writer, false)), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| CommonError::LoggingInit(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn fmt_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(ansi);

    match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
