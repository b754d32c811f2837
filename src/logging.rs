//! Tracing Infrastructure
//!
//! Structured logging for the ingest process, built on `tracing` and
//! `tracing-subscriber`:
//! - one `cycle` span per integration, carrying `cycle` and `timestamp_us`
//! - pretty, compact or JSON output
//! - `RUST_LOG` overrides the configured level
//!
//! Receiver threads log every frame at `trace`. The default filter caps them at
//! `debug`, so `log_level = "trace"` traces the pipeline without per-frame
//! events; set `RUST_LOG` to see those.
//!
//! # Example
//! ```no_run
//! use rust_ingest::{config::IngestConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IngestConfig::load_from("config/ingest.toml")?;
//! logging::init_from_config(&config)?;
//! info!(array = %config.array.name, "Ingest starting");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};

/// Module whose per-frame events are capped below `trace`.
const RECEIVER_TARGET: &str = "rust_ingest::ingest";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colours, for operators at a terminal
    Pretty,
    /// Single line without colours
    Compact,
    /// One JSON object per event, for log aggregation
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Maximum level
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span close events, which carry per-cycle busy/idle time
    pub with_span_events: bool,
    /// Include thread names (`metadata-rx`, `vis-rx-N`, ...)
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_thread_names: true,
        }
    }
}

impl LoggingConfig {
    /// Settings from the `[application]` section. Cycle span timing is enabled
    /// at `debug` and `trace`.
    pub fn from_ingest_config(config: &IngestConfig) -> IngestResult<Self> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self {
            level,
            format: parse_format(&config.application.log_format)?,
            with_span_events: matches!(level, Level::DEBUG | Level::TRACE),
            ..Default::default()
        })
    }

    /// Settings at a given level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span close events
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Filter used when `RUST_LOG` is unset.
    fn default_filter(&self) -> String {
        let level = self.level.as_str().to_lowercase();
        if self.level == Level::TRACE {
            format!("{},{}=debug", level, RECEIVER_TARGET)
        } else {
            level
        }
    }
}

/// Initialize tracing from the ingest configuration.
pub fn init_from_config(config: &IngestConfig) -> IngestResult<()> {
    init(LoggingConfig::from_ingest_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already installed this returns `Ok(())`.
pub fn init(config: LoggingConfig) -> IngestResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let span_events = if config.with_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Already initialized is expected in tests
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(IngestError::Configuration(format!(
                    "Failed to initialize tracing: {}",
                    e
                )))
            }
        })
}

fn parse_log_level(level: &str) -> IngestResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(IngestError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

fn parse_format(format: &str) -> IngestResult<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(IngestError::Configuration(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        ))),
    }
}
