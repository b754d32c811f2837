//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `RUST_INGEST_`, `__` separating levels)
//!
//! # Example
//! ```no_run
//! use rust_ingest::config::IngestConfig;
//!
//! let config = IngestConfig::load_from("config/ingest.toml")?;
//! config.validate()?;
//! println!("Array: {}", config.array.name);
//! # Ok::<(), rust_ingest::error::IngestError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::data::vis_chunk::Polarisation;
use crate::error::{IngestError, IngestResult};

/// Top-level ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Pipeline loop settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Metadata bus subscription
    pub metadata: MetadataConfig,
    /// Visibility stream, one entry per correlator rank
    pub visibility: VisibilityConfig,
    /// Array topology
    pub array: ArrayConfig,
    /// Ordered stage list
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// Monitoring query service
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Pipeline loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stop after this many integrations (run until aborted when absent)
    #[serde(default)]
    pub max_integrations: Option<u64>,
    /// Metadata wait per cycle in milliseconds (0 = block indefinitely)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Per-rank visibility wait once metadata arrived (0 = unbounded)
    #[serde(default)]
    pub frame_timeout_ms: u64,
    /// Maximum accepted metadata/visibility timestamp disagreement
    #[serde(default)]
    pub timestamp_tolerance_us: u64,
}

/// Metadata bus subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Bus address (host:port)
    #[serde(default = "default_metadata_address")]
    pub address: String,
    /// Topic to subscribe to
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Number of records buffered before the oldest is dropped
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Visibility stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityConfig {
    /// One entry per correlator rank, in channel order
    pub ranks: Vec<RankConfig>,
}

/// One correlator rank's point-to-point stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankConfig {
    /// Socket address the rank streams from (host:port)
    #[serde(default)]
    pub address: String,
    /// Number of spectral channels this rank contributes
    pub channels: usize,
    /// Number of frames buffered before the oldest is dropped
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Antenna mount type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MountType {
    /// Polar-axis mount
    Equatorial,
    /// Azimuth/elevation mount
    AltAz,
    /// Azimuth/elevation mount with a third polarisation axis
    RollAxis,
}

/// One antenna of the array
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntennaConfig {
    /// Antenna label, used in hardware commands and monitoring point names
    pub name: String,
    /// ITRF position in metres
    pub position: [f64; 3],
    /// Mount type
    #[serde(default = "default_mount")]
    pub mount: MountType,
}

/// Array topology, read-only for the lifetime of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Array name
    pub name: String,
    /// Antennas in index order
    pub antennas: Vec<AntennaConfig>,
    /// Number of beams formed by each antenna
    #[serde(default = "default_beams")]
    pub n_beams: usize,
    /// Polarisation products carried by every row
    #[serde(default = "default_polarisations")]
    pub polarisations: Vec<String>,
    /// Whether autocorrelation rows are part of the layout
    #[serde(default = "default_true")]
    pub include_autocorrelations: bool,
}

/// One entry of the ordered stage list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Registered stage type name
    pub r#type: String,
    /// Stage-specific parameters
    #[serde(flatten)]
    pub params: toml::Table,
}

/// Monitoring query service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Listen address; service disabled when absent
    #[serde(default)]
    pub address: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_timeout() -> u64 {
    1000
}

fn default_metadata_address() -> String {
    "127.0.0.1:4061".to_string()
}

fn default_topic() -> String {
    "metadata".to_string()
}

fn default_buffer_size() -> usize {
    12
}

fn default_mount() -> MountType {
    MountType::AltAz
}

fn default_beams() -> usize {
    1
}

fn default_polarisations() -> Vec<String> {
    vec!["XX".into(), "XY".into(), "YX".into(), "YY".into()]
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_integrations: None,
            poll_timeout_ms: default_poll_timeout(),
            frame_timeout_ms: 0,
            timestamp_tolerance_us: 0,
        }
    }
}

impl PipelineConfig {
    /// Metadata wait, `None` meaning block indefinitely.
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Duration> {
        (self.poll_timeout_ms > 0).then(|| Duration::from_millis(self.poll_timeout_ms))
    }

    /// Visibility wait, `None` meaning unbounded.
    #[must_use]
    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_ms > 0).then(|| Duration::from_millis(self.frame_timeout_ms))
    }
}

impl ArrayConfig {
    /// Parsed polarisation products, in configured order.
    pub fn polarisation_products(&self) -> IngestResult<Vec<Polarisation>> {
        self.polarisations
            .iter()
            .map(|p| p.parse::<Polarisation>())
            .collect()
    }

    /// Antenna positions in index order.
    #[must_use]
    pub fn positions(&self) -> Vec<[f64; 3]> {
        self.antennas.iter().map(|a| a.position).collect()
    }

    /// Index of an antenna by label.
    #[must_use]
    pub fn antenna_index(&self, name: &str) -> Option<usize> {
        self.antennas.iter().position(|a| a.name == name)
    }
}

impl VisibilityConfig {
    /// Total channel count across all ranks.
    #[must_use]
    pub fn total_channels(&self) -> usize {
        self.ranks.iter().map(|r| r.channels).sum()
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file and `RUST_INGEST_` environment variables
    ///
    /// Example override: `RUST_INGEST_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> IngestResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_INGEST_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document (no environment merge)
    pub fn from_toml_str(document: &str) -> IngestResult<Self> {
        let config = Figment::new().merge(Toml::string(document)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> IngestResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(IngestError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(IngestError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.array.antennas.is_empty() {
            return Err(IngestError::Configuration(
                "Array must define at least one antenna".into(),
            ));
        }

        let mut names = HashSet::new();
        for antenna in &self.array.antennas {
            if !names.insert(&antenna.name) {
                return Err(IngestError::Configuration(format!(
                    "Duplicate antenna name: {}",
                    antenna.name
                )));
            }
        }

        if self.array.n_beams == 0 {
            return Err(IngestError::Configuration("n_beams must be at least 1".into()));
        }

        let products = self.array.polarisation_products()?;
        if products.is_empty() {
            return Err(IngestError::Configuration(
                "At least one polarisation product is required".into(),
            ));
        }
        let unique: HashSet<_> = products.iter().collect();
        if unique.len() != products.len() {
            return Err(IngestError::Configuration(
                "Duplicate polarisation products".into(),
            ));
        }

        if !self.array.include_autocorrelations && self.array.antennas.len() < 2 {
            return Err(IngestError::Configuration(
                "Cross-correlation only layout needs at least two antennas".into(),
            ));
        }

        if self.visibility.ranks.is_empty() {
            return Err(IngestError::Configuration(
                "At least one visibility rank is required".into(),
            ));
        }
        for (rank, cfg) in self.visibility.ranks.iter().enumerate() {
            if cfg.channels == 0 {
                return Err(IngestError::Configuration(format!(
                    "Rank {} contributes zero channels",
                    rank
                )));
            }
            if cfg.buffer_size == 0 {
                return Err(IngestError::Configuration(format!(
                    "Rank {} has a zero buffer size",
                    rank
                )));
            }
        }

        if self.metadata.buffer_size == 0 {
            return Err(IngestError::Configuration(
                "Metadata buffer size must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
