//! Custom error types for the ingest pipeline.
//!
//! This module defines the primary error type, `IngestError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure that can occur while merging correlator streams and
//! correcting visibilities.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically syntax or type errors in the
//!   configuration file or environment overrides.
//! - **`Configuration`**: Semantic configuration errors: a bad stage list, an averaging
//!   factor that does not divide the channel count, an unsupported polarisation set.
//!   Fatal at startup or on first use.
//! - **`DataIntegrity`**: The data itself cannot be trusted: a singular calibration
//!   matrix, metadata/visibility timestamps that disagree, malformed cube dimensions.
//!   Fatal; the pipeline never repairs or skips a corrupted chunk.
//! - **`Transport`**: Subscription or connection failures. Retried with backoff at the
//!   channel boundary; reaches the pipeline only once a receiver gives up.
//! - **`Codec`**: A received frame or message could not be decoded.
//! - **`Io`** / **`Serialization`**: Wrapped `std::io::Error` and `serde_json::Error`.
//!
//! A queue pop that times out is *not* an error; it is represented as `None`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Primary error type for the ingest pipeline.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Received or computed data is inconsistent and cannot be processed.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Connection or subscription failure on an input channel.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A wire message could not be decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    /// Short category label used in logs and monitoring points.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            IngestError::Config(_) | IngestError::Configuration(_) => "configuration",
            IngestError::DataIntegrity(_) | IngestError::Codec(_) => "data_integrity",
            IngestError::Transport(_) | IngestError::Io(_) => "transport",
            IngestError::Serialization(_) => "serialization",
        }
    }
}

impl From<toml::de::Error> for IngestError {
    fn from(value: toml::de::Error) -> Self {
        IngestError::Configuration(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_group_related_variants() {
        assert_eq!(
            IngestError::Codec("bad".into()).category(),
            IngestError::DataIntegrity("bad".into()).category()
        );
        assert_eq!(IngestError::Configuration("x".into()).category(), "configuration");
    }

    #[test]
    fn toml_errors_become_configuration_errors() {
        let err: IngestError = toml::from_str::<toml::Value>("a = = 1").unwrap_err().into();
        match err {
            IngestError::Configuration(msg) => assert!(!msg.is_empty()),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
