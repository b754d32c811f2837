//! # Rust Ingest Core Library
//!
//! Real-time ingest for a radio-telescope correlator. Once per integration
//! cycle the pipeline pairs a telescope metadata record with the visibility
//! frames of every correlator rank, runs the configured correction stages on
//! the merged chunk in place, and hands it to a sink.
//!
//! ## Crate Structure
//!
//! - **`astro`**: time scales, sidereal time and precession used by the geometry stage.
//! - **`config`**: typed configuration loaded with `figment`. See `config::IngestConfig`.
//! - **`data`**: the integration record (`VisChunk`), metadata records, wire frames and
//!   the drop-oldest `BoundedQueue`.
//! - **`error`**: the `IngestError` taxonomy shared by every module.
//! - **`ingest`**: metadata/visibility channels, their TCP receivers and the `StreamMerger`.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`mock`**: simulated metadata bus and correlator ranks.
//! - **`monitoring`**: the monitoring point table and its query service.
//! - **`pipeline`**: the `Stage` trait, the `StageRegistry` factory, sinks and `TaskPipeline`.
//! - **`stages`**: the built-in correction stages.

pub mod astro;
pub mod config;
pub mod data;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod mock;
pub mod monitoring;
pub mod pipeline;
pub mod stages;

pub use error::{IngestError, IngestResult};
