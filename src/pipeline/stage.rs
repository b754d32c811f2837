//! The stage abstraction and the shared context handed to stage constructors.

use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::config::ArrayConfig;
use crate::data::vis_chunk::VisChunk;
use crate::error::{IngestError, IngestResult};
use crate::monitoring::MonitoringStore;
use crate::stages::geometry::DelayCalculator;

/// One in-place transformation applied to every chunk.
///
/// Stages of one chunk run strictly in sequence; a stage may parallelise its
/// own per-row work internally. Any error is fatal to the pipeline.
pub trait Stage: Send {
    /// Registered type name, used for logging and monitoring point names.
    fn name(&self) -> &str;

    /// Transform `chunk` in place.
    fn process(&mut self, chunk: &mut VisChunk) -> IngestResult<()>;

    /// Stage types that must appear earlier in the stage list.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Read-only state shared by every stage of a run.
#[derive(Clone)]
pub struct StageContext {
    /// Array topology
    pub array: Arc<ArrayConfig>,
    /// Geometry capability object
    pub delays: Arc<DelayCalculator>,
    /// Telemetry table
    pub monitoring: Arc<MonitoringStore>,
}

impl StageContext {
    /// Build the context for an array, computing its geometry once.
    pub fn new(array: ArrayConfig, monitoring: Arc<MonitoringStore>) -> IngestResult<Self> {
        let delays = Arc::new(DelayCalculator::from_array(&array)?);
        Ok(Self {
            array: Arc::new(array),
            delays,
            monitoring,
        })
    }
}

/// Deserialize a stage's flattened parameter table into its typed parameters.
pub fn parse_params<T: DeserializeOwned>(stage: &str, params: &toml::Table) -> IngestResult<T> {
    toml::Value::Table(params.clone())
        .try_into()
        .map_err(|e| IngestError::Configuration(format!("Stage '{}': {}", stage, e)))
}
