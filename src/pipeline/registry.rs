//! Name → constructor registry for pipeline stages.
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StageConfig;
use crate::error::{IngestError, IngestResult};
use crate::pipeline::stage::{Stage, StageContext};
use crate::stages::averaging::ChannelAveragingStage;
use crate::stages::calibration::CalibrationStage;
use crate::stages::fringe::FringeRotationStage;
use crate::stages::geometry::GeometryStage;
use crate::stages::hw_delay::{HardwareDelayStage, LoggingDelayControl};

type StageFactory =
    Box<dyn Fn(&toml::Table, &StageContext) -> IngestResult<Box<dyn Stage>> + Send + Sync>;

/// Registry of stage constructors keyed by configuration type name.
///
/// # Examples
///
/// ```
/// use rust_ingest::pipeline::StageRegistry;
///
/// let registry = StageRegistry::new();
/// assert!(registry.contains("channel_averaging"));
/// assert!(!registry.contains("fft"));
/// ```
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    /// Registry holding every built-in stage.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(GeometryStage::NAME, |_, ctx| {
            Ok(Box::new(GeometryStage::new(Arc::clone(&ctx.delays))))
        });

        registry.register(FringeRotationStage::NAME, |params, ctx| {
            Ok(Box::new(FringeRotationStage::from_params(params, ctx)?))
        });

        registry.register(HardwareDelayStage::NAME, |params, ctx| {
            let stage =
                HardwareDelayStage::from_params(params, ctx, Box::new(LoggingDelayControl::default()))?;
            Ok(Box::new(stage))
        });

        registry.register(CalibrationStage::NAME, |params, ctx| {
            Ok(Box::new(CalibrationStage::from_params(params, ctx)?))
        });

        registry.register(ChannelAveragingStage::NAME, |params, _| {
            Ok(Box::new(ChannelAveragingStage::from_params(params)?))
        });

        registry
    }

    /// Registry with no stages.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&toml::Table, &StageContext) -> IngestResult<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Whether a type name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Sorted list of registered type names.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate one stage.
    pub fn create(&self, config: &StageConfig, ctx: &StageContext) -> IngestResult<Box<dyn Stage>> {
        let factory = self.factories.get(&config.r#type).ok_or_else(|| {
            IngestError::Configuration(format!(
                "Unknown stage type '{}'. Available: {}",
                config.r#type,
                self.list().join(", ")
            ))
        })?;
        factory(&config.params, ctx)
    }

    /// Instantiate the ordered stage list, checking that every stage's
    /// prerequisites run before it.
    pub fn build(
        &self,
        configs: &[StageConfig],
        ctx: &StageContext,
    ) -> IngestResult<Vec<Box<dyn Stage>>> {
        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(configs.len());
        for config in configs {
            let stage = self.create(config, ctx)?;
            for required in stage.requires() {
                if !stages.iter().any(|s| s.name() == *required) {
                    return Err(IngestError::Configuration(format!(
                        "Stage '{}' requires '{}' earlier in the stage list",
                        stage.name(),
                        required
                    )));
                }
            }
            stages.push(stage);
        }
        Ok(stages)
    }
}
