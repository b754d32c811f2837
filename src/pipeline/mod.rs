//! The ingest task pipeline.
//!
//! ```text
//! StreamMerger::next() ──> stage 1 ──> stage 2 ──> ... ──> Sink::consume()
//! ```
//!
//! One thread drives the loop. The abort flag is checked between cycles only,
//! so shutdown latency is bounded by the merger's poll timeout.
pub mod registry;
pub mod sink;
pub mod stage;

pub use registry::StageRegistry;
pub use sink::{ChannelSink, LoggingSink, Sink};
pub use stage::{parse_params, Stage, StageContext};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span};

use crate::config::IngestConfig;
use crate::data::vis_chunk::VisChunk;
use crate::error::{IngestError, IngestResult};
use crate::ingest::StreamMerger;
use crate::monitoring::{MonitoringStore, PointStatus};

/// Totals reported when the pipeline stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Chunks processed and handed to the sink
    pub cycles: u64,
    /// Merger polls that timed out without metadata
    pub empty_polls: u64,
}

/// Drives merger → stages → sink until aborted or the integration limit is
/// reached.
pub struct TaskPipeline {
    merger: StreamMerger,
    stages: Vec<Box<dyn Stage>>,
    sink: Box<dyn Sink>,
    monitoring: Arc<MonitoringStore>,
    max_integrations: Option<u64>,
    abort: Arc<AtomicBool>,
}

impl TaskPipeline {
    /// Assemble a pipeline from already constructed parts.
    pub fn new(
        merger: StreamMerger,
        stages: Vec<Box<dyn Stage>>,
        sink: Box<dyn Sink>,
        monitoring: Arc<MonitoringStore>,
        max_integrations: Option<u64>,
    ) -> Self {
        Self {
            merger,
            stages,
            sink,
            monitoring,
            max_integrations,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Instantiate the configured stage list through `registry`.
    pub fn from_config(
        config: &IngestConfig,
        registry: &StageRegistry,
        ctx: &StageContext,
        merger: StreamMerger,
        sink: Box<dyn Sink>,
    ) -> IngestResult<Self> {
        let stages = registry.build(&config.stages, ctx)?;
        info!(
            stages = ?stages.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            max_integrations = ?config.pipeline.max_integrations,
            "Pipeline constructed"
        );
        Ok(Self::new(
            merger,
            stages,
            sink,
            Arc::clone(&ctx.monitoring),
            config.pipeline.max_integrations,
        ))
    }

    /// Share an externally owned abort flag.
    #[must_use]
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Flag that stops the loop at the next cycle boundary when set.
    #[must_use]
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Configured stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run until aborted, the integration limit is reached, or a fatal error.
    pub fn run(&mut self) -> IngestResult<PipelineStats> {
        let mut stats = PipelineStats::default();
        info!(stages = self.stages.len(), "Pipeline running");

        loop {
            if self.abort.load(Ordering::SeqCst) {
                info!(cycles = stats.cycles, "Abort requested, stopping pipeline");
                break;
            }
            if self.max_integrations.is_some_and(|max| stats.cycles >= max) {
                info!(cycles = stats.cycles, "Integration limit reached");
                break;
            }

            let chunk = match self.merger.next() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    stats.empty_polls += 1;
                    continue;
                }
                Err(e) => return Err(self.fail("merger", e)),
            };

            let cycle = stats.cycles + 1;
            self.process_cycle(cycle, chunk)?;
            stats.cycles = cycle;
        }

        Ok(stats)
    }

    fn process_cycle(&mut self, cycle: u64, mut chunk: VisChunk) -> IngestResult<()> {
        let span = info_span!("cycle", cycle, timestamp_us = chunk.timestamp);
        let _enter = span.enter();

        for i in 0..self.stages.len() {
            let start = Instant::now();
            if let Err(e) = self.stages[i].process(&mut chunk) {
                let name = self.stages[i].name().to_string();
                return Err(self.fail(&name, e));
            }
            let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
            let name = self.stages[i].name();
            debug!(stage = name, elapsed_ms, "Stage complete");
            self.monitoring.update(
                format!("ingest.stage.{}.duration_ms", name),
                elapsed_ms,
                PointStatus::Ok,
                "ms",
            );
        }

        let timestamp = chunk.timestamp;
        let flagged = chunk.flagged_fraction();
        if let Err(e) = self.sink.consume(chunk) {
            return Err(self.fail("sink", e));
        }

        self.monitoring
            .update("ingest.cycles", cycle as i64, PointStatus::Ok, "");
        self.monitoring.update(
            "ingest.last_timestamp_us",
            timestamp as i64,
            PointStatus::Ok,
            "us",
        );
        self.monitoring
            .update("ingest.flagged_fraction", flagged, PointStatus::Ok, "");
        Ok(())
    }

    fn fail(&self, component: &str, e: IngestError) -> IngestError {
        error!(
            component,
            category = e.category(),
            error = %e,
            "Fatal pipeline error"
        );
        self.monitoring.update(
            "ingest.status",
            format!("{}: {}", component, e),
            PointStatus::MajorAlarm,
            "",
        );
        e
    }
}
