//! Hardware-delegated delay tracking.
//!
//! Instead of removing the whole residual delay in software, the per-antenna
//! delay is quantised to the delay unit's integer step range and sent to the
//! hardware whenever an antenna's step changes. What remains after the
//! hardware steps is removed per channel in software:
//!
//! ```text
//! phase_c = −2π · (f_c · (τ − n·step) + f_LO · n·step)     (row differences)
//! ```
//!
//! The second term accounts for the hardware delay being applied after
//! down-conversion, where it only rotates the baseband frequency `f_c − f_LO`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::{mpsc, Arc};
use tracing::{debug, info, warn};

use crate::astro::SPEED_OF_LIGHT;
use crate::data::vis_chunk::VisChunk;
use crate::error::{IngestError, IngestResult};
use crate::monitoring::{MonitoringStore, PointStatus};
use crate::pipeline::{parse_params, Stage, StageContext};
use crate::stages::fringe::{resolve_fixed_delays, unit_phasor, DelayReference, DEFAULT_LO_OFFSET_HZ};
use crate::stages::geometry::DelayCalculator;

/// Sparse antenna-label → step mapping; only antennas whose step changed.
pub type DelayCommand = BTreeMap<String, i32>;

/// Outgoing side of the delay-unit control protocol.
pub trait DelayControl: Send {
    /// Send one command, returning the device's acknowledgement if any.
    fn send(&mut self, command: &DelayCommand) -> IngestResult<Option<String>>;
}

/// Logs commands without a device attached.
#[derive(Debug, Default)]
pub struct LoggingDelayControl {
    sent: u64,
}

impl DelayControl for LoggingDelayControl {
    fn send(&mut self, command: &DelayCommand) -> IngestResult<Option<String>> {
        self.sent += 1;
        info!(
            command = self.sent,
            antennas = command.len(),
            steps = ?command,
            "Delay command"
        );
        Ok(None)
    }
}

/// Forwards commands over a channel, answering with a fixed acknowledgement.
pub struct ChannelDelayControl {
    tx: mpsc::Sender<DelayCommand>,
    ack: Option<String>,
}

impl ChannelDelayControl {
    /// Create the control and the receiver that observes its commands.
    pub fn new() -> (Self, mpsc::Receiver<DelayCommand>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx, ack: None }, rx)
    }

    /// Acknowledge every command with `ack`.
    #[must_use]
    pub fn with_ack(mut self, ack: impl Into<String>) -> Self {
        self.ack = Some(ack.into());
        self
    }
}

impl DelayControl for ChannelDelayControl {
    fn send(&mut self, command: &DelayCommand) -> IngestResult<Option<String>> {
        self.tx
            .send(command.clone())
            .map_err(|_| IngestError::Transport("Delay control receiver dropped".into()))?;
        Ok(self.ack.clone())
    }
}

/// Parameters of the `hardware_delay` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareDelayParams {
    /// Delay of one hardware step in ns
    #[serde(default = "default_step_ns")]
    pub step_ns: f64,
    /// Smallest representable step
    #[serde(default = "default_min_step")]
    pub min_step: i32,
    /// Largest representable step
    #[serde(default = "default_max_step")]
    pub max_step: i32,
    /// Direction already compensated upstream
    #[serde(default)]
    pub delay_reference: DelayReference,
    /// Fixed per-antenna delay offsets in ns
    #[serde(default)]
    pub fixed_delays_ns: Vec<f64>,
    /// First-channel sky frequency minus effective LO frequency, Hz
    #[serde(default = "default_lo_offset")]
    pub lo_offset_hz: f64,
}

fn default_step_ns() -> f64 {
    1.0
}

fn default_min_step() -> i32 {
    -2048
}

fn default_max_step() -> i32 {
    2047
}

fn default_lo_offset() -> f64 {
    DEFAULT_LO_OFFSET_HZ
}

/// Quantises per-antenna delays and remembers what the hardware holds.
#[derive(Debug, Clone)]
pub struct DelayQuantiser {
    step_ns: f64,
    min_step: i32,
    max_step: i32,
    applied: Vec<Option<i32>>,
}

impl DelayQuantiser {
    /// Quantiser for `n_antennas` antennas, none of which has been commanded.
    pub fn new(step_ns: f64, min_step: i32, max_step: i32, n_antennas: usize) -> IngestResult<Self> {
        if !(step_ns > 0.0 && step_ns.is_finite()) {
            return Err(IngestError::Configuration(format!(
                "step_ns must be positive, got {}",
                step_ns
            )));
        }
        if min_step > max_step {
            return Err(IngestError::Configuration(format!(
                "min_step {} exceeds max_step {}",
                min_step, max_step
            )));
        }
        Ok(Self {
            step_ns,
            min_step,
            max_step,
            applied: vec![None; n_antennas],
        })
    }

    /// Nearest representable step for a delay in ns.
    #[must_use]
    pub fn quantise(&self, delay_ns: f64) -> i32 {
        let steps = (delay_ns / self.step_ns).round();
        steps.clamp(f64::from(self.min_step), f64::from(self.max_step)) as i32
    }

    /// Steps for every antenna plus the command holding only the changes.
    pub fn plan(&self, names: &[String], delays_ns: &[f64]) -> (Vec<i32>, DelayCommand) {
        let steps: Vec<i32> = delays_ns.iter().map(|&d| self.quantise(d)).collect();
        let command = names
            .iter()
            .zip(&steps)
            .zip(&self.applied)
            .filter(|((_, step), applied)| **applied != Some(**step))
            .map(|((name, step), _)| (name.clone(), *step))
            .collect();
        (steps, command)
    }

    /// Record that the hardware now holds `steps`.
    pub fn commit(&mut self, steps: &[i32]) {
        for (applied, &step) in self.applied.iter_mut().zip(steps) {
            *applied = Some(step);
        }
    }

    /// Delay held by the hardware for each antenna in ns (zero if never set).
    #[must_use]
    pub fn applied_ns(&self) -> Vec<f64> {
        self.applied
            .iter()
            .map(|s| f64::from(s.unwrap_or(0)) * self.step_ns)
            .collect()
    }

    /// Step held by the hardware for one antenna.
    #[must_use]
    pub fn applied_step(&self, antenna: usize) -> Option<i32> {
        self.applied.get(antenna).copied().flatten()
    }
}

/// Delay correction split between a hardware delay unit and software.
pub struct HardwareDelayStage {
    calculator: Arc<DelayCalculator>,
    reference_delays: Vec<f64>,
    fixed_delays_ns: Vec<f64>,
    lo_offset_hz: f64,
    quantiser: DelayQuantiser,
    control: Box<dyn DelayControl>,
    monitoring: Option<Arc<MonitoringStore>>,
}

impl HardwareDelayStage {
    /// Stage type name used in configuration.
    pub const NAME: &'static str = "hardware_delay";

    /// Create a stage sending commands through `control`.
    pub fn new(
        params: HardwareDelayParams,
        calculator: Arc<DelayCalculator>,
        control: Box<dyn DelayControl>,
    ) -> IngestResult<Self> {
        let n = calculator.n_antennas();
        let quantiser = DelayQuantiser::new(params.step_ns, params.min_step, params.max_step, n)?;
        let fixed_delays_ns = resolve_fixed_delays(params.fixed_delays_ns, n)?;
        let reference_delays =
            calculator.antenna_delays(&params.delay_reference.vector(&calculator));

        Ok(Self {
            calculator,
            reference_delays,
            fixed_delays_ns,
            lo_offset_hz: params.lo_offset_hz,
            quantiser,
            control,
            monitoring: None,
        })
    }

    /// Create a stage from its configuration table.
    pub fn from_params(
        params: &toml::Table,
        ctx: &StageContext,
        control: Box<dyn DelayControl>,
    ) -> IngestResult<Self> {
        let params: HardwareDelayParams = parse_params(Self::NAME, params)?;
        Ok(Self::new(params, Arc::clone(&ctx.delays), control)?
            .with_monitoring(Arc::clone(&ctx.monitoring)))
    }

    /// Publish per-antenna delay points.
    #[must_use]
    pub fn with_monitoring(mut self, monitoring: Arc<MonitoringStore>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// Quantiser state.
    pub fn quantiser(&self) -> &DelayQuantiser {
        &self.quantiser
    }

    /// Per-antenna residual delay in ns for a chunk, fixed offsets included.
    pub fn antenna_delays_ns(&self, chunk: &VisChunk) -> Vec<f64> {
        let position = self.calculator.apparent(chunk.phase_centre, chunk.timestamp);
        self.calculator
            .antenna_delays(&position.unit_vector())
            .iter()
            .zip(&self.reference_delays)
            .zip(&self.fixed_delays_ns)
            .map(|((geo, reference), fixed)| (geo - reference) / SPEED_OF_LIGHT * 1e9 + fixed)
            .collect()
    }

    fn publish(&self, delays_ns: &[f64]) {
        let Some(monitoring) = &self.monitoring else {
            return;
        };
        for (antenna, name) in self.calculator.names().iter().enumerate() {
            monitoring.update(
                format!("{}.delay_ns", name),
                delays_ns[antenna],
                PointStatus::Ok,
                "ns",
            );
            match self.quantiser.applied_step(antenna) {
                Some(step) => {
                    monitoring.update(
                        format!("{}.hw_delay_steps", name),
                        step,
                        PointStatus::Ok,
                        "",
                    );
                }
                None => monitoring.invalidate(&format!("{}.hw_delay_steps", name)),
            }
        }
    }
}

impl Stage for HardwareDelayStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn process(&mut self, chunk: &mut VisChunk) -> IngestResult<()> {
        let delays_ns = self.antenna_delays_ns(chunk);
        let (steps, command) = self.quantiser.plan(self.calculator.names(), &delays_ns);

        if !command.is_empty() {
            match self.control.send(&command) {
                Ok(ack) => {
                    if let Some(ack) = ack {
                        debug!(%ack, "Delay command acknowledged");
                    }
                    self.quantiser.commit(&steps);
                }
                // The hardware keeps its previous steps; retried next cycle.
                Err(e) => warn!(error = %e, antennas = command.len(), "Delay command failed"),
            }
        }
        self.publish(&delays_ns);

        let Some(&first_freq) = chunk.frequency.first() else {
            return Ok(());
        };
        let lo_freq = first_freq - self.lo_offset_hz;
        let hardware_ns = self.quantiser.applied_ns();
        let n_antennas = delays_ns.len();

        for row in 0..chunk.n_rows() {
            let (a1, a2) = (chunk.antenna1[row], chunk.antenna2[row]);
            if a1 == a2 {
                continue;
            }
            if a1 >= n_antennas || a2 >= n_antennas {
                return Err(IngestError::DataIntegrity(format!(
                    "Row {} references antenna outside the array of {}",
                    row, n_antennas
                )));
            }

            let hardware = (hardware_ns[a2] - hardware_ns[a1]) * 1e-9;
            let residual = (delays_ns[a2] - delays_ns[a1]) * 1e-9 - hardware;
            let mut cube = chunk.visibility.index_axis_mut(ndarray::Axis(0), row);
            for (channel, mut pols) in cube.outer_iter_mut().enumerate() {
                let phase = -TAU * (chunk.frequency[channel] * residual + lo_freq * hardware);
                let phasor = unit_phasor(phase);
                pols.mapv_inplace(|v| v * phasor);
            }
        }
        Ok(())
    }
}
