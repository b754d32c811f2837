//! Fringe (delay) rotation.
//!
//! The correlator already compensates the delay towards a fixed reference
//! direction; the residual to remove is the geometric delay towards the phase
//! centre minus the delay towards that reference. The correction applied to a
//! row with residual delay `τ` (antenna 2 relative to antenna 1) is
//! `exp(−2πi·f·τ)`.

use nalgebra::Vector3;
use num_complex::Complex32;
use serde::Deserialize;
use std::f64::consts::TAU;
use std::sync::Arc;
use tracing::debug;

use crate::astro::SPEED_OF_LIGHT;
use crate::data::vis_chunk::VisChunk;
use crate::error::{IngestError, IngestResult};
use crate::monitoring::{MonitoringStore, PointStatus};
use crate::pipeline::{parse_params, Stage, StageContext};
use crate::stages::geometry::{DelayCalculator, GeometryStage};

/// Offset between the first channel's sky frequency and the effective LO
/// frequency of the down-conversion chain, Hz.
pub const DEFAULT_LO_OFFSET_HZ: f64 = 4.0e6;

/// How the residual delay is turned into phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FringeMode {
    /// One frequency-independent phasor per row at the effective LO frequency
    PhaseOnly,
    /// One phasor per channel at the channel's sky frequency
    #[default]
    DelayTracking,
}

/// Direction whose delay the correlator already compensates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayReference {
    /// Local vertical at the array reference position
    #[default]
    LocalZenith,
    /// The celestial south pole, ITRF `(0, 0, −1)`
    SouthPole,
}

impl DelayReference {
    /// ITRF unit vector of the reference direction.
    #[must_use]
    pub fn vector(self, calculator: &DelayCalculator) -> Vector3<f64> {
        match self {
            DelayReference::LocalZenith => calculator.zenith(),
            DelayReference::SouthPole => -Vector3::z(),
        }
    }
}

/// Parameters of the `fringe_rotation` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FringeParams {
    /// Phase-only or per-channel delay tracking
    #[serde(default)]
    pub mode: FringeMode,
    /// Direction already compensated upstream
    #[serde(default)]
    pub delay_reference: DelayReference,
    /// Fixed per-antenna delay offsets in ns, applied in delay-tracking mode
    #[serde(default)]
    pub fixed_delays_ns: Vec<f64>,
    /// First-channel sky frequency minus effective LO frequency, Hz
    #[serde(default = "default_lo_offset")]
    pub lo_offset_hz: f64,
}

fn default_lo_offset() -> f64 {
    DEFAULT_LO_OFFSET_HZ
}

/// Removes the residual geometric delay left in each row.
///
/// Reads the per-row delay written by [`GeometryStage`]; autocorrelation rows
/// are left untouched.
pub struct FringeRotationStage {
    mode: FringeMode,
    reference: DelayReference,
    reference_delays: Vec<f64>,
    fixed_delays_ns: Vec<f64>,
    lo_offset_hz: f64,
    monitoring: Option<Arc<MonitoringStore>>,
}

impl FringeRotationStage {
    /// Stage type name used in configuration.
    pub const NAME: &'static str = "fringe_rotation";

    /// Create a stage from typed parameters.
    pub fn new(params: FringeParams, calculator: &DelayCalculator) -> IngestResult<Self> {
        let n = calculator.n_antennas();
        let fixed_delays_ns = resolve_fixed_delays(params.fixed_delays_ns, n)?;
        let reference_delays = calculator.antenna_delays(&params.delay_reference.vector(calculator));

        debug!(
            mode = ?params.mode,
            reference = ?params.delay_reference,
            lo_offset_hz = params.lo_offset_hz,
            "Fringe rotation configured"
        );

        Ok(Self {
            mode: params.mode,
            reference: params.delay_reference,
            reference_delays,
            fixed_delays_ns,
            lo_offset_hz: params.lo_offset_hz,
            monitoring: None,
        })
    }

    /// Create a stage from its configuration table.
    pub fn from_params(params: &toml::Table, ctx: &StageContext) -> IngestResult<Self> {
        let params: FringeParams = parse_params(Self::NAME, params)?;
        Ok(Self::new(params, &ctx.delays)?.with_monitoring(Arc::clone(&ctx.monitoring)))
    }

    /// Publish the largest residual delay of each chunk.
    #[must_use]
    pub fn with_monitoring(mut self, monitoring: Arc<MonitoringStore>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// Per-antenna delay (metres) towards the reference direction.
    pub fn reference_delays(&self) -> &[f64] {
        &self.reference_delays
    }

    /// Reference direction in use.
    pub fn reference(&self) -> DelayReference {
        self.reference
    }

    /// Residual delay of a row in seconds, before fixed offsets.
    fn residual_seconds(&self, a1: usize, a2: usize, geometric_m: f64) -> f64 {
        let reference_m = self.reference_delays[a2] - self.reference_delays[a1];
        (geometric_m - reference_m) / SPEED_OF_LIGHT
    }
}

pub(crate) fn resolve_fixed_delays(fixed: Vec<f64>, n_antennas: usize) -> IngestResult<Vec<f64>> {
    if fixed.is_empty() {
        return Ok(vec![0.0; n_antennas]);
    }
    if fixed.len() != n_antennas {
        return Err(IngestError::Configuration(format!(
            "fixed_delays_ns has {} entries for {} antennas",
            fixed.len(),
            n_antennas
        )));
    }
    Ok(fixed)
}

pub(crate) fn unit_phasor(phase: f64) -> Complex32 {
    let (sin, cos) = phase.sin_cos();
    Complex32::new(cos as f32, sin as f32)
}

impl Stage for FringeRotationStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn requires(&self) -> &'static [&'static str] {
        &[GeometryStage::NAME]
    }

    fn process(&mut self, chunk: &mut VisChunk) -> IngestResult<()> {
        let Some(&first_freq) = chunk.frequency.first() else {
            return Ok(());
        };
        let lo_freq = first_freq - self.lo_offset_hz;
        let n_antennas = self.reference_delays.len();
        let mut max_residual_s: f64 = 0.0;

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

            let residual = self.residual_seconds(a1, a2, chunk.delay[row]);
            max_residual_s = max_residual_s.max(residual.abs());

            let mut cube = chunk.visibility.index_axis_mut(ndarray::Axis(0), row);
            match self.mode {
                FringeMode::PhaseOnly => {
                    let phasor = unit_phasor(-TAU * lo_freq * residual);
                    cube.mapv_inplace(|v| v * phasor);
                }
                FringeMode::DelayTracking => {
                    let fixed = (self.fixed_delays_ns[a2] - self.fixed_delays_ns[a1]) * 1e-9;
                    let tau = residual + fixed;
                    for (channel, mut pols) in cube.outer_iter_mut().enumerate() {
                        let phasor = unit_phasor(-TAU * chunk.frequency[channel] * tau);
                        pols.mapv_inplace(|v| v * phasor);
                    }
                }
            }
        }

        if let Some(monitoring) = &self.monitoring {
            monitoring.update(
                "fringe.max_residual_delay_ns",
                max_residual_s * 1e9,
                PointStatus::Ok,
                "ns",
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::vis_chunk::{Direction, Polarisation};

    fn calculator() -> DelayCalculator {
        DelayCalculator::new(
            vec!["a".into(), "b".into()],
            &[
                [-2_556_084.669, 5_097_398.337, -2_848_424.133],
                [-2_556_118.109, 5_097_384.719, -2_848_417.874],
            ],
        )
        .unwrap()
    }

    fn params(mode: FringeMode, reference: DelayReference) -> FringeParams {
        FringeParams {
            mode,
            delay_reference: reference,
            fixed_delays_ns: Vec::new(),
            lo_offset_hz: DEFAULT_LO_OFFSET_HZ,
        }
    }

    /// Rows (0,0) and (0,1), 3 channels, XX only, all visibilities 1+0i.
    fn chunk() -> VisChunk {
        let mut chunk = VisChunk::new(2, 3, vec![Polarisation::XX]);
        chunk.antenna1 = vec![0, 0];
        chunk.antenna2 = vec![0, 1];
        chunk.frequency = vec![1.0e9, 1.001e9, 1.002e9];
        chunk.visibility.fill(Complex32::new(1.0, 0.0));
        chunk.phase_centre = Direction::from_degrees(30.0, -45.0);
        chunk
    }

    fn assert_close(a: Complex32, b: Complex32) {
        assert!((a - b).norm() < 1e-5, "{a} != {b}");
    }

    #[test]
    fn autocorrelation_is_untouched() {
        for mode in [FringeMode::PhaseOnly, FringeMode::DelayTracking] {
            let mut stage =
                FringeRotationStage::new(params(mode, DelayReference::LocalZenith), &calculator())
                    .unwrap();
            let mut chunk = chunk();
            chunk.visibility[[0, 1, 0]] = Complex32::new(0.25, -3.5);
            let before = chunk.visibility.clone();
            stage.process(&mut chunk).unwrap();
            for c in 0..3 {
                assert_eq!(chunk.visibility[[0, c, 0]], before[[0, c, 0]]);
            }
        }
    }

    #[test]
    fn zero_residual_leaves_cross_correlation_unchanged() {
        let mut stage = FringeRotationStage::new(
            params(FringeMode::DelayTracking, DelayReference::LocalZenith),
            &calculator(),
        )
        .unwrap();
        let mut chunk = chunk();
        let r = stage.reference_delays();
        chunk.delay[1] = r[1] - r[0];
        stage.process(&mut chunk).unwrap();
        for c in 0..3 {
            assert_close(chunk.visibility[[1, c, 0]], Complex32::new(1.0, 0.0));
        }
    }

    #[test]
    fn phase_only_applies_one_phasor_at_lo_frequency() {
        let mut stage = FringeRotationStage::new(
            params(FringeMode::PhaseOnly, DelayReference::LocalZenith),
            &calculator(),
        )
        .unwrap();
        let mut chunk = chunk();
        let r = stage.reference_delays();
        let extra_m = 0.03;
        chunk.delay[1] = r[1] - r[0] + extra_m;
        stage.process(&mut chunk).unwrap();

        let lo = 1.0e9 - DEFAULT_LO_OFFSET_HZ;
        let expected = unit_phasor(-TAU * lo * extra_m / SPEED_OF_LIGHT);
        for c in 0..3 {
            assert_close(chunk.visibility[[1, c, 0]], expected);
        }
    }

    #[test]
    fn delay_tracking_phase_scales_with_channel_frequency() {
        let mut p = params(FringeMode::DelayTracking, DelayReference::LocalZenith);
        p.fixed_delays_ns = vec![0.0, 0.5];
        let mut stage = FringeRotationStage::new(p, &calculator()).unwrap();
        let mut chunk = chunk();
        let r = stage.reference_delays();
        let extra_m = 0.03;
        chunk.delay[1] = r[1] - r[0] + extra_m;
        stage.process(&mut chunk).unwrap();

        let tau = extra_m / SPEED_OF_LIGHT + 0.5e-9;
        for (c, f) in [1.0e9, 1.001e9, 1.002e9].iter().enumerate() {
            let expected = unit_phasor(-TAU * f * tau);
            assert_close(chunk.visibility[[1, c, 0]], expected);
            assert!((chunk.visibility[[1, c, 0]].norm() - 1.0).abs() < 1e-6);
        }
        assert!((chunk.visibility[[1, 0, 0]] - chunk.visibility[[1, 2, 0]]).norm() > 1e-4);
    }

    #[test]
    fn south_pole_reference_uses_polar_axis() {
        let calc = calculator();
        let stage = FringeRotationStage::new(
            params(FringeMode::DelayTracking, DelayReference::SouthPole),
            &calc,
        )
        .unwrap();
        let expected = calc.antenna_delays(&Vector3::new(0.0, 0.0, -1.0));
        assert_eq!(stage.reference_delays(), expected.as_slice());
        assert_eq!(stage.reference(), DelayReference::SouthPole);
    }

    #[test]
    fn reference_choice_changes_the_correction() {
        let calc = calculator();
        let mut zenith = FringeRotationStage::new(
            params(FringeMode::DelayTracking, DelayReference::LocalZenith),
            &calc,
        )
        .unwrap();
        let mut pole = FringeRotationStage::new(
            params(FringeMode::DelayTracking, DelayReference::SouthPole),
            &calc,
        )
        .unwrap();

        let mut a = chunk();
        a.delay[1] = 12.0;
        let mut b = a.clone();
        zenith.process(&mut a).unwrap();
        pole.process(&mut b).unwrap();

        // Residual under each convention is geometric minus that reference.
        let za = zenith.reference_delays();
        let pb = pole.reference_delays();
        let tau_zenith = (12.0 - (za[1] - za[0])) / SPEED_OF_LIGHT;
        let tau_pole = (12.0 - (pb[1] - pb[0])) / SPEED_OF_LIGHT;
        assert_close(a.visibility[[1, 0, 0]], unit_phasor(-TAU * 1.0e9 * tau_zenith));
        assert_close(b.visibility[[1, 0, 0]], unit_phasor(-TAU * 1.0e9 * tau_pole));
        assert!((a.visibility[[1, 0, 0]] - b.visibility[[1, 0, 0]]).norm() > 1e-3);
    }

    #[test]
    fn fixed_delay_length_must_match_array() {
        let mut p = params(FringeMode::DelayTracking, DelayReference::LocalZenith);
        p.fixed_delays_ns = vec![1.0];
        assert!(matches!(
            FringeRotationStage::new(p, &calculator()),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn params_parse_from_table() {
        let table: toml::Table =
            toml::from_str("mode = \"phase_only\"\ndelay_reference = \"south_pole\"").unwrap();
        let p: FringeParams = parse_params(FringeRotationStage::NAME, &table).unwrap();
        assert_eq!(p.mode, FringeMode::PhaseOnly);
        assert_eq!(p.delay_reference, DelayReference::SouthPole);
        assert_eq!(p.lo_offset_hz, DEFAULT_LO_OFFSET_HZ);

        let bad: toml::Table = toml::from_str("mode = \"sideways\"").unwrap();
        assert!(parse_params::<FringeParams>(FringeRotationStage::NAME, &bad).is_err());
    }
}
