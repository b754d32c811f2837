//! Geometric delay and UVW computation.
//!
//! [`DelayCalculator`] is the shared capability object: it owns the antenna
//! positions and answers "where is this direction right now" and "how late
//! does the wavefront reach each antenna". [`GeometryStage`] uses it to fill
//! `uvw` and `delay` for every row of a chunk; the fringe and hardware-delay
//! stages hold the same `Arc` for their reference-direction terms.

use nalgebra::{Matrix3, Vector3};
use std::sync::Arc;
use tracing::trace;

use crate::astro;
use crate::config::ArrayConfig;
use crate::data::vis_chunk::{Direction, VisChunk};
use crate::error::{IngestError, IngestResult};
use crate::pipeline::Stage;

/// Direction of a source as seen from the array at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApparentPosition {
    /// Local mean sidereal time at the array reference, radians
    pub lst: f64,
    /// Greenwich hour angle, radians
    pub hour_angle: f64,
    /// Declination of date, radians
    pub dec: f64,
}

impl ApparentPosition {
    /// ITRF unit vector towards the source.
    #[must_use]
    pub fn unit_vector(&self) -> Vector3<f64> {
        astro::source_vector(self.hour_angle, self.dec)
    }

    /// Rotation taking ITRF coordinates to (u, v, w); the last row is
    /// [`unit_vector`](Self::unit_vector).
    #[must_use]
    #[rustfmt::skip]
    pub fn uvw_rotation(&self) -> Matrix3<f64> {
        let (sin_h, cos_h) = self.hour_angle.sin_cos();
        let (sin_d, cos_d) = self.dec.sin_cos();
        Matrix3::new(
            sin_h, cos_h, 0.0,
            -sin_d * cos_h, sin_d * sin_h, cos_d,
            cos_d * cos_h, -cos_d * sin_h, sin_d,
        )
    }

    /// Project an ITRF baseline (metres) onto the (u, v, w) frame.
    #[must_use]
    pub fn uvw(&self, baseline: &Vector3<f64>) -> [f64; 3] {
        let uvw = self.uvw_rotation() * baseline;
        [uvw.x, uvw.y, uvw.z]
    }
}

/// Antenna geometry shared by every delay-aware stage.
///
/// Positions are held relative to the array centroid so that per-antenna
/// delays stay within the range a delay unit can represent; baseline
/// differences are unaffected.
#[derive(Debug, Clone)]
pub struct DelayCalculator {
    names: Vec<String>,
    offsets: Vec<Vector3<f64>>,
    longitude: f64,
    latitude: f64,
}

impl DelayCalculator {
    /// Build from antenna labels and ITRF positions (metres), in index order.
    pub fn new(names: Vec<String>, positions: &[[f64; 3]]) -> IngestResult<Self> {
        if positions.is_empty() || names.len() != positions.len() {
            return Err(IngestError::Configuration(format!(
                "{} antenna names for {} positions",
                names.len(),
                positions.len()
            )));
        }

        let positions: Vec<Vector3<f64>> = positions.iter().map(|&p| Vector3::from(p)).collect();
        let centroid = positions.iter().sum::<Vector3<f64>>() / positions.len() as f64;
        let offsets = positions.iter().map(|p| p - centroid).collect();
        let (longitude, latitude, _) =
            astro::itrf_to_geodetic([centroid.x, centroid.y, centroid.z]);

        Ok(Self {
            names,
            offsets,
            longitude,
            latitude,
        })
    }

    /// Build from the array configuration.
    pub fn from_array(array: &ArrayConfig) -> IngestResult<Self> {
        let names = array.antennas.iter().map(|a| a.name.clone()).collect();
        Self::new(names, &array.positions())
    }

    /// Number of antennas.
    #[must_use]
    pub fn n_antennas(&self) -> usize {
        self.offsets.len()
    }

    /// Antenna labels in index order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Geodetic longitude and latitude of the array reference, radians.
    #[must_use]
    pub fn location(&self) -> (f64, f64) {
        (self.longitude, self.latitude)
    }

    /// ITRF unit vector of the local vertical at the array reference.
    #[must_use]
    pub fn zenith(&self) -> Vector3<f64> {
        astro::zenith_vector(self.longitude, self.latitude)
    }

    /// Apparent position of a J2000 direction at a chunk timestamp.
    #[must_use]
    pub fn apparent(&self, direction: Direction, timestamp_us: u64) -> ApparentPosition {
        let mjd = astro::timestamp_to_mjd(timestamp_us);
        let of_date = astro::precess_from_j2000(direction, mjd);
        let lst = astro::local_sidereal_time(mjd, self.longitude);
        // local hour angle minus east longitude gives the Greenwich hour angle
        let hour_angle = lst - of_date.ra - self.longitude;
        ApparentPosition {
            lst,
            hour_angle,
            dec: of_date.dec,
        }
    }

    /// Per-antenna geometric delay in metres towards the ITRF unit vector `s`
    /// (`c·τ_i = −b_i·s`).
    #[must_use]
    pub fn antenna_delays(&self, s: &Vector3<f64>) -> Vec<f64> {
        self.offsets.iter().map(|b| -b.dot(s)).collect()
    }

    /// ITRF baseline vector from antenna `a1` to antenna `a2`.
    pub fn baseline(&self, a1: usize, a2: usize) -> IngestResult<Vector3<f64>> {
        let (b1, b2) = match (self.offsets.get(a1), self.offsets.get(a2)) {
            (Some(b1), Some(b2)) => (b1, b2),
            _ => {
                return Err(IngestError::DataIntegrity(format!(
                    "Baseline ({}, {}) references an antenna outside the array of {}",
                    a1,
                    a2,
                    self.offsets.len()
                )))
            }
        };
        Ok(b2 - b1)
    }
}

/// Fills `uvw` and `delay` (metres, antenna 2 relative to antenna 1) for every
/// row from the chunk's phase centre and timestamp.
pub struct GeometryStage {
    calculator: Arc<DelayCalculator>,
}

impl GeometryStage {
    /// Stage type name used in configuration.
    pub const NAME: &'static str = "geometry";

    /// Create a stage over a shared calculator.
    #[must_use]
    pub fn new(calculator: Arc<DelayCalculator>) -> Self {
        Self { calculator }
    }
}

impl Stage for GeometryStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn process(&mut self, chunk: &mut VisChunk) -> IngestResult<()> {
        let position = self.calculator.apparent(chunk.phase_centre, chunk.timestamp);
        let delays = self.calculator.antenna_delays(&position.unit_vector());
        trace!(
            timestamp_us = chunk.timestamp,
            lst = position.lst,
            hour_angle = position.hour_angle,
            "Geometry"
        );

        for row in 0..chunk.n_rows() {
            let (a1, a2) = (chunk.antenna1[row], chunk.antenna2[row]);
            let baseline = self.calculator.baseline(a1, a2)?;
            chunk.uvw[row] = position.uvw(&baseline);
            chunk.delay[row] = if a1 == a2 { 0.0 } else { delays[a2] - delays[a1] };
        }
        Ok(())
    }
}
