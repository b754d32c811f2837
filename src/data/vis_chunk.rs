//! The integration record produced once per correlator cycle.

use ndarray::Array3;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{IngestError, IngestResult};

/// Polarisation product of a linear-feed correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarisation {
    /// X of antenna 1 with X of antenna 2
    XX,
    /// X of antenna 1 with Y of antenna 2
    XY,
    /// Y of antenna 1 with X of antenna 2
    YX,
    /// Y of antenna 1 with Y of antenna 2
    YY,
}

impl Polarisation {
    /// All products in canonical order.
    pub const ALL: [Polarisation; 4] = [
        Polarisation::XX,
        Polarisation::XY,
        Polarisation::YX,
        Polarisation::YY,
    ];

    /// Canonical 0..3 index (`2 * receptor1 + receptor2`).
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Polarisation::XX => 0,
            Polarisation::XY => 1,
            Polarisation::YX => 2,
            Polarisation::YY => 3,
        }
    }

    /// Receptor indices (0 = X, 1 = Y) of antenna 1 and antenna 2.
    #[must_use]
    pub fn receptors(self) -> (usize, usize) {
        let idx = self.index();
        (idx / 2, idx % 2)
    }
}

impl fmt::Display for Polarisation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Polarisation::XX => "XX",
            Polarisation::XY => "XY",
            Polarisation::YX => "YX",
            Polarisation::YY => "YY",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for Polarisation {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "XX" => Ok(Polarisation::XX),
            "XY" => Ok(Polarisation::XY),
            "YX" => Ok(Polarisation::YX),
            "YY" => Ok(Polarisation::YY),
            other => Err(IngestError::Configuration(format!(
                "Unsupported polarisation product '{}', expected one of XX, XY, YX, YY",
                other
            ))),
        }
    }
}

/// Equatorial direction (J2000), radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Direction {
    /// Right ascension
    pub ra: f64,
    /// Declination
    pub dec: f64,
}

impl Direction {
    /// Direction from right ascension and declination in radians.
    #[must_use]
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Direction from right ascension and declination in degrees.
    #[must_use]
    pub fn from_degrees(ra_deg: f64, dec_deg: f64) -> Self {
        Self::new(ra_deg.to_radians(), dec_deg.to_radians())
    }
}

/// One integration cycle of correlator output covering every row, channel and
/// polarisation product.
///
/// Cubes are indexed `[row, channel, polarisation]`. Stages mutate a chunk in
/// place; a stage that changes the channel count replaces `visibility`, `flag`
/// and `frequency` together.
#[derive(Debug, Clone, PartialEq)]
pub struct VisChunk {
    /// Integration midpoint, microseconds since MJD 0 (UTC)
    pub timestamp: u64,
    /// Scan identifier from the metadata stream
    pub scan: u32,
    /// Phase centre (J2000) the correlator is phased towards
    pub phase_centre: Direction,
    /// First antenna of each row
    pub antenna1: Vec<usize>,
    /// Second antenna of each row
    pub antenna2: Vec<usize>,
    /// Beam of antenna 1 for each row
    pub beam1: Vec<usize>,
    /// Beam of antenna 2 for each row
    pub beam2: Vec<usize>,
    /// Feed of antenna 1 for each row
    pub feed1: Vec<usize>,
    /// Feed of antenna 2 for each row
    pub feed2: Vec<usize>,
    /// Pointing of antenna 1 for each row
    pub pointing_dir1: Vec<Direction>,
    /// Pointing of antenna 2 for each row
    pub pointing_dir2: Vec<Direction>,
    /// Baseline coordinates in metres, filled by the geometry stage
    pub uvw: Vec<[f64; 3]>,
    /// Geometric delay of antenna 2 relative to antenna 1 in metres,
    /// filled by the geometry stage
    pub delay: Vec<f64>,
    /// Complex visibilities `[row, channel, pol]`
    pub visibility: Array3<Complex32>,
    /// Flags, same shape as `visibility`
    pub flag: Array3<bool>,
    /// Sky frequency of each channel in Hz
    pub frequency: Vec<f64>,
    /// Width of one channel in Hz
    pub channel_width: f64,
    /// Polarisation products in cube order
    pub stokes: Vec<Polarisation>,
}

impl VisChunk {
    /// Allocate a zeroed, unflagged chunk of the given shape.
    #[must_use]
    pub fn new(n_rows: usize, n_channels: usize, stokes: Vec<Polarisation>) -> Self {
        let n_pols = stokes.len();
        Self {
            timestamp: 0,
            scan: 0,
            phase_centre: Direction::default(),
            antenna1: vec![0; n_rows],
            antenna2: vec![0; n_rows],
            beam1: vec![0; n_rows],
            beam2: vec![0; n_rows],
            feed1: vec![0; n_rows],
            feed2: vec![0; n_rows],
            pointing_dir1: vec![Direction::default(); n_rows],
            pointing_dir2: vec![Direction::default(); n_rows],
            uvw: vec![[0.0; 3]; n_rows],
            delay: vec![0.0; n_rows],
            visibility: Array3::zeros((n_rows, n_channels, n_pols)),
            flag: Array3::from_elem((n_rows, n_channels, n_pols), false),
            frequency: vec![0.0; n_channels],
            channel_width: 0.0,
            stokes,
        }
    }

    /// Number of rows (R).
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.visibility.dim().0
    }

    /// Number of spectral channels (C).
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.visibility.dim().1
    }

    /// Number of polarisation products (P).
    #[must_use]
    pub fn n_pols(&self) -> usize {
        self.visibility.dim().2
    }

    /// Fraction of flagged samples, 0 for an empty chunk.
    #[must_use]
    pub fn flagged_fraction(&self) -> f64 {
        let total = self.flag.len();
        if total == 0 {
            return 0.0;
        }
        self.flag.iter().filter(|&&f| f).count() as f64 / total as f64
    }

    /// Flag every sample of a row.
    pub fn flag_row(&mut self, row: usize) {
        self.flag
            .index_axis_mut(ndarray::Axis(0), row)
            .fill(true);
    }

    /// Check the shape invariants against the array dimensions.
    pub fn validate(&self, n_antennas: usize, n_beams: usize) -> IngestResult<()> {
        let n_rows = self.n_rows();
        let per_row = [
            ("antenna1", self.antenna1.len()),
            ("antenna2", self.antenna2.len()),
            ("beam1", self.beam1.len()),
            ("beam2", self.beam2.len()),
            ("feed1", self.feed1.len()),
            ("feed2", self.feed2.len()),
            ("pointing_dir1", self.pointing_dir1.len()),
            ("pointing_dir2", self.pointing_dir2.len()),
            ("uvw", self.uvw.len()),
            ("delay", self.delay.len()),
        ];
        for (name, len) in per_row {
            if len != n_rows {
                return Err(IngestError::DataIntegrity(format!(
                    "{} has {} entries for {} rows",
                    name, len, n_rows
                )));
            }
        }
        if self.flag.dim() != self.visibility.dim() {
            return Err(IngestError::DataIntegrity(format!(
                "Flag cube shape {:?} differs from visibility cube shape {:?}",
                self.flag.dim(),
                self.visibility.dim()
            )));
        }
        if self.frequency.len() != self.n_channels() {
            return Err(IngestError::DataIntegrity(format!(
                "{} frequencies for {} channels",
                self.frequency.len(),
                self.n_channels()
            )));
        }
        if self.stokes.len() != self.n_pols() {
            return Err(IngestError::DataIntegrity(format!(
                "{} polarisation products for {} cube planes",
                self.stokes.len(),
                self.n_pols()
            )));
        }
        let antennas_ok = self
            .antenna1
            .iter()
            .chain(&self.antenna2)
            .all(|&a| a < n_antennas);
        let beams_ok = self.beam1.iter().chain(&self.beam2).all(|&b| b < n_beams);
        if !antennas_ok || !beams_ok {
            return Err(IngestError::DataIntegrity(
                "Antenna or beam index outside the configured array".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polarisation_indices_are_canonical() {
        for (i, pol) in Polarisation::ALL.iter().enumerate() {
            assert_eq!(pol.index(), i);
        }
        assert_eq!(Polarisation::XY.receptors(), (0, 1));
        assert_eq!(Polarisation::YX.receptors(), (1, 0));
    }

    #[test]
    fn polarisation_parsing() {
        assert_eq!("yy".parse::<Polarisation>().unwrap(), Polarisation::YY);
        assert!(matches!(
            "RR".parse::<Polarisation>(),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn new_chunk_has_consistent_shape() {
        let chunk = VisChunk::new(3, 8, vec![Polarisation::XX, Polarisation::YY]);
        assert_eq!(chunk.n_rows(), 3);
        assert_eq!(chunk.n_channels(), 8);
        assert_eq!(chunk.n_pols(), 2);
        assert!(chunk.validate(1, 1).is_ok());
        assert_eq!(chunk.flagged_fraction(), 0.0);
    }

    #[test]
    fn validate_detects_bad_shapes() {
        let mut chunk = VisChunk::new(2, 4, vec![Polarisation::XX]);
        chunk.frequency.pop();
        assert!(matches!(
            chunk.validate(2, 1),
            Err(IngestError::DataIntegrity(_))
        ));

        let mut chunk = VisChunk::new(2, 4, vec![Polarisation::XX]);
        chunk.antenna2[1] = 5;
        assert!(chunk.validate(2, 1).is_err());
    }

    #[test]
    fn flag_row_flags_every_sample() {
        let mut chunk = VisChunk::new(2, 4, vec![Polarisation::XX, Polarisation::YY]);
        chunk.flag_row(1);
        assert!((chunk.flagged_fraction() - 0.5).abs() < 1e-12);
    }
}
