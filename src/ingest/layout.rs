//! Row ordering shared by the correlator payload and the assembled chunk.

use crate::config::ArrayConfig;

/// Antenna pair and beam carried by one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowDescriptor {
    /// First antenna
    pub antenna1: usize,
    /// Second antenna (`antenna1 <= antenna2`)
    pub antenna2: usize,
    /// Beam index
    pub beam: usize,
}

/// Beam-major row layout: for every beam, every antenna pair with
/// `antenna1 <= antenna2` (autocorrelations optional).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    rows: Vec<RowDescriptor>,
}

impl RowLayout {
    /// Build the layout for an array of `n_antennas` forming `n_beams` beams.
    pub fn new(n_antennas: usize, n_beams: usize, include_autocorrelations: bool) -> Self {
        let mut rows = Vec::new();
        for beam in 0..n_beams {
            for antenna1 in 0..n_antennas {
                let first = if include_autocorrelations {
                    antenna1
                } else {
                    antenna1 + 1
                };
                for antenna2 in first..n_antennas {
                    rows.push(RowDescriptor {
                        antenna1,
                        antenna2,
                        beam,
                    });
                }
            }
        }
        Self { rows }
    }

    /// Layout for the configured array.
    pub fn from_config(array: &ArrayConfig) -> Self {
        Self::new(
            array.antennas.len(),
            array.n_beams,
            array.include_autocorrelations,
        )
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the layout has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in order.
    pub fn rows(&self) -> &[RowDescriptor] {
        &self.rows
    }
}
