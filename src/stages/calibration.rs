//! Polarimetric gain calibration.
//!
//! For each row the response matrix relating true to measured correlations is
//! `M[(p,q),(r,s)] = J1[p][r] · conj(J2[q][s])`, restricted to the products the
//! chunk carries. The inverse is applied to every channel's polarisation
//! vector; gains are frequency independent.

use nalgebra::DMatrix;
use ndarray::Axis;
use num_complex::{Complex32, Complex64};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::config::ArrayConfig;
use crate::data::vis_chunk::{Polarisation, VisChunk};
use crate::error::{IngestError, IngestResult};
use crate::pipeline::{parse_params, Stage, StageContext};
use crate::stages::gain_table::{GainEntry, GainTable, GainTableFile, LeakageEntry};

/// Default smallest accepted `|det M|`.
pub const DEFAULT_DET_TOLERANCE: f64 = 1e-9;

/// Parameters of the `calibration` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationParams {
    /// Gain table file
    #[serde(default)]
    pub gain_table: Option<PathBuf>,
    /// Inline gains, applied after the file
    #[serde(default)]
    pub gains: Vec<GainEntry>,
    /// Inline leakages, applied after the file
    #[serde(default)]
    pub leakages: Vec<LeakageEntry>,
    /// Smallest accepted response-matrix determinant magnitude
    #[serde(default = "default_tolerance")]
    pub det_tolerance: f64,
}

fn default_tolerance() -> f64 {
    DEFAULT_DET_TOLERANCE
}

type BaselineKey = (usize, usize, usize, usize);

/// Applies the inverse response matrix to every row.
pub struct CalibrationStage {
    table: GainTable,
    tolerance: f64,
    stokes: Vec<Polarisation>,
    inverses: HashMap<BaselineKey, DMatrix<Complex64>>,
}

impl CalibrationStage {
    /// Stage type name used in configuration.
    pub const NAME: &'static str = "calibration";

    /// Create a stage over a loaded table.
    #[must_use]
    pub fn new(table: GainTable, tolerance: f64) -> Self {
        Self {
            table,
            tolerance,
            stokes: Vec::new(),
            inverses: HashMap::new(),
        }
    }

    /// Build the gain table from parameters (file first, then inline entries).
    pub fn from_config(params: CalibrationParams, array: &ArrayConfig) -> IngestResult<Self> {
        let mut table = match &params.gain_table {
            Some(path) => GainTable::load(path, array)?,
            None => GainTable::new(),
        };
        table.extend(
            &GainTableFile {
                gains: params.gains,
                leakages: params.leakages,
            },
            array,
        )?;
        if table.is_empty() {
            return Err(IngestError::Configuration(
                "Calibration stage needs a gain_table file or inline gains".into(),
            ));
        }
        Ok(Self::new(table, params.det_tolerance))
    }

    /// Create a stage from its configuration table.
    pub fn from_params(params: &toml::Table, ctx: &StageContext) -> IngestResult<Self> {
        let params: CalibrationParams = parse_params(Self::NAME, params)?;
        Self::from_config(params, &ctx.array)
    }

    fn inverse_for(&mut self, key: BaselineKey) -> IngestResult<&DMatrix<Complex64>> {
        if !self.inverses.contains_key(&key) {
            let response = response_matrix(&self.table, &self.stokes, key)?;
            let inverse = invert(&response, self.tolerance).map_err(|det| {
                IngestError::DataIntegrity(format!(
                    "Singular response matrix for antennas ({}, {}) beams ({}, {}): |det| = {:e}",
                    key.0, key.2, key.1, key.3, det
                ))
            })?;
            self.inverses.insert(key, inverse);
        }
        self.inverses
            .get(&key)
            .ok_or_else(|| IngestError::DataIntegrity("Response matrix cache miss".into()))
    }
}

/// Canonical indices of the chunk's products, rejecting duplicates.
fn product_indices(stokes: &[Polarisation]) -> IngestResult<Vec<usize>> {
    let indices: Vec<usize> = stokes.iter().map(|p| p.index()).collect();
    for (i, idx) in indices.iter().enumerate() {
        if indices[..i].contains(idx) {
            return Err(IngestError::Configuration(format!(
                "Duplicate polarisation product {}",
                stokes[i]
            )));
        }
    }
    if indices.is_empty() {
        return Err(IngestError::Configuration(
            "Chunk carries no polarisation products".into(),
        ));
    }
    Ok(indices)
}

/// Response matrix of one baseline restricted to `stokes`.
pub fn response_matrix(
    table: &GainTable,
    stokes: &[Polarisation],
    (ant1, beam1, ant2, beam2): BaselineKey,
) -> IngestResult<DMatrix<Complex64>> {
    let mut needed1 = [false; 2];
    let mut needed2 = [false; 2];
    for pol in stokes {
        let (p, q) = pol.receptors();
        needed1[p] = true;
        needed2[q] = true;
    }
    let j1 = table.jones(ant1, beam1, needed1)?;
    let j2 = table.jones(ant2, beam2, needed2)?;

    let n = stokes.len();
    Ok(DMatrix::from_fn(n, n, |i, j| {
        let (p, q) = stokes[i].receptors();
        let (r, s) = stokes[j].receptors();
        j1[p][r] * j2[q][s].conj()
    }))
}

/// Inverse through an LU decomposition.
///
/// Returns `Err(|det|)` when the determinant magnitude is below `tolerance`.
pub fn invert(matrix: &DMatrix<Complex64>, tolerance: f64) -> Result<DMatrix<Complex64>, f64> {
    let lu = matrix.clone().lu();
    let det = lu.determinant().norm();
    if det < tolerance {
        return Err(det);
    }
    lu.try_inverse().ok_or(det)
}

impl Stage for CalibrationStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn process(&mut self, chunk: &mut VisChunk) -> IngestResult<()> {
        product_indices(&chunk.stokes)?;
        if chunk.stokes != self.stokes {
            debug!(products = ?chunk.stokes, "Polarisation products changed, clearing inverses");
            self.stokes = chunk.stokes.clone();
            self.inverses.clear();
        }

        let n_pols = chunk.n_pols();
        let mut input = vec![Complex64::new(0.0, 0.0); n_pols];
        let mut flags_in = vec![false; n_pols];

        for row in 0..chunk.n_rows() {
            let key = (
                chunk.antenna1[row],
                chunk.beam1[row],
                chunk.antenna2[row],
                chunk.beam2[row],
            );
            let inverse = self.inverse_for(key)?;

            let mut vis = chunk.visibility.index_axis_mut(Axis(0), row);
            let mut flags = chunk.flag.index_axis_mut(Axis(0), row);
            for (mut pols, mut pol_flags) in vis.outer_iter_mut().zip(flags.outer_iter_mut()) {
                for k in 0..n_pols {
                    let v = pols[k];
                    input[k] = Complex64::new(f64::from(v.re), f64::from(v.im));
                    flags_in[k] = pol_flags[k];
                }
                for i in 0..n_pols {
                    let mut out = Complex64::new(0.0, 0.0);
                    let mut flagged = flags_in[i];
                    for j in 0..n_pols {
                        let m = inverse[(i, j)];
                        out += m * input[j];
                        if j != i && flags_in[j] && m.norm() > 0.0 {
                            flagged = true;
                        }
                    }
                    pols[i] = Complex32::new(out.re as f32, out.im as f32);
                    pol_flags[i] = flagged;
                }
            }
        }
        Ok(())
    }
}
