//! Per-antenna complex gains and polarisation leakages.
//!
//! Table files are TOML:
//!
//! ```toml
//! [[gains]]
//! antenna = "ak01"
//! beam = 0
//! pol = "X"
//! value = [0.98, 0.02]     # re, im
//!
//! [[leakages]]
//! antenna = "ak01"
//! d_xy = [0.01, 0.0]
//! d_yx = [-0.01, 0.0]
//! ```

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::config::ArrayConfig;
use crate::error::{IngestError, IngestResult};

/// A single receptor of a linear feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Receptor {
    /// X dipole
    X,
    /// Y dipole
    Y,
}

impl Receptor {
    /// Receptor by index (0 = X, 1 = Y).
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            Receptor::X
        } else {
            Receptor::Y
        }
    }
}

/// One gain entry of a table file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GainEntry {
    /// Antenna label
    pub antenna: String,
    /// Beam index
    #[serde(default)]
    pub beam: usize,
    /// Receptor
    pub pol: Receptor,
    /// Complex gain as `[re, im]`
    pub value: [f64; 2],
}

/// One leakage entry of a table file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeakageEntry {
    /// Antenna label
    pub antenna: String,
    /// Beam index
    #[serde(default)]
    pub beam: usize,
    /// Leakage of Y into X as `[re, im]`
    #[serde(default)]
    pub d_xy: [f64; 2],
    /// Leakage of X into Y as `[re, im]`
    #[serde(default)]
    pub d_yx: [f64; 2],
}

/// On-disk layout of a gain table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GainTableFile {
    /// Gain entries
    #[serde(default)]
    pub gains: Vec<GainEntry>,
    /// Leakage entries
    #[serde(default)]
    pub leakages: Vec<LeakageEntry>,
}

/// Read-only gain lookup keyed by (antenna, beam, receptor).
#[derive(Debug, Clone, Default)]
pub struct GainTable {
    gains: HashMap<(usize, usize, Receptor), Complex64>,
    leakages: HashMap<(usize, usize), [Complex64; 2]>,
}

impl GainTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table file, resolving antenna labels against the array.
    pub fn load<P: AsRef<Path>>(path: P, array: &ArrayConfig) -> IngestResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            IngestError::Configuration(format!(
                "Cannot read gain table {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let file: GainTableFile = toml::from_str(&text)?;
        let mut table = Self::new();
        table.extend(&file, array)?;
        info!(
            path = %path.as_ref().display(),
            gains = table.len(),
            leakages = table.leakages.len(),
            "Gain table loaded"
        );
        Ok(table)
    }

    /// Add (or overwrite) entries from a parsed table.
    pub fn extend(&mut self, file: &GainTableFile, array: &ArrayConfig) -> IngestResult<()> {
        for entry in &file.gains {
            let antenna = resolve(array, &entry.antenna, entry.beam)?;
            let [re, im] = entry.value;
            self.set_gain(antenna, entry.beam, entry.pol, Complex64::new(re, im));
        }
        for entry in &file.leakages {
            let antenna = resolve(array, &entry.antenna, entry.beam)?;
            let d_xy = Complex64::new(entry.d_xy[0], entry.d_xy[1]);
            let d_yx = Complex64::new(entry.d_yx[0], entry.d_yx[1]);
            self.set_leakage(antenna, entry.beam, d_xy, d_yx);
        }
        Ok(())
    }

    /// Set one gain.
    pub fn set_gain(&mut self, antenna: usize, beam: usize, receptor: Receptor, gain: Complex64) {
        self.gains.insert((antenna, beam, receptor), gain);
    }

    /// Set the leakages of one antenna/beam.
    pub fn set_leakage(&mut self, antenna: usize, beam: usize, d_xy: Complex64, d_yx: Complex64) {
        self.leakages.insert((antenna, beam), [d_xy, d_yx]);
    }

    /// Gain of one receptor, if present.
    #[must_use]
    pub fn gain(&self, antenna: usize, beam: usize, receptor: Receptor) -> Option<Complex64> {
        self.gains.get(&(antenna, beam, receptor)).copied()
    }

    /// Leakages `[d_xy, d_yx]`, zero when absent.
    #[must_use]
    pub fn leakage(&self, antenna: usize, beam: usize) -> [Complex64; 2] {
        self.leakages
            .get(&(antenna, beam))
            .copied()
            .unwrap_or([Complex64::new(0.0, 0.0); 2])
    }

    /// Number of gain entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gains.len()
    }

    /// Whether the table holds no gains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gains.is_empty()
    }

    /// Jones matrix `G·D` of one antenna/beam.
    ///
    /// Only rows of receptors flagged in `needed` are filled; a missing gain
    /// for a needed receptor is a configuration error.
    pub fn jones(
        &self,
        antenna: usize,
        beam: usize,
        needed: [bool; 2],
    ) -> IngestResult<[[Complex64; 2]; 2]> {
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        let [d_xy, d_yx] = self.leakage(antenna, beam);
        let d = [[one, d_xy], [d_yx, one]];

        let mut jones = [[zero; 2]; 2];
        for p in 0..2 {
            if !needed[p] {
                continue;
            }
            let receptor = Receptor::from_index(p);
            let g = self.gain(antenna, beam, receptor).ok_or_else(|| {
                IngestError::Configuration(format!(
                    "No gain for antenna {} beam {} receptor {:?}",
                    antenna, beam, receptor
                ))
            })?;
            jones[p] = [g * d[p][0], g * d[p][1]];
        }
        Ok(jones)
    }
}

fn resolve(array: &ArrayConfig, antenna: &str, beam: usize) -> IngestResult<usize> {
    let index = array.antenna_index(antenna).ok_or_else(|| {
        IngestError::Configuration(format!("Gain table names unknown antenna '{}'", antenna))
    })?;
    if beam >= array.n_beams {
        return Err(IngestError::Configuration(format!(
            "Gain table beam {} outside the {} configured beams",
            beam, array.n_beams
        )));
    }
    Ok(index)
}
