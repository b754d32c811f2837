//! Flag-aware spectral decimation.

use ndarray::Array3;
use num_complex::Complex32;
use serde::Deserialize;

use crate::data::vis_chunk::VisChunk;
use crate::error::{IngestError, IngestResult};
use crate::pipeline::{parse_params, Stage};

/// Parameters of the `channel_averaging` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AveragingParams {
    /// Number of input channels per output channel
    pub factor: usize,
}

/// Averages groups of `factor` adjacent channels.
///
/// Output frequency is the plain mean of the group. Output visibility is the
/// mean of the unflagged samples only; a group with no unflagged samples is
/// flagged and zero.
#[derive(Debug, Clone)]
pub struct ChannelAveragingStage {
    factor: usize,
}

impl ChannelAveragingStage {
    /// Stage type name used in configuration.
    pub const NAME: &'static str = "channel_averaging";

    /// Create a stage; `factor` must be at least 1.
    pub fn new(factor: usize) -> IngestResult<Self> {
        if factor == 0 {
            return Err(IngestError::Configuration(
                "Averaging factor must be at least 1".into(),
            ));
        }
        Ok(Self { factor })
    }

    /// Create a stage from its configuration table.
    pub fn from_params(params: &toml::Table) -> IngestResult<Self> {
        let params: AveragingParams = parse_params(Self::NAME, params)?;
        Self::new(params.factor)
    }

    /// Averaging factor.
    #[must_use]
    pub fn factor(&self) -> usize {
        self.factor
    }
}

impl Stage for ChannelAveragingStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn process(&mut self, chunk: &mut VisChunk) -> IngestResult<()> {
        let f = self.factor;
        if f == 1 {
            return Ok(());
        }
        let (n_rows, n_channels, n_pols) = chunk.visibility.dim();
        if n_channels % f != 0 {
            return Err(IngestError::Configuration(format!(
                "Averaging factor {} does not divide {} channels",
                f, n_channels
            )));
        }
        let n_out = n_channels / f;

        let mut visibility = Array3::<Complex32>::zeros((n_rows, n_out, n_pols));
        let mut flag = Array3::from_elem((n_rows, n_out, n_pols), false);

        for ((row, out, pol), value) in visibility.indexed_iter_mut() {
            let mut sum = Complex32::new(0.0, 0.0);
            let mut count = 0u32;
            for channel in out * f..(out + 1) * f {
                if !chunk.flag[[row, channel, pol]] {
                    sum += chunk.visibility[[row, channel, pol]];
                    count += 1;
                }
            }
            if count == 0 {
                flag[[row, out, pol]] = true;
            } else {
                *value = sum / count as f32;
            }
        }

        let frequency = chunk
            .frequency
            .chunks_exact(f)
            .map(|group| group.iter().sum::<f64>() / f as f64)
            .collect();

        chunk.visibility = visibility;
        chunk.flag = flag;
        chunk.frequency = frequency;
        chunk.channel_width *= f as f64;
        Ok(())
    }
}
