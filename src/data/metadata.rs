//! Telescope operating system metadata delivered once per integration cycle.

use serde::{Deserialize, Serialize};

use crate::data::vis_chunk::Direction;

/// Per-antenna state for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntennaMetadata {
    /// Antenna label, matching the array configuration
    pub name: String,
    /// Actual pointing direction
    pub pointing: Direction,
    /// Whether the antenna is tracking the target
    #[serde(default = "default_true")]
    pub on_source: bool,
    /// Whether the observatory flagged this antenna
    #[serde(default)]
    pub flagged: bool,
}

fn default_true() -> bool {
    true
}

/// Metadata for exactly one integration cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Integration midpoint, microseconds since MJD 0 (UTC)
    pub timestamp: u64,
    /// Scan identifier
    pub scan: u32,
    /// Centre sky frequency of the full band in Hz
    pub centre_freq: f64,
    /// Channel width in Hz
    pub channel_width: f64,
    /// Phase centre of the observation
    pub phase_centre: Direction,
    /// Target name
    #[serde(default)]
    pub target_name: String,
    /// Antenna state
    pub antennas: Vec<AntennaMetadata>,
}

impl MetadataRecord {
    /// Look up an antenna entry by label.
    #[must_use]
    pub fn antenna(&self, name: &str) -> Option<&AntennaMetadata> {
        self.antennas.iter().find(|a| a.name == name)
    }

    /// Sky frequencies of `n_channels` contiguous channels centred on
    /// `centre_freq`.
    #[must_use]
    pub fn channel_frequencies(&self, n_channels: usize) -> Vec<f64> {
        let half = n_channels as f64 / 2.0;
        (0..n_channels)
            .map(|i| self.centre_freq + (i as f64 - half + 0.5) * self.channel_width)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MetadataRecord {
        MetadataRecord {
            timestamp: 5_000_000,
            scan: 3,
            centre_freq: 1.0e9,
            channel_width: 1.0e6,
            phase_centre: Direction::default(),
            target_name: "1934-638".into(),
            antennas: vec![AntennaMetadata {
                name: "ak01".into(),
                pointing: Direction::default(),
                on_source: true,
                flagged: false,
            }],
        }
    }

    #[test]
    fn channel_frequencies_are_centred() {
        let freqs = record().channel_frequencies(4);
        assert_eq!(freqs, vec![998.5e6, 999.5e6, 1000.5e6, 1001.5e6]);
    }

    #[test]
    fn json_defaults_apply() {
        let json = r#"{
            "timestamp": 1, "scan": 0, "centre_freq": 1.0, "channel_width": 1.0,
            "phase_centre": {"ra": 0.0, "dec": 0.0},
            "antennas": [{"name": "ak01", "pointing": {"ra": 0.0, "dec": 0.0}}]
        }"#;
        let parsed: MetadataRecord = serde_json::from_str(json).unwrap();
        assert!(parsed.antennas[0].on_source);
        assert!(!parsed.antennas[0].flagged);
        assert!(parsed.antenna("ak01").is_some());
        assert!(parsed.antenna("ak02").is_none());
    }
}
