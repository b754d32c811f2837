//! Assembles one [`VisChunk`] per cycle from a metadata record and the
//! matching frame of every correlator rank.

use ndarray::s;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::IngestConfig;
use crate::data::frame::VisibilityFrame;
use crate::data::metadata::MetadataRecord;
use crate::data::vis_chunk::{Direction, Polarisation, VisChunk};
use crate::error::{IngestError, IngestResult};
use crate::ingest::layout::RowLayout;
use crate::ingest::metadata_channel::MetadataChannel;
use crate::ingest::visibility_channel::VisibilityChannel;

/// Metadata/visibility synchroniser.
///
/// Rank `r` contributes the contiguous channel block starting at the sum of
/// the channel counts of ranks `0..r`.
pub struct StreamMerger {
    metadata: Arc<MetadataChannel>,
    visibility: Arc<VisibilityChannel>,
    layout: RowLayout,
    antenna_names: Vec<String>,
    n_beams: usize,
    stokes: Vec<Polarisation>,
    rank_channels: Vec<usize>,
    poll_timeout: Option<Duration>,
    frame_timeout: Option<Duration>,
    tolerance_us: u64,
}

impl StreamMerger {
    /// Build a merger over already-created channels.
    pub fn new(
        config: &IngestConfig,
        metadata: Arc<MetadataChannel>,
        visibility: Arc<VisibilityChannel>,
    ) -> IngestResult<Self> {
        let rank_channels: Vec<usize> = config.visibility.ranks.iter().map(|r| r.channels).collect();
        if visibility.n_ranks() != rank_channels.len() {
            return Err(IngestError::Configuration(format!(
                "Visibility channel has {} ranks, configuration lists {}",
                visibility.n_ranks(),
                rank_channels.len()
            )));
        }

        Ok(Self {
            metadata,
            visibility,
            layout: RowLayout::from_config(&config.array),
            antenna_names: config.array.antennas.iter().map(|a| a.name.clone()).collect(),
            n_beams: config.array.n_beams,
            stokes: config.array.polarisation_products()?,
            rank_channels,
            poll_timeout: config.pipeline.poll_timeout(),
            frame_timeout: config.pipeline.frame_timeout(),
            tolerance_us: config.pipeline.timestamp_tolerance_us,
        })
    }

    /// Total channels across ranks.
    pub fn n_channels(&self) -> usize {
        self.rank_channels.iter().sum()
    }

    /// Rows per chunk.
    pub fn n_rows(&self) -> usize {
        self.layout.len()
    }

    /// Produce the next chunk.
    ///
    /// Returns `Ok(None)` when no metadata arrived within the poll timeout, so
    /// the caller can check for an abort request and call again.
    pub fn next(&mut self) -> IngestResult<Option<VisChunk>> {
        let Some(record) = self.metadata.next(self.poll_timeout) else {
            if let Some(failure) = self.metadata.failure() {
                return Err(IngestError::Transport(format!(
                    "metadata receiver stopped: {}",
                    failure
                )));
            }
            trace!("No metadata within poll timeout");
            return Ok(None);
        };
        debug!(timestamp = record.timestamp, scan = record.scan, "Merging cycle");

        let mut chunk = self.chunk_from_metadata(&record);

        let mut offset = 0;
        for rank in 0..self.rank_channels.len() {
            let frame = self.frame_for(rank)?;
            self.check_frame(rank, &frame, &record)?;
            self.copy_frame(&mut chunk, &frame, offset);
            offset += self.rank_channels[rank];
        }

        self.flag_from_metadata(&mut chunk, &record);
        chunk.validate(self.antenna_names.len(), self.n_beams)?;
        Ok(Some(chunk))
    }

    fn chunk_from_metadata(&self, record: &MetadataRecord) -> VisChunk {
        let mut chunk = VisChunk::new(self.layout.len(), self.n_channels(), self.stokes.clone());
        chunk.timestamp = record.timestamp;
        chunk.scan = record.scan;
        chunk.phase_centre = record.phase_centre;
        chunk.channel_width = record.channel_width;
        chunk.frequency = record.channel_frequencies(self.n_channels());

        for (row, desc) in self.layout.rows().iter().enumerate() {
            chunk.antenna1[row] = desc.antenna1;
            chunk.antenna2[row] = desc.antenna2;
            chunk.beam1[row] = desc.beam;
            chunk.beam2[row] = desc.beam;
            chunk.feed1[row] = desc.beam;
            chunk.feed2[row] = desc.beam;
            chunk.pointing_dir1[row] = self.pointing(record, desc.antenna1);
            chunk.pointing_dir2[row] = self.pointing(record, desc.antenna2);
        }
        chunk
    }

    fn pointing(&self, record: &MetadataRecord, antenna: usize) -> Direction {
        record
            .antenna(&self.antenna_names[antenna])
            .map(|a| a.pointing)
            .unwrap_or(record.phase_centre)
    }

    fn frame_for(&self, rank: usize) -> IngestResult<VisibilityFrame> {
        match self.visibility.next(rank, self.frame_timeout) {
            Some(frame) => Ok(frame),
            None => match self.visibility.failure() {
                Some(failure) => Err(IngestError::Transport(format!(
                    "visibility receiver stopped: {}",
                    failure
                ))),
                None => Err(IngestError::DataIntegrity(format!(
                    "No visibility frame from rank {} within {:?}",
                    rank, self.frame_timeout
                ))),
            },
        }
    }

    fn check_frame(
        &self,
        rank: usize,
        frame: &VisibilityFrame,
        record: &MetadataRecord,
    ) -> IngestResult<()> {
        if frame.rank as usize != rank {
            return Err(IngestError::DataIntegrity(format!(
                "Frame on rank {} connection claims rank {}",
                rank, frame.rank
            )));
        }
        let skew = frame.timestamp.abs_diff(record.timestamp);
        if skew > self.tolerance_us {
            return Err(IngestError::DataIntegrity(format!(
                "Rank {} frame timestamp {} differs from metadata timestamp {} by {} us",
                rank, frame.timestamp, record.timestamp, skew
            )));
        }
        let expected = (self.layout.len(), self.rank_channels[rank], self.stokes.len());
        let actual = (frame.n_rows, frame.n_channels, frame.n_pols);
        if actual != expected {
            return Err(IngestError::DataIntegrity(format!(
                "Rank {} frame shape {:?}, expected {:?}",
                rank, actual, expected
            )));
        }
        frame.check_dimensions()
    }

    fn copy_frame(&self, chunk: &mut VisChunk, frame: &VisibilityFrame, offset: usize) {
        let n_chan = frame.n_channels;
        let n_pol = frame.n_pols;
        let mut vis = chunk
            .visibility
            .slice_mut(s![.., offset..offset + n_chan, ..]);
        for ((row, chan, pol), v) in vis.indexed_iter_mut() {
            *v = frame.samples[(row * n_chan + chan) * n_pol + pol];
        }
        let mut flags = chunk.flag.slice_mut(s![.., offset..offset + n_chan, ..]);
        for ((row, chan, pol), f) in flags.indexed_iter_mut() {
            *f = frame.flags[(row * n_chan + chan) * n_pol + pol];
        }
    }

    fn flag_from_metadata(&self, chunk: &mut VisChunk, record: &MetadataRecord) {
        let unusable: Vec<bool> = self
            .antenna_names
            .iter()
            .map(|name| match record.antenna(name) {
                Some(a) => a.flagged || !a.on_source,
                None => true,
            })
            .collect();

        for (antenna, name) in self.antenna_names.iter().enumerate() {
            if unusable[antenna] {
                warn!(antenna = %name, timestamp = record.timestamp, "Antenna flagged by metadata");
            }
        }

        for row in 0..chunk.n_rows() {
            if unusable[chunk.antenna1[row]] || unusable[chunk.antenna2[row]] {
                chunk.flag_row(row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::metadata::AntennaMetadata;
    use num_complex::Complex32;

    fn config() -> IngestConfig {
        let mut config = IngestConfig::from_toml_str(crate::config::tests::MINIMAL).unwrap();
        config.pipeline.poll_timeout_ms = 10;
        config.pipeline.frame_timeout_ms = 10;
        config
    }

    fn record(timestamp: u64) -> MetadataRecord {
        MetadataRecord {
            timestamp,
            scan: 7,
            centre_freq: 1.0e9,
            channel_width: 1.0e6,
            phase_centre: Direction::from_degrees(10.0, -30.0),
            target_name: "src".into(),
            antennas: ["ak01", "ak02"]
                .iter()
                .map(|name| AntennaMetadata {
                    name: (*name).into(),
                    pointing: Direction::from_degrees(10.0, -30.0),
                    on_source: true,
                    flagged: false,
                })
                .collect(),
        }
    }

    /// Rows 3, channels 4, pols 2 per rank; sample value encodes its position.
    fn frame(rank: u32, timestamp: u64) -> VisibilityFrame {
        let (rows, chans, pols) = (3, 4, 2);
        let samples = (0..rows * chans * pols)
            .map(|i| Complex32::new(rank as f32, i as f32))
            .collect();
        VisibilityFrame {
            rank,
            timestamp,
            n_rows: rows,
            n_channels: chans,
            n_pols: pols,
            samples,
            flags: vec![false; rows * chans * pols],
        }
    }

    fn merger() -> (StreamMerger, Arc<MetadataChannel>, Arc<VisibilityChannel>) {
        let config = config();
        let md = Arc::new(MetadataChannel::new(4));
        let vis = Arc::new(VisibilityChannel::from_config(&config.visibility));
        let merger = StreamMerger::new(&config, Arc::clone(&md), Arc::clone(&vis)).unwrap();
        (merger, md, vis)
    }

    #[test]
    fn merges_ranks_into_contiguous_channels() {
        let (mut merger, md, vis) = merger();
        md.publish(record(1_000));
        vis.push(0, frame(0, 1_000)).unwrap();
        vis.push(1, frame(1, 1_000)).unwrap();

        let chunk = merger.next().unwrap().unwrap();
        assert_eq!(chunk.timestamp, 1_000);
        assert_eq!(chunk.scan, 7);
        assert_eq!(chunk.n_rows(), 3);
        assert_eq!(chunk.n_channels(), 8);
        assert_eq!(chunk.n_pols(), 2);
        assert_eq!(chunk.antenna1, vec![0, 0, 1]);
        assert_eq!(chunk.antenna2, vec![0, 1, 1]);

        // row 1, channel 5 (rank 1 channel 1), pol 1 -> index (1*4+1)*2+1 = 11
        assert_eq!(chunk.visibility[[1, 5, 1]], Complex32::new(1.0, 11.0));
        assert_eq!(chunk.visibility[[1, 1, 1]], Complex32::new(0.0, 11.0));
        assert_eq!(chunk.frequency[0], 1.0e9 - 3.5e6);
        assert_eq!(chunk.flagged_fraction(), 0.0);
    }

    #[test]
    fn empty_poll_is_not_an_error() {
        let (mut merger, _md, _vis) = merger();
        assert!(merger.next().unwrap().is_none());
    }

    #[test]
    fn timestamp_mismatch_is_data_integrity_error() {
        let (mut merger, md, vis) = merger();
        md.publish(record(1_000));
        vis.push(0, frame(0, 1_000)).unwrap();
        vis.push(1, frame(1, 6_000_000)).unwrap();
        assert!(matches!(
            merger.next(),
            Err(IngestError::DataIntegrity(_))
        ));
    }

    #[test]
    fn wrong_payload_size_is_data_integrity_error() {
        let (mut merger, md, vis) = merger();
        md.publish(record(1_000));
        let mut short = frame(0, 1_000);
        short.n_channels = 2;
        short.samples.truncate(12);
        short.flags.truncate(12);
        vis.push(0, short).unwrap();
        vis.push(1, frame(1, 1_000)).unwrap();
        assert!(matches!(
            merger.next(),
            Err(IngestError::DataIntegrity(_))
        ));
    }

    #[test]
    fn missing_rank_frame_is_data_integrity_error() {
        let (mut merger, md, vis) = merger();
        md.publish(record(1_000));
        vis.push(0, frame(0, 1_000)).unwrap();
        assert!(matches!(
            merger.next(),
            Err(IngestError::DataIntegrity(_))
        ));
    }

    #[test]
    fn metadata_flagged_antenna_flags_its_rows() {
        let (mut merger, md, vis) = merger();
        let mut rec = record(1_000);
        rec.antennas[1].flagged = true;
        md.publish(rec);
        vis.push(0, frame(0, 1_000)).unwrap();
        vis.push(1, frame(1, 1_000)).unwrap();

        let chunk = merger.next().unwrap().unwrap();
        // rows (0,0) clean; (0,1) and (1,1) flagged
        assert!(chunk.flag.slice(s![0, .., ..]).iter().all(|f| !f));
        assert!(chunk.flag.slice(s![1, .., ..]).iter().all(|&f| f));
        assert!(chunk.flag.slice(s![2, .., ..]).iter().all(|&f| f));
    }

    #[test]
    fn frame_claiming_another_rank_is_data_integrity_error() {
        let (mut merger, md, vis) = merger();
        md.publish(record(1_000));
        vis.push(0, frame(1, 1_000)).unwrap();
        vis.push(1, frame(1, 1_000)).unwrap();
        match merger.next() {
            Err(IngestError::DataIntegrity(msg)) => assert!(msg.contains("claims rank 1")),
            other => panic!("expected rank mismatch, got {:?}", other.map(|c| c.is_some())),
        }
    }

    #[test]
    fn off_source_antenna_flags_its_rows() {
        let (mut merger, md, vis) = merger();
        let mut rec = record(1_000);
        rec.antennas[0].on_source = false;
        md.publish(rec);
        vis.push(0, frame(0, 1_000)).unwrap();
        vis.push(1, frame(1, 1_000)).unwrap();

        let chunk = merger.next().unwrap().unwrap();
        // rows (0,0) and (0,1) flagged; (1,1) clean
        assert!(chunk.flag.slice(s![0, .., ..]).iter().all(|&f| f));
        assert!(chunk.flag.slice(s![1, .., ..]).iter().all(|&f| f));
        assert!(chunk.flag.slice(s![2, .., ..]).iter().all(|f| !f));
    }
}
