//! Simulated telescope for running the pipeline without a correlator.
//!
//! [`Simulator`] produces one [`MetadataRecord`] and one [`VisibilityFrame`]
//! per rank for every cycle. The sky is a single unpolarised point source at
//! the phase centre, observed with the residual delay the correlator leaves
//! after compensating the local-zenith delay, so a `geometry` +
//! `fringe_rotation` chain brings the cross-correlations back to the source
//! amplitude.
//!
//! Two delivery modes are provided:
//!
//! - in-process: [`Simulator::feed`] / [`Simulator::spawn`] push straight into
//!   the input channels
//! - TCP: [`Simulator::serve_tcp`] plays the metadata bus and every rank over
//!   loopback sockets, exercising the real receivers and codecs

use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

use crate::astro::{self, SPEED_OF_LIGHT};
use crate::config::IngestConfig;
use crate::data::frame::{write_frame, write_length_prefixed, VisibilityFrame};
use crate::data::metadata::{AntennaMetadata, MetadataRecord};
use crate::data::vis_chunk::{Direction, Polarisation};
use crate::error::{IngestError, IngestResult};
use crate::ingest::layout::RowLayout;
use crate::ingest::{MetadataChannel, VisibilityChannel};
use crate::stages::fringe::unit_phasor;
use crate::stages::geometry::DelayCalculator;

/// Observation simulated by a [`Simulator`].
#[derive(Debug, Clone)]
pub struct SimulationParams {
    /// Timestamp of the first cycle, µs since MJD 0
    pub start: u64,
    /// Integration length in data time
    pub integration: Duration,
    /// Band centre frequency, Hz
    pub centre_freq: f64,
    /// Channel width, Hz
    pub channel_width: f64,
    /// J2000 phase centre, also the source position
    pub phase_centre: Direction,
    /// Source amplitude of the parallel-hand products
    pub amplitude: f32,
    /// Half-width of the uniform noise added to each component
    pub noise: f32,
    /// Antennas reported as flagged in every metadata record
    pub flagged_antennas: Vec<String>,
    /// Wall-clock pause between cycles when spawned
    pub pacing: Option<Duration>,
    /// RNG seed
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            // 2023-02-25T06:00:00Z
            start: astro::mjd_to_timestamp(60000.25),
            integration: Duration::from_secs(5),
            centre_freq: 1.4e9,
            channel_width: 1.0e6,
            phase_centre: Direction::from_degrees(294.854_275, -63.712_675),
            amplitude: 1.0,
            noise: 0.0,
            flagged_antennas: Vec::new(),
            pacing: None,
            seed: 0x5eed,
        }
    }
}

/// Source of synthetic metadata and correlator frames.
pub struct Simulator {
    params: SimulationParams,
    layout: RowLayout,
    antennas: Vec<String>,
    stokes: Vec<Polarisation>,
    rank_channels: Vec<usize>,
    calculator: DelayCalculator,
    reference_delays: Vec<f64>,
    rng: StdRng,
}

impl Simulator {
    /// Simulator matching the array and rank layout of `config`.
    pub fn new(config: &IngestConfig, params: SimulationParams) -> IngestResult<Self> {
        let calculator = DelayCalculator::from_array(&config.array)?;
        let reference_delays = calculator.antenna_delays(&calculator.zenith());
        Ok(Self {
            layout: RowLayout::from_config(&config.array),
            antennas: config.array.antennas.iter().map(|a| a.name.clone()).collect(),
            stokes: config.array.polarisation_products()?,
            rank_channels: config.visibility.ranks.iter().map(|r| r.channels).collect(),
            calculator,
            reference_delays,
            rng: StdRng::seed_from_u64(params.seed),
            params,
        })
    }

    /// Simulation parameters.
    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Timestamp of cycle `cycle` (0-based).
    #[must_use]
    pub fn timestamp(&self, cycle: u64) -> u64 {
        let step = u64::try_from(self.params.integration.as_micros()).unwrap_or(u64::MAX);
        self.params.start.saturating_add(step.saturating_mul(cycle))
    }

    /// Metadata record of cycle `cycle`.
    #[must_use]
    pub fn metadata(&self, cycle: u64) -> MetadataRecord {
        MetadataRecord {
            timestamp: self.timestamp(cycle),
            scan: 0,
            centre_freq: self.params.centre_freq,
            channel_width: self.params.channel_width,
            phase_centre: self.params.phase_centre,
            target_name: "simulated".into(),
            antennas: self
                .antennas
                .iter()
                .map(|name| AntennaMetadata {
                    name: name.clone(),
                    pointing: self.params.phase_centre,
                    on_source: true,
                    flagged: self.params.flagged_antennas.contains(name),
                })
                .collect(),
        }
    }

    /// Frames of every rank for cycle `cycle`, in rank order.
    pub fn frames(&mut self, cycle: u64) -> Vec<VisibilityFrame> {
        let record = self.metadata(cycle);
        let total: usize = self.rank_channels.iter().sum();
        let frequencies = record.channel_frequencies(total);

        let s = self
            .calculator
            .apparent(self.params.phase_centre, record.timestamp)
            .unit_vector();
        let geometric = self.calculator.antenna_delays(&s);
        let residual: Vec<f64> = geometric
            .iter()
            .zip(&self.reference_delays)
            .map(|(g, r)| (g - r) / SPEED_OF_LIGHT)
            .collect();

        let mut offset = 0;
        let rank_channels = self.rank_channels.clone();
        let mut frames = Vec::with_capacity(rank_channels.len());
        for (rank, &n_channels) in rank_channels.iter().enumerate() {
            let n = self.layout.len() * n_channels * self.stokes.len();
            let mut samples = Vec::with_capacity(n);
            for desc in self.layout.rows() {
                let tau = residual[desc.antenna2] - residual[desc.antenna1];
                for freq in &frequencies[offset..offset + n_channels] {
                    let fringe = unit_phasor(TAU * freq * tau);
                    for pol in &self.stokes {
                        let (r1, r2) = pol.receptors();
                        let signal = if r1 == r2 {
                            fringe * self.params.amplitude
                        } else {
                            Complex32::new(0.0, 0.0)
                        };
                        samples.push(signal);
                    }
                }
            }
            for sample in &mut samples {
                *sample += self.noise();
            }
            frames.push(VisibilityFrame {
                rank: rank as u32,
                timestamp: record.timestamp,
                n_rows: self.layout.len(),
                n_channels,
                n_pols: self.stokes.len(),
                samples,
                flags: vec![false; n],
            });
            offset += n_channels;
        }
        frames
    }

    fn noise(&mut self) -> Complex32 {
        let width = self.params.noise;
        if width <= 0.0 {
            return Complex32::new(0.0, 0.0);
        }
        Complex32::new(
            self.rng.gen_range(-width..=width),
            self.rng.gen_range(-width..=width),
        )
    }

    /// Push cycle `cycle` into the input channels, frames before metadata.
    pub fn feed(
        &mut self,
        cycle: u64,
        metadata: &MetadataChannel,
        visibility: &VisibilityChannel,
    ) -> IngestResult<()> {
        for (rank, frame) in self.frames(cycle).into_iter().enumerate() {
            visibility.push(rank, frame)?;
        }
        metadata.publish(self.metadata(cycle));
        Ok(())
    }

    /// Produce `cycles` cycles on a background thread.
    ///
    /// The producer waits while either channel is full, so no cycle is lost
    /// to overflow. The thread returns the number of cycles produced, which is
    /// smaller than `cycles` only when `stop` was raised.
    pub fn spawn(
        mut self,
        cycles: u64,
        metadata: Arc<MetadataChannel>,
        visibility: Arc<VisibilityChannel>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<IngestResult<u64>>> {
        std::thread::Builder::new()
            .name("simulator".into())
            .spawn(move || {
                info!(cycles, "Simulator started");
                for cycle in 0..cycles {
                    while !(metadata.has_room() && visibility.has_room()) {
                        if stop.load(Ordering::SeqCst) {
                            return Ok(cycle);
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    if stop.load(Ordering::SeqCst) {
                        return Ok(cycle);
                    }
                    self.feed(cycle, &metadata, &visibility)?;
                    debug!(cycle, "Simulated cycle produced");
                    if let Some(pause) = self.params.pacing {
                        std::thread::sleep(pause);
                    }
                }
                info!(cycles, "Simulator finished");
                Ok(cycles)
            })
    }

    /// Serve `cycles` cycles over loopback TCP.
    ///
    /// Binds one listener for the metadata bus and one per rank on ephemeral
    /// ports, then waits on a background thread for a subscriber and every
    /// rank connection before streaming. Sockets are closed after the last
    /// cycle.
    pub fn serve_tcp(self, cycles: u64) -> IngestResult<TcpSimulation> {
        let bus = TcpListener::bind("127.0.0.1:0")?;
        let ranks = (0..self.rank_channels.len())
            .map(|_| TcpListener::bind("127.0.0.1:0"))
            .collect::<std::io::Result<Vec<_>>>()?;

        let metadata_addr = bus.local_addr()?;
        let rank_addrs = ranks
            .iter()
            .map(TcpListener::local_addr)
            .collect::<std::io::Result<Vec<_>>>()?;
        info!(%metadata_addr, ranks = rank_addrs.len(), "Simulated correlator listening");

        let handle = std::thread::Builder::new()
            .name("simulator-tcp".into())
            .spawn(move || self.stream_tcp(cycles, bus, ranks))?;

        Ok(TcpSimulation {
            metadata_addr,
            rank_addrs,
            handle,
        })
    }

    fn stream_tcp(
        mut self,
        cycles: u64,
        bus: TcpListener,
        ranks: Vec<TcpListener>,
    ) -> IngestResult<u64> {
        let mut rank_streams = ranks
            .iter()
            .map(|listener| listener.accept().map(|(stream, _)| stream))
            .collect::<std::io::Result<Vec<TcpStream>>>()?;

        let (mut subscriber, peer) = bus.accept()?;
        let mut line = String::new();
        BufReader::new(subscriber.try_clone()?).read_line(&mut line)?;
        let topic = line
            .trim()
            .strip_prefix("SUBSCRIBE ")
            .ok_or_else(|| IngestError::Transport(format!("Unexpected handshake {:?}", line)))?;
        info!(%peer, topic, "Metadata subscriber connected");

        for cycle in 0..cycles {
            for (stream, frame) in rank_streams.iter_mut().zip(self.frames(cycle)) {
                write_frame(stream, &frame)?;
            }
            let record = serde_json::to_vec(&self.metadata(cycle))?;
            write_length_prefixed(&mut subscriber, &record)?;
            if let Some(pause) = self.params.pacing {
                std::thread::sleep(pause);
            }
        }
        Ok(cycles)
    }
}

/// Handle to a running [`Simulator::serve_tcp`] session.
pub struct TcpSimulation {
    /// Address of the simulated metadata bus
    pub metadata_addr: SocketAddr,
    /// Address of each simulated rank, in rank order
    pub rank_addrs: Vec<SocketAddr>,
    handle: JoinHandle<IngestResult<u64>>,
}

impl TcpSimulation {
    /// Point the metadata and visibility addresses of `config` at this session.
    pub fn configure(&self, config: &mut IngestConfig) {
        config.metadata.address = self.metadata_addr.to_string();
        for (rank, addr) in config.visibility.ranks.iter_mut().zip(&self.rank_addrs) {
            rank.address = addr.to_string();
        }
    }

    /// Wait for the session to finish; returns the number of cycles sent.
    pub fn join(self) -> IngestResult<u64> {
        self.handle
            .join()
            .map_err(|_| IngestError::Transport("Simulator thread panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::backoff::BackoffPolicy;
    use crate::ingest::{MetadataSubscriber, StreamMerger, VisibilityReceiver};
    use crate::pipeline::Stage;
    use crate::stages::{FringeRotationStage, GeometryStage};

    fn config() -> IngestConfig {
        let mut config = IngestConfig::from_toml_str(crate::config::tests::MINIMAL).unwrap();
        config.pipeline.poll_timeout_ms = 2_000;
        config.pipeline.frame_timeout_ms = 2_000;
        config
    }

    fn channels(config: &IngestConfig) -> (Arc<MetadataChannel>, Arc<VisibilityChannel>) {
        (
            Arc::new(MetadataChannel::new(config.metadata.buffer_size)),
            Arc::new(VisibilityChannel::from_config(&config.visibility)),
        )
    }

    #[test]
    fn timestamps_advance_by_integration() {
        let sim = Simulator::new(&config(), SimulationParams::default()).unwrap();
        assert_eq!(sim.timestamp(1) - sim.timestamp(0), 5_000_000);
        assert_eq!(sim.metadata(3).timestamp, sim.timestamp(3));
    }

    #[test]
    fn frames_match_configured_shape() {
        let config = config();
        let mut sim = Simulator::new(&config, SimulationParams::default()).unwrap();
        let frames = sim.frames(0);
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!((frame.n_rows, frame.n_channels, frame.n_pols), (3, 4, 2));
            frame.check_dimensions().unwrap();
        }
    }

    #[test]
    fn fringe_stopping_recovers_source_amplitude() {
        let config = config();
        let (md, vis) = channels(&config);
        let mut sim = Simulator::new(&config, SimulationParams::default()).unwrap();
        sim.feed(0, &md, &vis).unwrap();

        let mut merger = StreamMerger::new(&config, md, vis).unwrap();
        let mut chunk = merger.next().unwrap().unwrap();

        let calculator = Arc::new(DelayCalculator::from_array(&config.array).unwrap());
        GeometryStage::new(Arc::clone(&calculator))
            .process(&mut chunk)
            .unwrap();

        // the raw cross-correlation is rotating
        let cross = 1;
        assert_eq!((chunk.antenna1[cross], chunk.antenna2[cross]), (0, 1));
        let raw = chunk.visibility[[cross, 0, 0]];
        assert!((raw.norm() - 1.0).abs() < 1e-5);

        let params = toml::Table::new();
        let ctx = crate::pipeline::StageContext::new(
            config.array.clone(),
            Arc::new(crate::monitoring::MonitoringStore::new()),
        )
        .unwrap();
        FringeRotationStage::from_params(&params, &ctx)
            .unwrap()
            .process(&mut chunk)
            .unwrap();

        for v in chunk.visibility.iter() {
            assert!((v.re - 1.0).abs() < 1e-4, "{}", v);
            assert!(v.im.abs() < 1e-4, "{}", v);
        }
    }

    #[test]
    fn flagged_antennas_are_reported_in_metadata() {
        let params = SimulationParams {
            flagged_antennas: vec!["ak02".into()],
            ..SimulationParams::default()
        };
        let sim = Simulator::new(&config(), params).unwrap();
        let record = sim.metadata(0);
        assert!(!record.antenna("ak01").unwrap().flagged);
        assert!(record.antenna("ak02").unwrap().flagged);
    }

    #[test]
    fn spawned_producer_never_overflows() {
        let mut config = config();
        config.metadata.buffer_size = 2;
        let (md, vis) = channels(&config);
        let stop = Arc::new(AtomicBool::new(false));
        let sim = Simulator::new(&config, SimulationParams::default()).unwrap();
        let handle = sim
            .spawn(6, Arc::clone(&md), Arc::clone(&vis), Arc::clone(&stop))
            .unwrap();

        let mut merger = StreamMerger::new(&config, Arc::clone(&md), Arc::clone(&vis)).unwrap();
        let mut timestamps = Vec::new();
        while timestamps.len() < 6 {
            if let Some(chunk) = merger.next().unwrap() {
                timestamps.push(chunk.timestamp);
            }
        }
        assert_eq!(handle.join().unwrap().unwrap(), 6);
        assert_eq!(md.dropped(), 0);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn tcp_session_feeds_real_receivers() {
        let mut config = config();
        let sim = Simulator::new(&config, SimulationParams::default()).unwrap();
        let session = sim.serve_tcp(3).unwrap();
        session.configure(&mut config);

        let (md, vis) = channels(&config);
        let stop = Arc::new(AtomicBool::new(false));
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            max_attempts: 50,
            jitter: false,
        };

        let mut receivers = vec![MetadataSubscriber::new(&config.metadata)
            .with_policy(policy.clone())
            .spawn(Arc::clone(&md), Arc::clone(&stop))
            .unwrap()];
        for receiver in VisibilityReceiver::from_config(&config.visibility) {
            receivers.push(
                receiver
                    .with_policy(policy.clone())
                    .spawn(Arc::clone(&vis), Arc::clone(&stop))
                    .unwrap(),
            );
        }

        let mut merger = StreamMerger::new(&config, Arc::clone(&md), Arc::clone(&vis)).unwrap();
        let mut chunks = Vec::new();
        while chunks.len() < 3 {
            if let Some(chunk) = merger.next().unwrap() {
                chunks.push(chunk);
            }
        }
        assert_eq!(session.join().unwrap(), 3);
        stop.store(true, Ordering::SeqCst);
        for handle in receivers {
            handle.join().unwrap();
        }

        assert_eq!(chunks[0].n_channels(), 8);
        assert!(chunks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
