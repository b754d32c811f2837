//! Per-rank visibility streams.
//!
//! Each correlator rank has its own point-to-point connection and its own
//! [`BoundedQueue`], so a slow or silent rank never evicts another rank's
//! frames.

use parking_lot::Mutex;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, trace, warn};

use crate::config::VisibilityConfig;
use crate::data::bounded_queue::BoundedQueue;
use crate::data::frame::{read_frame, VisibilityFrame};
use crate::error::{IngestError, IngestResult};
use crate::ingest::backoff::{run_with_reconnect, BackoffPolicy};

/// Buffered frames for every rank.
pub struct VisibilityChannel {
    ranks: Vec<BoundedQueue<VisibilityFrame>>,
    failure: Mutex<Option<String>>,
}

impl VisibilityChannel {
    /// One queue per entry of `buffer_sizes`.
    pub fn new(buffer_sizes: &[usize]) -> Self {
        Self {
            ranks: buffer_sizes.iter().map(|&n| BoundedQueue::new(n)).collect(),
            failure: Mutex::new(None),
        }
    }

    /// Queues sized from the visibility configuration.
    pub fn from_config(config: &VisibilityConfig) -> Self {
        let sizes: Vec<usize> = config.ranks.iter().map(|r| r.buffer_size).collect();
        Self::new(&sizes)
    }

    /// Number of ranks.
    pub fn n_ranks(&self) -> usize {
        self.ranks.len()
    }

    /// Buffer a frame received on `rank`'s connection.
    pub fn push(&self, rank: usize, frame: VisibilityFrame) -> IngestResult<()> {
        let queue = self.ranks.get(rank).ok_or_else(|| {
            IngestError::DataIntegrity(format!(
                "Frame for rank {} but only {} ranks are configured",
                rank,
                self.ranks.len()
            ))
        })?;
        let timestamp = frame.timestamp;
        if queue.push(frame) {
            warn!(rank, timestamp, "Visibility buffer full, oldest frame dropped");
        }
        Ok(())
    }

    /// Wait for the next frame from `rank`. `None` on timeout or unknown rank.
    pub fn next(&self, rank: usize, timeout: Option<Duration>) -> Option<VisibilityFrame> {
        self.ranks.get(rank)?.pop(timeout)
    }

    /// Whether every rank can buffer another frame without evicting one.
    pub fn has_room(&self) -> bool {
        self.ranks.iter().all(|q| q.len() < q.capacity())
    }

    /// Frames dropped by overflow, per rank.
    pub fn dropped(&self) -> Vec<u64> {
        self.ranks.iter().map(BoundedQueue::dropped).collect()
    }

    /// Record that a receiver stopped on an unrecoverable error.
    pub fn report_failure(&self, rank: usize, err: &IngestError) {
        *self.failure.lock() = Some(format!("rank {}: {}", rank, err));
    }

    /// The first unrecoverable receiver error, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

/// TCP reader for one rank.
#[derive(Debug, Clone)]
pub struct VisibilityReceiver {
    rank: usize,
    address: String,
    policy: BackoffPolicy,
}

impl VisibilityReceiver {
    /// Reader for `rank` streaming from `address`.
    pub fn new(rank: usize, address: impl Into<String>) -> Self {
        Self {
            rank,
            address: address.into(),
            policy: BackoffPolicy::default(),
        }
    }

    /// One receiver per configured rank.
    pub fn from_config(config: &VisibilityConfig) -> Vec<Self> {
        config
            .ranks
            .iter()
            .enumerate()
            .map(|(rank, cfg)| Self::new(rank, cfg.address.clone()))
            .collect()
    }

    /// Override the reconnect policy.
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start the receiver thread.
    pub fn spawn(
        self,
        channel: Arc<VisibilityChannel>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("vis-rx-{}", self.rank))
            .spawn(move || {
                let name = format!("visibility rank {}", self.rank);
                let result = run_with_reconnect(&name, &self.policy, &stop, |connected| {
                    self.session(&channel, connected)
                });
                if let Err(err) = result {
                    error!(rank = self.rank, error = %err, "Visibility receiver stopped");
                    channel.report_failure(self.rank, &err);
                }
            })
    }

    fn session(&self, channel: &VisibilityChannel, connected: &mut bool) -> IngestResult<()> {
        let mut stream = TcpStream::connect(&self.address).map_err(|e| {
            IngestError::Transport(format!(
                "connect to rank {} at {}: {}",
                self.rank, self.address, e
            ))
        })?;
        *connected = true;
        info!(rank = self.rank, address = %self.address, "Visibility stream connected");

        while let Some(frame) = read_frame(&mut stream)? {
            trace!(rank = self.rank, timestamp = frame.timestamp, "Frame received");
            channel.push(self.rank, frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(rank: u32, timestamp: u64) -> VisibilityFrame {
        VisibilityFrame {
            rank,
            timestamp,
            n_rows: 0,
            n_channels: 0,
            n_pols: 0,
            samples: vec![],
            flags: vec![],
        }
    }

    #[test]
    fn ranks_are_buffered_independently() {
        let channel = VisibilityChannel::new(&[1, 4]);
        channel.push(0, frame(0, 1)).unwrap();
        channel.push(0, frame(0, 2)).unwrap();
        channel.push(1, frame(1, 1)).unwrap();
        channel.push(1, frame(1, 2)).unwrap();

        assert_eq!(channel.dropped(), vec![1, 0]);
        assert_eq!(channel.next(0, Some(Duration::ZERO)).map(|f| f.timestamp), Some(2));
        assert_eq!(channel.next(1, Some(Duration::ZERO)).map(|f| f.timestamp), Some(1));
    }

    #[test]
    fn unknown_rank_is_rejected() {
        let channel = VisibilityChannel::new(&[1]);
        assert!(matches!(
            channel.push(3, frame(3, 0)),
            Err(IngestError::DataIntegrity(_))
        ));
        assert!(channel.next(3, Some(Duration::ZERO)).is_none());
    }
}
