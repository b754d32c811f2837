//! Consumers of fully processed chunks.

use std::sync::mpsc;
use tracing::info;

use crate::data::vis_chunk::VisChunk;
use crate::error::{IngestError, IngestResult};

/// Final consumer of each processed chunk, called in cycle order.
pub trait Sink: Send {
    /// Take ownership of one processed chunk.
    fn consume(&mut self, chunk: VisChunk) -> IngestResult<()>;
}

/// Logs a one-line summary of each chunk.
#[derive(Debug, Default)]
pub struct LoggingSink {
    count: u64,
}

impl LoggingSink {
    /// Chunks consumed so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Sink for LoggingSink {
    fn consume(&mut self, chunk: VisChunk) -> IngestResult<()> {
        self.count += 1;
        info!(
            cycle = self.count,
            timestamp_us = chunk.timestamp,
            scan = chunk.scan,
            rows = chunk.n_rows(),
            channels = chunk.n_channels(),
            flagged = format!("{:.3}", chunk.flagged_fraction()),
            "Chunk complete"
        );
        Ok(())
    }
}

/// Forwards chunks to a receiver on another thread.
pub struct ChannelSink {
    tx: mpsc::Sender<VisChunk>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes its output.
    pub fn new() -> (Self, mpsc::Receiver<VisChunk>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn consume(&mut self, chunk: VisChunk) -> IngestResult<()> {
        self.tx
            .send(chunk)
            .map_err(|_| IngestError::Transport("Sink receiver dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::vis_chunk::Polarisation;

    #[test]
    fn channel_sink_forwards_in_order() {
        let (mut sink, rx) = ChannelSink::new();
        for ts in [10, 20, 30] {
            let mut chunk = VisChunk::new(1, 1, vec![Polarisation::XX]);
            chunk.timestamp = ts;
            sink.consume(chunk).unwrap();
        }
        let got: Vec<u64> = rx.try_iter().map(|c| c.timestamp).collect();
        assert_eq!(got, vec![10, 20, 30]);
    }

    #[test]
    fn channel_sink_reports_dropped_receiver() {
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);
        let chunk = VisChunk::new(1, 1, vec![Polarisation::XX]);
        assert!(matches!(sink.consume(chunk), Err(IngestError::Transport(_))));
    }

    #[test]
    fn logging_sink_counts() {
        let mut sink = LoggingSink::default();
        sink.consume(VisChunk::new(1, 1, vec![Polarisation::XX])).unwrap();
        assert_eq!(sink.count(), 1);
    }
}
