//! Metadata bus subscription.
//!
//! The bus delivers one [`MetadataRecord`] per integration cycle. Records are
//! buffered in a [`BoundedQueue`]; if the pipeline lags, the oldest record is
//! dropped.
//!
//! # Wire protocol
//! The subscriber connects, sends `SUBSCRIBE <topic>\n`, then receives
//! length-prefixed JSON records until the bus closes the connection.

use parking_lot::Mutex;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MetadataConfig;
use crate::data::bounded_queue::BoundedQueue;
use crate::data::frame::read_length_prefixed;
use crate::data::metadata::MetadataRecord;
use crate::error::{IngestError, IngestResult};
use crate::ingest::backoff::{run_with_reconnect, BackoffPolicy};

/// Buffered metadata records awaiting the merger.
pub struct MetadataChannel {
    queue: BoundedQueue<MetadataRecord>,
    received: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl MetadataChannel {
    /// Create a channel buffering up to `buffer_size` records.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            queue: BoundedQueue::new(buffer_size),
            received: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }

    /// Subscriber callback: buffer one delivered record.
    pub fn publish(&self, record: MetadataRecord) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let timestamp = record.timestamp;
        if self.queue.push(record) {
            warn!(timestamp, "Metadata buffer full, oldest record dropped");
        }
    }

    /// Wait for the next record. `None` on timeout.
    pub fn next(&self, timeout: Option<Duration>) -> Option<MetadataRecord> {
        self.queue.pop(timeout)
    }

    /// Records delivered since creation.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Records dropped by buffer overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Whether another record can be buffered without evicting one.
    pub fn has_room(&self) -> bool {
        self.queue.len() < self.queue.capacity()
    }

    /// Record that the receiver stopped on an unrecoverable error.
    pub fn report_failure(&self, err: &IngestError) {
        *self.failure.lock() = Some(err.to_string());
    }

    /// The receiver's unrecoverable error, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

/// TCP subscriber feeding a [`MetadataChannel`].
#[derive(Debug, Clone)]
pub struct MetadataSubscriber {
    address: String,
    topic: String,
    policy: BackoffPolicy,
}

impl MetadataSubscriber {
    /// Subscriber for the configured bus address and topic.
    pub fn new(config: &MetadataConfig) -> Self {
        Self {
            address: config.address.clone(),
            topic: config.topic.clone(),
            policy: BackoffPolicy::default(),
        }
    }

    /// Override the reconnect policy.
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start the receiver thread.
    pub fn spawn(
        self,
        channel: Arc<MetadataChannel>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("metadata-rx".into())
            .spawn(move || {
                let result = run_with_reconnect("metadata", &self.policy, &stop, |connected| {
                    self.session(&channel, connected)
                });
                if let Err(err) = result {
                    error!(error = %err, "Metadata receiver stopped");
                    channel.report_failure(&err);
                }
            })
    }

    fn session(&self, channel: &MetadataChannel, connected: &mut bool) -> IngestResult<()> {
        let mut stream = TcpStream::connect(&self.address).map_err(|e| {
            IngestError::Transport(format!("connect to metadata bus {}: {}", self.address, e))
        })?;
        stream
            .write_all(format!("SUBSCRIBE {}\n", self.topic).as_bytes())
            .map_err(|e| IngestError::Transport(format!("subscribe to {}: {}", self.topic, e)))?;
        *connected = true;
        info!(address = %self.address, topic = %self.topic, "Subscribed to metadata bus");

        while let Some(payload) = read_length_prefixed(&mut stream)? {
            let record: MetadataRecord = serde_json::from_slice(&payload)
                .map_err(|e| IngestError::Codec(format!("metadata record: {}", e)))?;
            debug!(timestamp = record.timestamp, scan = record.scan, "Metadata received");
            channel.publish(record);
        }
        Ok(())
    }
}
