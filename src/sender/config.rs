//! Sender configuration

use std::time::Duration;

use crate::amf::AmfValue;
use crate::client::ClientConfig;

/// Streaming sender options
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum number of queued samples before the oldest are evicted
    pub queue_capacity: usize,

    /// Reconnect attempts after a transport failure before giving up
    pub max_reconnect_attempts: u32,

    /// Delay before the first reconnect attempt
    pub initial_backoff: Duration,

    /// Upper bound for the doubling backoff
    pub max_backoff: Duration,

    /// Capacity of the status event channel
    pub event_capacity: usize,

    /// Connection options for the RTMP session
    pub client: ClientConfig,

    /// `onMetaData` sent after every successful publish
    pub metadata: Option<AmfValue>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_reconnect_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            event_capacity: 64,
            client: ClientConfig::default(),
            metadata: None,
        }
    }
}

impl SenderConfig {
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the initial and maximum reconnect delay
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn metadata(mut self, metadata: AmfValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}
