//! Sender statistics
//!
//! Counters are updated from the sender task and from producer threads
//! (drops happen on enqueue), so they are atomics. `snapshot` turns them
//! into a plain [`SessionStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::media::FlvTag;

/// Point-in-time view of the sender counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Tags written to the transport
    pub tags_sent: u64,
    pub bytes_sent: u64,
    pub video_tags: u64,
    pub audio_tags: u64,
    pub keyframes: u64,
    /// Samples evicted from a full queue
    pub dropped_samples: u64,
    /// Frames the muxer discarded for lack of a sequence header
    pub dropped_unconfigured: u64,
    /// Reconnect attempts made (successful or not)
    pub reconnects: u64,
    /// Time since the counters were created
    pub duration: Duration,
    /// Average send rate in bits/sec
    pub bitrate: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples lost for any reason
    pub fn total_dropped(&self) -> u64 {
        self.dropped_samples + self.dropped_unconfigured
    }

    pub fn calculate_bitrate(&mut self) {
        let secs = self.duration.as_secs();
        if secs > 0 {
            self.bitrate = (self.bytes_sent * 8) / secs;
        }
    }
}

/// Live counters shared between the sender handle and its task
#[derive(Debug)]
pub struct SenderMetrics {
    started_at: Instant,
    tags_sent: AtomicU64,
    bytes_sent: AtomicU64,
    video_tags: AtomicU64,
    audio_tags: AtomicU64,
    keyframes: AtomicU64,
    dropped_samples: AtomicU64,
    dropped_unconfigured: AtomicU64,
    reconnects: AtomicU64,
}

impl SenderMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            tags_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            video_tags: AtomicU64::new(0),
            audio_tags: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
            dropped_samples: AtomicU64::new(0),
            dropped_unconfigured: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn record_tag(&self, tag: &FlvTag) {
        self.tags_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(tag.size() as u64, Ordering::Relaxed);
        if tag.is_video() {
            self.video_tags.fetch_add(1, Ordering::Relaxed);
            if tag.is_keyframe() && !tag.is_sequence_header() {
                self.keyframes.fetch_add(1, Ordering::Relaxed);
            }
        } else if tag.is_audio() {
            self.audio_tags.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped_samples.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_dropped_unconfigured(&self, count: u64) {
        self.dropped_unconfigured.store(count, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SessionStats {
        let mut stats = SessionStats {
            tags_sent: self.tags_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            video_tags: self.video_tags.load(Ordering::Relaxed),
            audio_tags: self.audio_tags.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            dropped_unconfigured: self.dropped_unconfigured.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            duration: self.started_at.elapsed(),
            bitrate: 0,
        };
        stats.calculate_bitrate();
        stats
    }
}

impl Default for SenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_session_stats_new() {
        let stats = SessionStats::new();
        assert_eq!(stats.tags_sent, 0);
        assert_eq!(stats.dropped_samples, 0);
        assert_eq!(stats.bitrate, 0);
    }

    #[test]
    fn test_calculate_bitrate() {
        let mut stats = SessionStats::new();
        stats.bytes_sent = 1_000_000;
        stats.duration = Duration::from_secs(10);
        stats.calculate_bitrate();
        assert_eq!(stats.bitrate, 800_000);

        let mut zero = SessionStats::new();
        zero.bytes_sent = 1_000_000;
        zero.calculate_bitrate();
        assert_eq!(zero.bitrate, 0);
    }

    #[test]
    fn test_record_tags() {
        let metrics = SenderMetrics::new();
        metrics.record_tag(&FlvTag::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0])));
        metrics.record_tag(&FlvTag::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0])));
        metrics.record_tag(&FlvTag::video(40, Bytes::from_static(&[0x27, 0x01, 0, 0, 0])));
        metrics.record_tag(&FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x01, 0x21])));

        let stats = metrics.snapshot();
        assert_eq!(stats.tags_sent, 4);
        assert_eq!(stats.video_tags, 3);
        assert_eq!(stats.audio_tags, 1);
        assert_eq!(stats.keyframes, 1);
        assert_eq!(stats.bytes_sent, 18);
    }

    #[test]
    fn test_drop_counters() {
        let metrics = SenderMetrics::new();
        metrics.record_dropped(3);
        metrics.record_dropped(2);
        metrics.set_dropped_unconfigured(4);
        metrics.record_reconnect();

        let stats = metrics.snapshot();
        assert_eq!(metrics.dropped_samples(), 5);
        assert_eq!(stats.total_dropped(), 9);
        assert_eq!(stats.reconnects, 1);
    }
}
