//! Encoder collaborator
//!
//! The hardware encoder is a black box: raw frames go in, encoded access
//! units come out some time later. Output is polled, never pushed, so the
//! recorder thread decides when to block.

use bytes::Bytes;

use crate::error::Result;
use crate::media::Track;
use crate::recorder::config::StreamConfig;
use crate::recorder::source::{AudioChunk, VideoFrame};

/// One encoded buffer as reported by the encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub track: Track,
    pub data: Bytes,
    /// Encoder timestamp in microseconds (same epoch as the input)
    pub pts_us: u64,
    pub keyframe: bool,
    /// Codec-specific configuration (SPS/PPS, AudioSpecificConfig)
    pub codec_config: bool,
}

impl EncodedPacket {
    pub fn new(track: Track, data: impl Into<Bytes>, pts_us: u64) -> Self {
        Self {
            track,
            data: data.into(),
            pts_us,
            keyframe: false,
            codec_config: false,
        }
    }

    pub fn keyframe(mut self) -> Self {
        self.keyframe = true;
        self
    }

    pub fn codec_config(mut self) -> Self {
        self.codec_config = true;
        self
    }
}

/// Result of a non-blocking output poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderPoll {
    Packet(EncodedPacket),
    /// Nothing ready right now
    TryAgain,
    /// All input after end-of-input has been flushed
    EndOfStream,
}

pub trait MediaEncoder: Send {
    /// Set up the codec(s). Failures abort `Recorder::start`.
    fn configure(&mut self, config: &StreamConfig) -> Result<()>;

    fn queue_video(&mut self, frame: VideoFrame) -> Result<()>;

    fn queue_audio(&mut self, chunk: AudioChunk) -> Result<()>;

    /// No more input will follow; flush and eventually report EOS
    fn signal_end_of_input(&mut self) -> Result<()>;

    /// Must not block
    fn poll_output(&mut self) -> Result<EncoderPoll>;

    /// Release codec resources. Called exactly once after a successful
    /// `configure`.
    fn release(&mut self);
}
