//! Capture source collaborator

use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::recorder::config::StreamConfig;

/// One raw video frame from the capture surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Pixel buffer (or an opaque surface handle serialized by the platform)
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Capture time in microseconds, any epoch
    pub pts_us: u64,
}

/// One chunk of raw PCM audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Bytes,
    pub pts_us: u64,
}

/// What a capture source yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Video(VideoFrame),
    Audio(AudioChunk),
    /// The source has nothing more to give
    EndOfStream,
}

/// Pull-style raw media source (screen capture, virtual display, mic).
///
/// Driven from the recorder thread only.
pub trait CaptureSource: Send {
    /// Acquire the capture handle. Failures abort `Recorder::start`.
    fn open(&mut self, config: &StreamConfig) -> Result<()>;

    /// Wait up to `timeout` for the next event. `Ok(None)` means nothing
    /// arrived in time.
    fn next(&mut self, timeout: Duration) -> Result<Option<CaptureEvent>>;

    /// Release the capture handle. Called exactly once after a successful
    /// `open`.
    fn close(&mut self);
}
