//! Encoded media samples
//!
//! An [`EncodedSample`] is one access unit as it leaves an encoder. It is
//! immutable once built and carries no reference back to its producer.

use bytes::Bytes;

/// What an encoded sample contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    VideoKeyFrame,
    VideoInterFrame,
    /// SPS/PPS (Annex B or AVCDecoderConfigurationRecord)
    VideoSequenceHeader,
    AudioFrame,
    /// AudioSpecificConfig
    AudioSequenceHeader,
}

/// Media track a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

impl SampleKind {
    pub fn track(self) -> Track {
        match self {
            SampleKind::VideoKeyFrame
            | SampleKind::VideoInterFrame
            | SampleKind::VideoSequenceHeader => Track::Video,
            SampleKind::AudioFrame | SampleKind::AudioSequenceHeader => Track::Audio,
        }
    }

    pub fn is_video(self) -> bool {
        self.track() == Track::Video
    }

    pub fn is_audio(self) -> bool {
        self.track() == Track::Audio
    }

    pub fn is_sequence_header(self) -> bool {
        matches!(
            self,
            SampleKind::VideoSequenceHeader | SampleKind::AudioSequenceHeader
        )
    }

    /// Sequence header kind for this sample's track
    pub fn header_kind(self) -> SampleKind {
        match self.track() {
            Track::Video => SampleKind::VideoSequenceHeader,
            Track::Audio => SampleKind::AudioSequenceHeader,
        }
    }
}

/// Per-sample flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    /// Last sample of the stream; the payload is empty
    pub end_of_stream: bool,
}

/// One timestamped unit of encoded media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub payload: Bytes,
    /// Presentation time in microseconds, relative to stream start
    pub pts_us: u64,
    pub kind: SampleKind,
    pub flags: SampleFlags,
}

impl EncodedSample {
    pub fn new(kind: SampleKind, payload: impl Into<Bytes>, pts_us: u64) -> Self {
        Self {
            payload: payload.into(),
            pts_us,
            kind,
            flags: SampleFlags::default(),
        }
    }

    /// End-of-stream marker emitted by the recorder after draining
    pub fn end_of_stream(pts_us: u64) -> Self {
        Self {
            payload: Bytes::new(),
            pts_us,
            kind: SampleKind::VideoInterFrame,
            flags: SampleFlags {
                end_of_stream: true,
            },
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.end_of_stream
    }

    pub fn is_sequence_header(&self) -> bool {
        !self.flags.end_of_stream && self.kind.is_sequence_header()
    }

    /// Presentation time in milliseconds as carried in FLV tags.
    /// FLV timestamps are 32-bit and wrap after ~49 days.
    pub fn timestamp_ms(&self) -> u32 {
        (self.pts_us / 1000) as u32
    }
}
