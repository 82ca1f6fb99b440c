//! Recording configuration

use std::time::Duration;

use crate::amf::AmfValue;
use crate::error::{Error, Result};
use crate::media::flv::{CODEC_AVC, SOUND_FORMAT_AAC};

/// Audio capture/encode options
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Target bitrate in bits/sec
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bitrate: 32_000,
        }
    }
}

/// Immutable per-recording settings
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,

    /// Target video bitrate in bits/sec
    pub bitrate: u32,

    pub frame_rate: u32,

    /// Maximum distance between key frames
    pub keyframe_interval: Duration,

    /// Output DPI scaling factor of the virtual display
    pub dpi: u32,

    /// `None` records video only
    pub audio: Option<AudioConfig>,

    /// Longest a single pull from the capture source may block
    pub poll_timeout: Duration,

    /// How long to wait for the encoder to flush on shutdown
    pub drain_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate: 500_000,
            frame_rate: 30,
            keyframe_interval: Duration::from_secs(10),
            dpi: 1,
            audio: Some(AudioConfig::default()),
            poll_timeout: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl StreamConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = fps;
        self
    }

    pub fn keyframe_interval(mut self, interval: Duration) -> Self {
        self.keyframe_interval = interval;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn audio(mut self, audio: Option<AudioConfig>) -> Self {
        self.audio = audio;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Reject settings no encoder could honor
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| Err(Error::Initialization(format!("invalid {}", what)));

        if self.width == 0 || self.height == 0 {
            return invalid("dimensions");
        }
        if self.bitrate == 0 {
            return invalid("bitrate");
        }
        if self.frame_rate == 0 {
            return invalid("frame rate");
        }
        if self.dpi == 0 {
            return invalid("dpi");
        }
        if let Some(audio) = &self.audio {
            if audio.sample_rate == 0 || audio.channels == 0 || audio.bitrate == 0 {
                return invalid("audio config");
            }
        }
        Ok(())
    }

    /// `onMetaData` describing this stream
    pub fn metadata(&self) -> AmfValue {
        let mut props: Vec<(&str, AmfValue)> = vec![
            ("width", f64::from(self.width).into()),
            ("height", f64::from(self.height).into()),
            ("framerate", f64::from(self.frame_rate).into()),
            ("videodatarate", (f64::from(self.bitrate) / 1000.0).into()),
            ("videocodecid", f64::from(CODEC_AVC).into()),
        ];
        if let Some(audio) = &self.audio {
            props.push(("audiodatarate", (f64::from(audio.bitrate) / 1000.0).into()));
            props.push(("audiosamplerate", f64::from(audio.sample_rate).into()));
            props.push(("audiosamplesize", AmfValue::from(16.0)));
            props.push(("stereo", (audio.channels > 1).into()));
            props.push(("audiocodecid", f64::from(SOUND_FORMAT_AAC).into()));
        }
        AmfValue::ecma_array(props)
    }
}
