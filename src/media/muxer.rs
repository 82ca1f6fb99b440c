//! EncodedSample to FLV tag muxing
//!
//! The muxer is almost stateless: it caches the last sequence header of
//! each track and remembers whether that header already went out on the
//! current session. [`FlvMuxer::reset`] starts a new session, after which
//! [`FlvMuxer::session_headers`] yields the cached headers to resend before
//! any frame.

use bytes::{Bytes, BytesMut};

use crate::error::{MediaError, Result};
use crate::media::aac::{self, AudioSpecificConfig};
use crate::media::flv::FlvTag;
use crate::media::h264::{self, AvcConfig};
use crate::media::sample::{EncodedSample, SampleKind, Track};

#[derive(Debug, Default)]
struct TrackHeader {
    tag: Option<FlvTag>,
    sent: bool,
}

impl TrackHeader {
    fn store(&mut self, tag: FlvTag) -> FlvTag {
        self.sent = true;
        self.tag = Some(tag.clone());
        tag
    }

    fn take_unsent(&mut self) -> Option<FlvTag> {
        if self.sent {
            return None;
        }
        let tag = self.tag.clone()?;
        self.sent = true;
        Some(tag)
    }
}

/// Turns encoded samples into FLV tags
#[derive(Debug, Default)]
pub struct FlvMuxer {
    video: TrackHeader,
    audio: TrackHeader,
    avc_config: Option<AvcConfig>,
    aac_config: Option<AudioSpecificConfig>,
    dropped: u64,
}

impl FlvMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mux one sample.
    ///
    /// Returns the tags to send in order. A sequence header that has not
    /// gone out on this session yet is prepended to the first frame of its
    /// track. Frames of a track with no known sequence header are dropped
    /// (counted in [`FlvMuxer::dropped`]) since no decoder could use them.
    pub fn mux(&mut self, sample: &EncodedSample) -> Result<Vec<FlvTag>> {
        let ts = sample.timestamp_ms();

        if sample.is_end_of_stream() {
            if self.video.tag.is_none() {
                return Ok(Vec::new());
            }
            return Ok(vec![FlvTag::video(ts, h264::end_of_sequence_body())]);
        }

        if sample.payload.is_empty() {
            return Err(MediaError::EmptyPayload.into());
        }

        match sample.kind {
            SampleKind::VideoSequenceHeader => {
                let body = if h264::is_flv_video_body(&sample.payload) {
                    sample.payload.clone()
                } else {
                    let config = AvcConfig::from_codec_config(&sample.payload)?;
                    tracing::debug!(
                        profile = config.profile_name(),
                        level = config.level,
                        "AVC sequence header"
                    );
                    let body = h264::sequence_header_body(&config);
                    self.avc_config = Some(config);
                    body
                };
                Ok(vec![self.video.store(FlvTag::video(0, body))])
            }
            SampleKind::AudioSequenceHeader => {
                let body = if aac::is_flv_audio_body(&sample.payload) {
                    sample.payload.clone()
                } else {
                    let config = AudioSpecificConfig::from_codec_config(&sample.payload)?;
                    tracing::debug!(
                        rate = config.sampling_frequency,
                        channels = config.channel_configuration,
                        "AAC sequence header"
                    );
                    let body = aac::sequence_header_body(&config);
                    self.aac_config = Some(config);
                    body
                };
                Ok(vec![self.audio.store(FlvTag::audio(0, body))])
            }
            SampleKind::VideoKeyFrame | SampleKind::VideoInterFrame => {
                let body = if h264::is_flv_video_body(&sample.payload) {
                    sample.payload.clone()
                } else {
                    let avcc = h264::to_avcc(&sample.payload);
                    let keyframe = sample.kind == SampleKind::VideoKeyFrame;
                    h264::frame_body(keyframe, &avcc)
                };
                Ok(self.with_header(Track::Video, FlvTag::video(ts, body)))
            }
            SampleKind::AudioFrame => {
                let body = if aac::is_flv_audio_body(&sample.payload) {
                    sample.payload.clone()
                } else {
                    aac::frame_body(&aac::strip_adts(&sample.payload))
                };
                Ok(self.with_header(Track::Audio, FlvTag::audio(ts, body)))
            }
        }
    }

    /// Mux one sample straight to serialized FLV tag bytes
    pub fn mux_to_bytes(&mut self, sample: &EncodedSample) -> Result<Bytes> {
        let tags = self.mux(sample)?;
        let mut buf = BytesMut::with_capacity(tags.iter().map(FlvTag::encoded_len).sum());
        for tag in &tags {
            tag.encode_to(&mut buf);
        }
        Ok(buf.freeze())
    }

    fn with_header(&mut self, track: Track, frame: FlvTag) -> Vec<FlvTag> {
        let header = match track {
            Track::Video => &mut self.video,
            Track::Audio => &mut self.audio,
        };
        if header.tag.is_none() {
            self.dropped += 1;
            tracing::trace!(?track, "dropping frame without sequence header");
            return Vec::new();
        }
        let mut tags = Vec::with_capacity(2);
        tags.extend(header.take_unsent());
        tags.push(frame);
        tags
    }

    /// Start a new session: every cached header must be sent again
    pub fn reset(&mut self) {
        self.video.sent = false;
        self.audio.sent = false;
    }

    /// Cached sequence headers not yet sent on this session, video first.
    /// They are marked sent.
    pub fn session_headers(&mut self) -> Vec<FlvTag> {
        let mut tags = Vec::with_capacity(2);
        tags.extend(self.video.take_unsent());
        tags.extend(self.audio.take_unsent());
        tags
    }

    pub fn avc_config(&self) -> Option<&AvcConfig> {
        self.avc_config.as_ref()
    }

    pub fn aac_config(&self) -> Option<&AudioSpecificConfig> {
        self.aac_config.as_ref()
    }

    /// Frames dropped because their track had no sequence header
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
