//! FLV tags
//!
//! Over RTMP an audio/video message body is an FLV tag body; the 11-byte
//! tag header and the trailing PreviousTagSize only exist in the serialized
//! FLV form produced by [`FlvTag::encode_to`].
//!
//! ```text
//! +---------+-------------+--------------+-------------+----------+--------------+
//! | Type(1) | DataSize(3) | Timestamp(3) | TsExt(1)    | Stream(3)| Data(N)      |
//! +---------+-------------+--------------+-------------+----------+--------------+
//! followed by PreviousTagSize(4) = 11 + N
//! ```
//!
//! Video body: `FrameType(4 bits) | CodecID(4 bits) | AVCPacketType | CTS(3) | data`
//! Audio body: `SoundFormat(4) | Rate(2) | Size(1) | Type(1) | AACPacketType | data`

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Tag header plus PreviousTagSize trailer
pub const TAG_OVERHEAD: usize = 11 + 4;

/// AVC codec id in the low nibble of a video body
pub const CODEC_AVC: u8 = 7;

/// AAC sound format in the high nibble of an audio body
pub const SOUND_FORMAT_AAC: u8 = 10;

/// AAC audio header byte. FLV requires 44 kHz / 16-bit / stereo flags for
/// AAC whatever the real stream is; the AudioSpecificConfig is authoritative.
pub const AAC_SOUND_HEADER: u8 = 0xAF;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    pub fn type_id(self) -> u8 {
        match self {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::Script => 18,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            8 => Some(FlvTagType::Audio),
            9 => Some(FlvTagType::Video),
            18 => Some(FlvTagType::Script),
            _ => None,
        }
    }
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            _ => None,
        }
    }

    /// First byte of an AVC video body with this frame type
    pub fn avc_header_byte(self) -> u8 {
        ((self as u8) << 4) | CODEC_AVC
    }
}

/// A single FLV tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Tag body (including codec headers)
    pub data: Bytes,
}

impl FlvTag {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    /// Script data tag; `data` is the AMF0-encoded body (`onMetaData`, values)
    pub fn script(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Script,
            timestamp,
            data,
        }
    }

    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.tag_type == FlvTagType::Audio
    }

    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        if self.is_video() && !self.data.is_empty() {
            VideoFrameType::from_byte(self.data[0])
        } else {
            None
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type() == Some(VideoFrameType::Keyframe)
    }

    pub fn is_avc_sequence_header(&self) -> bool {
        self.is_video()
            && self.data.len() >= 2
            && self.data[0] & 0x0F == CODEC_AVC
            && self.data[1] == 0
    }

    pub fn is_aac_sequence_header(&self) -> bool {
        self.is_audio()
            && self.data.len() >= 2
            && self.data[0] >> 4 == SOUND_FORMAT_AAC
            && self.data[1] == 0
    }

    pub fn is_sequence_header(&self) -> bool {
        self.is_avc_sequence_header() || self.is_aac_sequence_header()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Serialized length including header and PreviousTagSize
    pub fn encoded_len(&self) -> usize {
        TAG_OVERHEAD + self.data.len()
    }

    /// Append the serialized tag: header, body, PreviousTagSize
    pub fn encode_to(&self, buf: &mut BytesMut) {
        let data_size = self.data.len() as u32;
        buf.reserve(self.encoded_len());

        buf.put_u8(self.tag_type.type_id());
        put_u24(buf, data_size);
        // Lower 24 bits, then the extension byte holding bits 24..31
        put_u24(buf, self.timestamp & 0x00FF_FFFF);
        buf.put_u8((self.timestamp >> 24) as u8);
        // Stream ID, always 0
        put_u24(buf, 0);
        buf.put_slice(&self.data);
        buf.put_u32(11 + data_size);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Read one serialized tag (as written by `encode_to`) from `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < TAG_OVERHEAD {
            return Err(MediaError::InvalidTag.into());
        }
        let tag_type = FlvTagType::from_type_id(buf[0] & 0x1F).ok_or(MediaError::InvalidTag)?;
        let data_size = get_u24(&buf[1..4]) as usize;
        let timestamp = get_u24(&buf[4..7]) | ((buf[7] as u32) << 24);
        if buf.len() < TAG_OVERHEAD + data_size {
            return Err(MediaError::InvalidTag.into());
        }
        buf.advance(11);
        let data = buf.split_to(data_size);
        let _prev_tag_size = buf.get_u32();
        Ok(Self {
            tag_type,
            timestamp,
            data,
        })
    }
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

fn get_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}
