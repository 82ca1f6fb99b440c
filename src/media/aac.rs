//! AAC framing
//!
//! RTMP carries raw AAC frames (no ADTS header) behind a two-byte audio
//! header, and the AudioSpecificConfig as the sequence header:
//!
//! ```text
//! +-----------+----------+----------+----------+---------+---------
//! |SoundFormat|SoundRate |SoundSize |SoundType | AACType | AACData
//! | (4 bits)  | (2 bits) | (1 bit)  | (1 bit)  | (1 byte)|
//! +-----------+----------+----------+----------+---------+---------
//! ```
//!
//! Encoders that emit ADTS streams get their headers stripped here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};
use crate::media::flv::{AAC_SOUND_HEADER, SOUND_FORMAT_AAC};

/// AAC packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacPacketType {
    SequenceHeader = 0,
    Raw = 1,
}

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC-LC audio object type
pub const AOT_AAC_LC: u8 = 2;

/// AudioSpecificConfig (the audio sequence header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    pub sampling_frequency: u32,
    /// 1 = mono, 2 = stereo, ...
    pub channel_configuration: u8,
    pub raw: Bytes,
}

impl AudioSpecificConfig {
    /// Parse the two-byte (or longer) bit-packed config
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        let b0 = data[0];
        let b1 = data[1];
        let audio_object_type = (b0 >> 3) & 0x1F;
        let sampling_frequency_index = ((b0 & 0x07) << 1) | ((b1 >> 7) & 0x01);

        let (sampling_frequency, channel_configuration) = if sampling_frequency_index == 0x0F {
            // Explicit 24-bit frequency follows the index
            if data.len() < 5 {
                return Err(MediaError::InvalidAacPacket.into());
            }
            let f = ((data[1] as u32 & 0x7F) << 17)
                | ((data[2] as u32) << 9)
                | ((data[3] as u32) << 1)
                | (data[4] as u32 >> 7);
            (f, (data[4] >> 3) & 0x0F)
        } else {
            let f = *SAMPLING_FREQUENCIES
                .get(sampling_frequency_index as usize)
                .ok_or(MediaError::InvalidAacPacket)?;
            (f, (b1 >> 3) & 0x0F)
        };

        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration,
            raw: data,
        })
    }

    /// Build a config for the given profile, rate and channel count.
    /// Only the standard sampling frequencies are accepted.
    pub fn new(audio_object_type: u8, sample_rate: u32, channels: u8) -> Result<Self> {
        let index = SAMPLING_FREQUENCIES
            .iter()
            .position(|&f| f == sample_rate)
            .ok_or(MediaError::InvalidAacPacket)? as u8;
        if channels == 0 || channels > 7 || audio_object_type == 0 || audio_object_type > 30 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        let b0 = (audio_object_type << 3) | (index >> 1);
        let b1 = ((index & 0x01) << 7) | (channels << 3);
        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index: index,
            sampling_frequency: sample_rate,
            channel_configuration: channels,
            raw: Bytes::copy_from_slice(&[b0, b1]),
        })
    }

    /// Derive the config from an ADTS header
    pub fn from_adts(header: &AdtsHeader) -> Result<Self> {
        let rate = *SAMPLING_FREQUENCIES
            .get(header.sampling_frequency_index as usize)
            .ok_or(MediaError::InvalidAacPacket)?;
        Self::new(header.profile + 1, rate, header.channel_configuration)
    }

    /// Accept a codec-config payload: a bare AudioSpecificConfig or an
    /// ADTS frame (whose header describes the stream)
    pub fn from_codec_config(payload: &Bytes) -> Result<Self> {
        match AdtsHeader::parse(payload) {
            Some(header) => Self::from_adts(&header),
            None => Self::parse(payload.clone()),
        }
    }
}

/// Fixed part of an ADTS frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// Audio object type minus one
    pub profile: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
    /// Header length: 7, or 9 with CRC
    pub header_len: usize,
    /// Whole frame length including header
    pub frame_len: usize,
}

impl AdtsHeader {
    /// Parse the header at the start of `data`, if there is one
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return None;
        }
        let protection_absent = data[1] & 0x01 == 1;
        let header_len = if protection_absent { 7 } else { 9 };
        let frame_len = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize) >> 5);
        if frame_len < header_len {
            return None;
        }
        Some(AdtsHeader {
            profile: (data[2] >> 6) & 0x03,
            sampling_frequency_index: (data[2] >> 2) & 0x0F,
            channel_configuration: ((data[2] & 0x01) << 2) | (data[3] >> 6),
            header_len,
            frame_len,
        })
    }
}

/// Remove ADTS headers, concatenating the raw frames. Payloads without
/// ADTS are returned as-is.
pub fn strip_adts(payload: &Bytes) -> Bytes {
    let Some(first) = AdtsHeader::parse(payload) else {
        return payload.clone();
    };
    if first.frame_len >= payload.len() {
        return payload.slice(first.header_len.min(payload.len())..);
    }

    // Several frames in one buffer
    let mut out = BytesMut::with_capacity(payload.len());
    let mut rest = &payload[..];
    while let Some(header) = AdtsHeader::parse(rest) {
        let end = header.frame_len.min(rest.len());
        out.put_slice(&rest[header.header_len.min(end)..end]);
        rest = &rest[end..];
    }
    out.put_slice(rest);
    out.freeze()
}

/// Whether the buffer is already an FLV AAC audio body
pub fn is_flv_audio_body(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] >> 4 == SOUND_FORMAT_AAC && data[1] <= 1
}

fn audio_body(packet: AacPacketType, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u8(AAC_SOUND_HEADER);
    buf.put_u8(packet as u8);
    buf.put_slice(data);
    buf.freeze()
}

/// `0xAF 0x00` + AudioSpecificConfig
pub fn sequence_header_body(config: &AudioSpecificConfig) -> Bytes {
    audio_body(AacPacketType::SequenceHeader, &config.raw)
}

/// `0xAF 0x01` + raw AAC
pub fn frame_body(raw: &[u8]) -> Bytes {
    audio_body(AacPacketType::Raw, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ADTS header for AAC-LC 44.1 kHz stereo, no CRC
    fn adts(payload_len: usize) -> Vec<u8> {
        let frame_len = payload_len + 7;
        vec![
            0xFF,
            0xF1,
            (1 << 6) | (4 << 2),
            (2 << 6) | ((frame_len >> 11) & 0x03) as u8,
            ((frame_len >> 3) & 0xFF) as u8,
            (((frame_len & 0x07) << 5) | 0x1F) as u8,
            0xFC,
        ]
    }

    #[test]
    fn test_parse_lc_44k_stereo() {
        let config = AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap();
        assert_eq!(config.audio_object_type, AOT_AAC_LC);
        assert_eq!(config.sampling_frequency, 44100);
        assert_eq!(config.channel_configuration, 2);
    }

    #[test]
    fn test_new_matches_known_bytes() {
        let config = AudioSpecificConfig::new(AOT_AAC_LC, 44100, 2).unwrap();
        assert_eq!(&config.raw[..], &[0x12, 0x10]);

        let mono_48k = AudioSpecificConfig::new(AOT_AAC_LC, 48000, 1).unwrap();
        assert_eq!(&mono_48k.raw[..], &[0x11, 0x88]);

        assert!(AudioSpecificConfig::new(AOT_AAC_LC, 44000, 2).is_err());
        assert!(AudioSpecificConfig::new(AOT_AAC_LC, 44100, 0).is_err());
    }

    #[test]
    fn test_adts_header_parse() {
        let mut frame = adts(4);
        frame.extend_from_slice(&[1, 2, 3, 4]);
        let header = AdtsHeader::parse(&frame).unwrap();
        assert_eq!(header.header_len, 7);
        assert_eq!(header.frame_len, 11);
        assert_eq!(header.channel_configuration, 2);

        let config = AudioSpecificConfig::from_codec_config(&Bytes::from(frame)).unwrap();
        assert_eq!(&config.raw[..], &[0x12, 0x10]);
    }

    #[test]
    fn test_strip_single_and_multiple_frames() {
        let mut one = adts(3);
        one.extend_from_slice(&[0xA, 0xB, 0xC]);
        assert_eq!(&strip_adts(&Bytes::from(one.clone()))[..], &[0xA, 0xB, 0xC]);

        let mut two = one.clone();
        let mut second = adts(2);
        second.extend_from_slice(&[0xD, 0xE]);
        two.extend_from_slice(&second);
        assert_eq!(
            &strip_adts(&Bytes::from(two))[..],
            &[0xA, 0xB, 0xC, 0xD, 0xE]
        );
    }

    #[test]
    fn test_strip_passthrough_raw() {
        let raw = Bytes::from_static(&[0x21, 0x00, 0x49, 0x90]);
        assert_eq!(strip_adts(&raw), raw);
    }

    #[test]
    fn test_bodies() {
        let config = AudioSpecificConfig::new(AOT_AAC_LC, 44100, 2).unwrap();
        assert_eq!(&sequence_header_body(&config)[..], &[0xAF, 0x00, 0x12, 0x10]);
        let frame = frame_body(&[0x21, 0x00]);
        assert_eq!(&frame[..], &[0xAF, 0x01, 0x21, 0x00]);
        assert!(is_flv_audio_body(&frame));
        assert!(!is_flv_audio_body(&[0x21, 0x00]));
    }

    #[test]
    fn test_parse_too_short() {
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x12])).is_err());
    }
}
