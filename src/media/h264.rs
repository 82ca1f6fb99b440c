//! H.264/AVC framing
//!
//! Hardware encoders hand out Annex B byte streams (start-code delimited
//! NAL units) and a codec-config buffer holding SPS and PPS. RTMP wants
//! AVCC instead: 4-byte length-prefixed NAL units in an AVC video packet,
//! and an AVCDecoderConfigurationRecord as the sequence header.
//!
//! ```text
//! +----------+----------+-----------------+-----------------+------
//! |FrameType | CodecID  | AVCPacketType   | CompositionTime | Data
//! | (4 bits) | (4 bits) | (1 byte)        | (3 bytes, SI24) |
//! +----------+----------+-----------------+-----------------+------
//! ```
//!
//! AVCDecoderConfigurationRecord:
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | 0xFC | lengthSizeMinusOne (2 bits)
//! | 0xE0 | numOfSPS (5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};
use crate::media::flv::{VideoFrameType, CODEC_AVC};

/// NALU length prefix size we always produce
pub const NALU_LENGTH_SIZE: u8 = 4;

/// AVC packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    SequenceHeader = 0,
    Nalu = 1,
    EndOfSequence = 2,
}

impl AvcPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AvcPacketType::SequenceHeader),
            1 => Some(AvcPacketType::Nalu),
            2 => Some(AvcPacketType::EndOfSequence),
            _ => None,
        }
    }
}

/// NAL unit types this crate cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    Slice,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl NaluType {
    pub fn from_byte(b: u8) -> Self {
        match b & 0x1F {
            1 => NaluType::Slice,
            5 => NaluType::Idr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::Aud,
            other => NaluType::Other(other),
        }
    }
}

/// AVC decoder configuration (the video sequence header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    /// AVC profile (66=Baseline, 77=Main, 100=High, etc.)
    pub profile: u8,
    pub compatibility: u8,
    /// AVC level (e.g., 31 = 3.1)
    pub level: u8,
    /// NALU length prefix size in bytes
    pub nalu_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    /// Serialized AVCDecoderConfigurationRecord
    pub raw: Bytes,
}

impl AvcConfig {
    /// Parse an AVCDecoderConfigurationRecord
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 7 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let raw = data.clone();
        let mut data = data;

        if data.get_u8() != 1 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, num_sps)?;

        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_pps = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, num_pps)?;

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
            raw,
        })
    }

    /// Build the record from raw SPS/PPS NAL units (without start codes)
    pub fn from_parameter_sets(sps: Vec<Bytes>, pps: Vec<Bytes>) -> Result<Self> {
        let first = match sps.first() {
            Some(first) if first.len() >= 4 && !pps.is_empty() => first,
            _ => return Err(MediaError::MissingParameterSets.into()),
        };
        let (profile, compatibility, level) = (first[1], first[2], first[3]);

        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(profile);
        buf.put_u8(compatibility);
        buf.put_u8(level);
        buf.put_u8(0xFC | (NALU_LENGTH_SIZE - 1));
        buf.put_u8(0xE0 | (sps.len() as u8 & 0x1F));
        for s in &sps {
            buf.put_u16(s.len() as u16);
            buf.put_slice(s);
        }
        buf.put_u8(pps.len() as u8);
        for p in &pps {
            buf.put_u16(p.len() as u16);
            buf.put_slice(p);
        }

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size: NALU_LENGTH_SIZE,
            sps,
            pps,
            raw: buf.freeze(),
        })
    }

    /// Accept whatever an encoder reports as its codec config: a ready
    /// record (version byte 1), an Annex B SPS/PPS stream, or AVCC NALUs.
    pub fn from_codec_config(payload: &Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(MediaError::EmptyPayload.into());
        }
        if !is_annex_b(payload) && payload[0] == 1 {
            return Self::parse(payload.clone());
        }

        let nalus: Vec<Bytes> = if is_annex_b(payload) {
            AnnexBIterator::new(payload)
                .map(|n| payload.slice_ref(n))
                .collect()
        } else {
            NaluIterator::new(payload, NALU_LENGTH_SIZE)
                .map(|n| payload.slice_ref(n))
                .collect()
        };

        let mut sps = Vec::new();
        let mut pps = Vec::new();
        for nalu in nalus.into_iter().filter(|n| !n.is_empty()) {
            match NaluType::from_byte(nalu[0]) {
                NaluType::Sps => sps.push(nalu),
                NaluType::Pps => pps.push(nalu),
                _ => {}
            }
        }
        Self::from_parameter_sets(sps, pps)
    }

    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            100 => "High",
            _ => "Other",
        }
    }
}

fn read_parameter_sets(data: &mut Bytes, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 2 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        sets.push(data.copy_to_bytes(len));
    }
    Ok(sets)
}

/// Whether the buffer is an Annex B stream.
///
/// A start-code prefix alone is ambiguous: an AVCC NALU of 256..511 bytes
/// also begins with `00 00 01`. Buffers whose length prefixes add up
/// exactly are taken as AVCC.
pub fn is_annex_b(data: &[u8]) -> bool {
    (data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])) && !is_avcc(data)
}

/// Whether the buffer is a sequence of 4-byte length-prefixed NAL units
/// covering it exactly
pub fn is_avcc(data: &[u8]) -> bool {
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        let len = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        if len == 0 {
            return false;
        }
        offset += 4 + len;
    }
    offset == data.len() && !data.is_empty()
}

/// Whether the buffer is already an FLV AVC video body
/// (`0x17`/`0x27`, packet type, composition time).
///
/// An AVCC buffer cannot be mistaken for one: its first byte is the top
/// byte of a NALU length, which would mean a NALU over 256 MiB.
pub fn is_flv_video_body(data: &[u8]) -> bool {
    data.len() >= 5
        && data[0] & 0x0F == CODEC_AVC
        && VideoFrameType::from_byte(data[0]).is_some()
        && AvcPacketType::from_byte(data[1]).is_some()
}

/// Iterator over NAL units in an Annex B byte stream (start codes removed)
pub struct AnnexBIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AnnexBIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let pos = find_start_code(data, 0).map(|(_, end)| end).unwrap_or(data.len());
        Self { data, pos }
    }
}

impl<'a> Iterator for AnnexBIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        match find_start_code(self.data, start) {
            Some((code_start, code_end)) => {
                self.pos = code_end;
                Some(&self.data[start..code_start])
            }
            None => {
                self.pos = self.data.len();
                Some(&self.data[start..])
            }
        }
    }
}

/// Find the next 3- or 4-byte start code at or after `from`.
/// Returns (start of code, first byte after code).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                // Swallow the leading zero of a 4-byte code
                let begin = if i > from && data[i - 1] == 0 { i - 1 } else { i };
                return Some((begin, i + 3));
            }
            if data[i + 2] == 0 {
                i += 1;
                continue;
            }
        }
        i += 1;
    }
    None
}

/// Iterator over NAL units in AVCC format
pub struct NaluIterator<'a> {
    data: &'a [u8],
    offset: usize,
    nalu_length_size: usize,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8], nalu_length_size: u8) -> Self {
        Self {
            data,
            offset: 0,
            nalu_length_size: nalu_length_size as usize,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + self.nalu_length_size > self.data.len() {
            return None;
        }

        let mut len: usize = 0;
        for i in 0..self.nalu_length_size {
            len = (len << 8) | (self.data[self.offset + i] as usize);
        }
        self.offset += self.nalu_length_size;

        if self.offset + len > self.data.len() {
            return None;
        }

        let nalu = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(nalu)
    }
}

/// Convert an Annex B access unit to AVCC. Access unit delimiters are
/// dropped; AVCC input is returned unchanged.
pub fn to_avcc(payload: &Bytes) -> Bytes {
    if !is_annex_b(payload) {
        return payload.clone();
    }

    let mut out = BytesMut::with_capacity(payload.len() + 16);
    for nalu in AnnexBIterator::new(payload) {
        if nalu.is_empty() || NaluType::from_byte(nalu[0]) == NaluType::Aud {
            continue;
        }
        out.put_u32(nalu.len() as u32);
        out.put_slice(nalu);
    }
    out.freeze()
}

/// Whether an AVCC access unit contains an IDR slice
pub fn contains_idr(avcc: &[u8]) -> bool {
    NaluIterator::new(avcc, NALU_LENGTH_SIZE)
        .any(|n| !n.is_empty() && NaluType::from_byte(n[0]) == NaluType::Idr)
}

fn video_body(frame: VideoFrameType, packet: AvcPacketType, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(frame.avc_header_byte());
    buf.put_u8(packet as u8);
    // Composition time: encoders here emit no B-frames, so PTS == DTS
    buf.put_slice(&[0, 0, 0]);
    buf.put_slice(data);
    buf.freeze()
}

/// `0x17 0x00 0 0 0` + AVCDecoderConfigurationRecord
pub fn sequence_header_body(config: &AvcConfig) -> Bytes {
    video_body(
        VideoFrameType::Keyframe,
        AvcPacketType::SequenceHeader,
        &config.raw,
    )
}

/// `0x17`/`0x27`, `0x01`, composition time, AVCC NAL units
pub fn frame_body(keyframe: bool, avcc: &[u8]) -> Bytes {
    let frame = if keyframe {
        VideoFrameType::Keyframe
    } else {
        VideoFrameType::InterFrame
    };
    video_body(frame, AvcPacketType::Nalu, avcc)
}

/// AVC end-of-sequence marker
pub fn end_of_sequence_body() -> Bytes {
    video_body(VideoFrameType::Keyframe, AvcPacketType::EndOfSequence, &[])
}
