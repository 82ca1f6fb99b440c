//! RTMP chunk stream
//!
//! Messages are split into chunks of at most `chunk_size` payload bytes.
//! Each chunk starts with a basic header (fmt + chunk stream id) followed
//! by a message header whose size depends on fmt:
//!
//! ```text
//! fmt 0: timestamp(3) length(3) type(1) stream_id(4, LE)   11 bytes
//! fmt 1: ts_delta(3)  length(3) type(1)                     7 bytes
//! fmt 2: ts_delta(3)                                        3 bytes
//! fmt 3: (nothing, continuation or repeat of previous)     0 bytes
//! ```
//!
//! A timestamp field of 0xFFFFFF means a 4-byte extended timestamp follows
//! the message header; it is repeated on fmt 3 continuation chunks.
//!
//! The encoder only emits fmt 0 followed by fmt 3 continuations. That costs
//! a few bytes per message but keeps every message independently decodable,
//! which matters after a reconnect. The decoder accepts all four formats.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::{
    DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP_THRESHOLD, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE,
};

/// A complete (reassembled) RTMP message with its chunk stream routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpChunk {
    /// Chunk stream ID the message travels on
    pub csid: u32,
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    /// Message type ID
    pub message_type: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message body
    pub payload: Bytes,
}

/// Splits messages into chunks
#[derive(Debug)]
pub struct ChunkEncoder {
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Change the outgoing chunk size. Only call this after the Set Chunk
    /// Size message announcing it has been written.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Append the chunked form of `msg` to `buf`
    pub fn encode(&self, msg: &RtmpChunk, buf: &mut BytesMut) -> Result<()> {
        let length = msg.payload.len();
        if length as u64 > MAX_MESSAGE_SIZE as u64 {
            return Err(ProtocolError::MessageTooLarge(length as u32).into());
        }

        let extended = msg.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
        let ts_field = if extended {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            msg.timestamp
        };

        let chunk_size = self.chunk_size as usize;
        let chunks = length.div_ceil(chunk_size).max(1);
        buf.reserve(length + 16 + chunks * 8);

        write_basic_header(buf, 0, msg.csid);
        put_u24(buf, ts_field);
        put_u24(buf, length as u32);
        buf.put_u8(msg.message_type);
        buf.put_u32_le(msg.stream_id);
        if extended {
            buf.put_u32(msg.timestamp);
        }

        let mut payload = &msg.payload[..];
        let first = payload.len().min(chunk_size);
        buf.put_slice(&payload[..first]);
        payload = &payload[first..];

        while !payload.is_empty() {
            write_basic_header(buf, 3, msg.csid);
            if extended {
                buf.put_u32(msg.timestamp);
            }
            let n = payload.len().min(chunk_size);
            buf.put_slice(&payload[..n]);
            payload = &payload[n..];
        }

        Ok(())
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per chunk stream header state kept for fmt 1-3 compression
#[derive(Debug, Default, Clone)]
struct ChunkStreamState {
    timestamp: u32,
    timestamp_delta: u32,
    length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
    /// Set once any header has been seen on this stream
    initialized: bool,
    partial: BytesMut,
}

/// Reassembles messages from a chunk byte stream
#[derive(Debug)]
pub struct ChunkDecoder {
    chunk_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Apply a peer Set Chunk Size
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Drop a partially received message (Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
        }
    }

    /// Decode chunks from `buf` until a full message is available.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes are only
    /// consumed for chunks that were complete.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>> {
        loop {
            match self.decode_chunk(buf)? {
                ChunkProgress::NeedMore => return Ok(None),
                ChunkProgress::Partial => continue,
                ChunkProgress::Message(msg) => return Ok(Some(msg)),
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<ChunkProgress> {
        let data = &buf[..];
        if data.is_empty() {
            return Ok(ChunkProgress::NeedMore);
        }

        let fmt = data[0] >> 6;
        let (csid, mut pos) = match data[0] & 0x3F {
            0 => {
                if data.len() < 2 {
                    return Ok(ChunkProgress::NeedMore);
                }
                (64 + data[1] as u32, 2)
            }
            1 => {
                if data.len() < 3 {
                    return Ok(ChunkProgress::NeedMore);
                }
                (64 + data[1] as u32 + ((data[2] as u32) << 8), 3)
            }
            id => (id as u32, 1),
        };

        let header_len = [11usize, 7, 3, 0][fmt as usize];
        if data.len() < pos + header_len {
            return Ok(ChunkProgress::NeedMore);
        }

        let prev = self.streams.get(&csid).cloned().unwrap_or_default();
        if fmt != 0 && !prev.initialized {
            return Err(ProtocolError::MissingChunkHeader(csid).into());
        }

        let mut next = prev.clone();
        let header = &data[pos..pos + header_len];
        let ts_field = if fmt < 3 { get_u24(&header[0..3]) } else { 0 };
        if fmt <= 1 {
            next.length = get_u24(&header[3..6]);
            next.message_type = header[6];
        }
        if fmt == 0 {
            next.stream_id = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
        }
        pos += header_len;

        let extended = if fmt < 3 {
            ts_field == EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            prev.extended
        };
        let mut ts_value = ts_field;
        if extended {
            if data.len() < pos + 4 {
                return Ok(ChunkProgress::NeedMore);
            }
            ts_value = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            pos += 4;
        }
        next.extended = extended;

        if next.length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(next.length).into());
        }

        let starting_message = prev.partial.is_empty();
        match fmt {
            0 => {
                next.timestamp = ts_value;
                next.timestamp_delta = 0;
            }
            1 | 2 => {
                next.timestamp_delta = ts_value;
                next.timestamp = prev.timestamp.wrapping_add(ts_value);
            }
            _ => {
                // fmt 3 starting a new message repeats the previous delta
                if starting_message {
                    next.timestamp = prev.timestamp.wrapping_add(prev.timestamp_delta);
                }
            }
        }

        let received = if starting_message { 0 } else { prev.partial.len() };
        let remaining = (next.length as usize).saturating_sub(received);
        let take = remaining.min(self.chunk_size as usize);
        if data.len() < pos + take {
            return Ok(ChunkProgress::NeedMore);
        }

        // Everything for this chunk is present: commit
        buf.advance(pos);
        let body = buf.split_to(take);
        next.initialized = true;
        next.partial.extend_from_slice(&body);

        let complete = next.partial.len() >= next.length as usize;
        let progress = if complete {
            let payload = next.partial.split().freeze();
            ChunkProgress::Message(RtmpChunk {
                csid,
                timestamp: next.timestamp,
                message_type: next.message_type,
                stream_id: next.stream_id,
                payload,
            })
        } else {
            ChunkProgress::Partial
        };

        self.streams.insert(csid, next);
        Ok(progress)
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

enum ChunkProgress {
    NeedMore,
    Partial,
    Message(RtmpChunk),
}

fn write_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        2..=63 => buf.put_u8((fmt << 6) | csid as u8),
        64..=319 => {
            buf.put_u8(fmt << 6);
            buf.put_u8((csid - 64) as u8);
        }
        _ => {
            buf.put_u8((fmt << 6) | 1);
            let id = csid - 64;
            buf.put_u8((id & 0xFF) as u8);
            buf.put_u8((id >> 8) as u8);
        }
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

fn get_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{CSID_VIDEO, MSG_COMMAND_AMF0, MSG_VIDEO};

    fn message(csid: u32, timestamp: u32, len: usize) -> RtmpChunk {
        RtmpChunk {
            csid,
            timestamp,
            message_type: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>()),
        }
    }

    #[test]
    fn test_split_at_chunk_size() {
        let encoder = ChunkEncoder::new();
        let msg = message(CSID_VIDEO, 40, 300);
        let mut buf = BytesMut::new();
        encoder.encode(&msg, &mut buf).unwrap();

        // 1 + 11 header, 128 body, then two fmt3 chunks (1 + 128, 1 + 44)
        assert_eq!(buf.len(), 12 + 128 + 1 + 128 + 1 + 44);
        assert_eq!(buf[0], CSID_VIDEO as u8);
        assert_eq!(buf[12 + 128], 0xC0 | CSID_VIDEO as u8);

        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_negotiated_chunk_size() {
        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(4096).unwrap();
        let msg = message(CSID_VIDEO, 0, 5000);
        let mut buf = BytesMut::new();
        encoder.encode(&msg, &mut buf).unwrap();
        assert_eq!(buf.len(), 12 + 4096 + 1 + 904);

        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(4096).unwrap();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_extended_timestamp_on_every_chunk() {
        let encoder = ChunkEncoder::new();
        let msg = message(CSID_VIDEO, 0x0100_0000, 200);
        let mut buf = BytesMut::new();
        encoder.encode(&msg, &mut buf).unwrap();

        assert_eq!(&buf[1..4], &[0xFF, 0xFF, 0xFF]);
        // Continuation chunk carries the extended timestamp too
        let cont = 12 + 4 + 128;
        assert_eq!(&buf[cont + 1..cont + 5], &0x0100_0000u32.to_be_bytes());

        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_partial_input_waits() {
        let encoder = ChunkEncoder::new();
        let msg = message(CSID_VIDEO, 10, 200);
        let mut full = BytesMut::new();
        encoder.encode(&msg, &mut full).unwrap();

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..50]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 50);

        buf.extend_from_slice(&full[50..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_compressed_headers() {
        let mut buf = BytesMut::new();
        // fmt 0 on csid 3: ts 100, len 2, command, stream 0
        buf.put_slice(&[0x03, 0, 0, 100, 0, 0, 2, MSG_COMMAND_AMF0, 0, 0, 0, 0, 0xAA, 0xBB]);
        // fmt 1: delta 10, len 1, same type
        buf.put_slice(&[0x43, 0, 0, 10, 0, 0, 1, MSG_COMMAND_AMF0, 0xCC]);
        // fmt 2: delta 5
        buf.put_slice(&[0x83, 0, 0, 5, 0xDD]);
        // fmt 3: repeats delta 5
        buf.put_slice(&[0xC3, 0xEE]);

        let mut decoder = ChunkDecoder::new();
        let timestamps: Vec<u32> = (0..4)
            .map(|_| decoder.decode(&mut buf).unwrap().unwrap().timestamp)
            .collect();
        assert_eq!(timestamps, vec![100, 110, 115, 120]);
    }

    #[test]
    fn test_continuation_without_header_is_error() {
        let mut buf = BytesMut::from(&[0xC5u8, 0x00][..]);
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_two_byte_chunk_stream_id() {
        let encoder = ChunkEncoder::new();
        let msg = message(300, 0, 10);
        let mut buf = BytesMut::new();
        encoder.encode(&msg, &mut buf).unwrap();
        assert_eq!(buf[0] & 0x3F, 0);

        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let mut encoder = ChunkEncoder::new();
        assert!(encoder.set_chunk_size(0).is_err());
        assert!(encoder.set_chunk_size(0x8000_0000).is_err());
        assert_eq!(encoder.chunk_size(), DEFAULT_CHUNK_SIZE);
    }
}
