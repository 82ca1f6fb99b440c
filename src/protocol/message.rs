//! RTMP messages
//!
//! Typed view over reassembled chunks. Parsing is lenient about message
//! types we never act on; they come back as [`RtmpMessage::Unknown`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{amf0, AmfValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;

/// A decoded RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Abort { csid: u32 },
    Acknowledgement { sequence: u32 },
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
    Audio { timestamp: u32, data: Bytes },
    Video { timestamp: u32, data: Bytes },
    /// AMF0 data message (`@setDataFrame`, `onMetaData`)
    Data(Vec<AmfValue>),
    Command(Command),
    Unknown { type_id: u8, payload: Bytes },
}

/// User control event (message type 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Other { event_type: u16 },
}

/// An AMF0 command: name, transaction id, command object and arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: AmfValue,
    pub arguments: Vec<AmfValue>,
    /// Message stream the command travels on (0 for NetConnection)
    pub stream_id: u32,
}

impl Command {
    pub fn new(name: impl Into<String>, transaction_id: f64) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            command_object: AmfValue::Null,
            arguments: Vec::new(),
            stream_id: 0,
        }
    }

    pub fn with_object(mut self, object: AmfValue) -> Self {
        self.command_object = object;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<AmfValue>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn on_stream(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// `connect` with the command object a publishing encoder sends
    pub fn connect(app: &str, tc_url: &str, flash_ver: &str) -> Self {
        Self::new(CMD_CONNECT, 1.0).with_object(AmfValue::object([
            ("app", AmfValue::from(app)),
            ("type", AmfValue::from("nonprivate")),
            ("flashVer", AmfValue::from(flash_ver)),
            ("tcUrl", AmfValue::from(tc_url)),
        ]))
    }

    pub fn release_stream(transaction_id: f64, stream_key: &str) -> Self {
        Self::new(CMD_RELEASE_STREAM, transaction_id).with_arg(stream_key)
    }

    pub fn fc_publish(transaction_id: f64, stream_key: &str) -> Self {
        Self::new(CMD_FC_PUBLISH, transaction_id).with_arg(stream_key)
    }

    pub fn create_stream(transaction_id: f64) -> Self {
        Self::new(CMD_CREATE_STREAM, transaction_id)
    }

    /// `publish(key, "live")` on the created message stream
    pub fn publish(transaction_id: f64, stream_id: u32, stream_key: &str) -> Self {
        Self::new(CMD_PUBLISH, transaction_id)
            .with_arg(stream_key)
            .with_arg("live")
            .on_stream(stream_id)
    }

    pub fn fc_unpublish(transaction_id: f64, stream_key: &str) -> Self {
        Self::new(CMD_FC_UNPUBLISH, transaction_id).with_arg(stream_key)
    }

    pub fn delete_stream(transaction_id: f64, stream_id: u32) -> Self {
        Self::new(CMD_DELETE_STREAM, transaction_id).with_arg(stream_id)
    }

    /// Status info object of an `onStatus`, or the error info of `_error`
    pub fn info(&self) -> Option<&AmfValue> {
        self.arguments
            .iter()
            .find(|v| v.properties().is_some())
            .or_else(|| Some(&self.command_object).filter(|v| v.properties().is_some()))
    }

    /// `code` field of the info object
    pub fn status_code(&self) -> Option<&str> {
        self.info()?.get_string("code")
    }

    /// Human readable reason for a rejection
    pub fn describe(&self) -> String {
        let info = self.info();
        let code = info.and_then(|i| i.get_string("code"));
        let desc = info.and_then(|i| i.get_string("description"));
        match (code, desc) {
            (Some(c), Some(d)) => format!("{}: {}", c, d),
            (Some(c), None) => c.to_string(),
            (None, Some(d)) => d.to_string(),
            (None, None) => self.name.clone(),
        }
    }

    fn encode_payload(&self) -> Bytes {
        let mut values = Vec::with_capacity(3 + self.arguments.len());
        values.push(AmfValue::String(self.name.clone()));
        values.push(AmfValue::Number(self.transaction_id));
        values.push(self.command_object.clone());
        values.extend(self.arguments.iter().cloned());
        amf0::encode_all(&values)
    }

    fn decode_payload(payload: Bytes, stream_id: u32) -> Result<Self> {
        let mut values = amf0::decode_all(payload)?.into_iter();
        let name = match values.next() {
            Some(AmfValue::String(s)) => s,
            _ => return Err(ProtocolError::MalformedMessage("command without name").into()),
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let command_object = values.next().unwrap_or(AmfValue::Null);
        Ok(Self {
            name,
            transaction_id,
            command_object,
            arguments: values.collect(),
            stream_id,
        })
    }
}

impl RtmpMessage {
    /// `@setDataFrame("onMetaData", metadata)`
    pub fn set_data_frame(metadata: AmfValue) -> Self {
        RtmpMessage::Data(vec![
            AmfValue::from("@setDataFrame"),
            AmfValue::from("onMetaData"),
            metadata,
        ])
    }

    /// Decode a reassembled chunk
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self> {
        let mut p = chunk.payload.clone();
        let msg = match chunk.message_type {
            MSG_SET_CHUNK_SIZE => RtmpMessage::SetChunkSize(read_u32(&mut p)? & 0x7FFF_FFFF),
            MSG_ABORT => RtmpMessage::Abort {
                csid: read_u32(&mut p)?,
            },
            MSG_ACKNOWLEDGEMENT => RtmpMessage::Acknowledgement {
                sequence: read_u32(&mut p)?,
            },
            MSG_USER_CONTROL => RtmpMessage::UserControl(parse_user_control(&mut p)?),
            MSG_WINDOW_ACK_SIZE => RtmpMessage::WindowAckSize(read_u32(&mut p)?),
            MSG_SET_PEER_BANDWIDTH => {
                let size = read_u32(&mut p)?;
                let limit_type = if p.has_remaining() { p.get_u8() } else { 2 };
                RtmpMessage::SetPeerBandwidth { size, limit_type }
            }
            MSG_AUDIO => RtmpMessage::Audio {
                timestamp: chunk.timestamp,
                data: p,
            },
            MSG_VIDEO => RtmpMessage::Video {
                timestamp: chunk.timestamp,
                data: p,
            },
            MSG_DATA_AMF0 => RtmpMessage::Data(amf0::decode_all(p)?),
            MSG_COMMAND_AMF0 => RtmpMessage::Command(Command::decode_payload(p, chunk.stream_id)?),
            MSG_COMMAND_AMF3 => {
                // AMF3 command messages carry a leading format byte, then AMF0
                if p.has_remaining() {
                    p.advance(1);
                }
                RtmpMessage::Command(Command::decode_payload(p, chunk.stream_id)?)
            }
            type_id => RtmpMessage::Unknown { type_id, payload: p },
        };
        Ok(msg)
    }

    /// Wrap the message into a chunk on the conventional chunk stream.
    ///
    /// `stream_id` is the message stream for media and data; commands use
    /// their own and control messages always use 0.
    pub fn to_chunk(&self, stream_id: u32) -> RtmpChunk {
        let (csid, message_type, timestamp, msg_stream, payload) = match self {
            RtmpMessage::SetChunkSize(size) => (
                CSID_PROTOCOL_CONTROL,
                MSG_SET_CHUNK_SIZE,
                0,
                0,
                u32_payload(*size & 0x7FFF_FFFF),
            ),
            RtmpMessage::Abort { csid } => {
                (CSID_PROTOCOL_CONTROL, MSG_ABORT, 0, 0, u32_payload(*csid))
            }
            RtmpMessage::Acknowledgement { sequence } => (
                CSID_PROTOCOL_CONTROL,
                MSG_ACKNOWLEDGEMENT,
                0,
                0,
                u32_payload(*sequence),
            ),
            RtmpMessage::UserControl(event) => (
                CSID_PROTOCOL_CONTROL,
                MSG_USER_CONTROL,
                0,
                0,
                encode_user_control(event),
            ),
            RtmpMessage::WindowAckSize(size) => (
                CSID_PROTOCOL_CONTROL,
                MSG_WINDOW_ACK_SIZE,
                0,
                0,
                u32_payload(*size),
            ),
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut b = BytesMut::with_capacity(5);
                b.put_u32(*size);
                b.put_u8(*limit_type);
                (CSID_PROTOCOL_CONTROL, MSG_SET_PEER_BANDWIDTH, 0, 0, b.freeze())
            }
            RtmpMessage::Audio { timestamp, data } => {
                (CSID_AUDIO, MSG_AUDIO, *timestamp, stream_id, data.clone())
            }
            RtmpMessage::Video { timestamp, data } => {
                (CSID_VIDEO, MSG_VIDEO, *timestamp, stream_id, data.clone())
            }
            RtmpMessage::Data(values) => (
                CSID_DATA,
                MSG_DATA_AMF0,
                0,
                stream_id,
                amf0::encode_all(values),
            ),
            RtmpMessage::Command(cmd) => (
                CSID_COMMAND,
                MSG_COMMAND_AMF0,
                0,
                cmd.stream_id,
                cmd.encode_payload(),
            ),
            RtmpMessage::Unknown { type_id, payload } => {
                (CSID_COMMAND, *type_id, 0, stream_id, payload.clone())
            }
        };

        RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id: msg_stream,
            payload,
        }
    }
}

fn read_u32(p: &mut Bytes) -> Result<u32> {
    if p.remaining() < 4 {
        return Err(ProtocolError::MalformedMessage("truncated control message").into());
    }
    Ok(p.get_u32())
}

fn u32_payload(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn parse_user_control(p: &mut Bytes) -> Result<UserControlEvent> {
    if p.remaining() < 2 {
        return Err(ProtocolError::MalformedMessage("truncated user control").into());
    }
    let event_type = p.get_u16();
    let event = match event_type {
        UC_STREAM_BEGIN => UserControlEvent::StreamBegin(read_u32(p)?),
        UC_STREAM_EOF => UserControlEvent::StreamEof(read_u32(p)?),
        UC_STREAM_DRY => UserControlEvent::StreamDry(read_u32(p)?),
        UC_SET_BUFFER_LENGTH => UserControlEvent::SetBufferLength {
            stream_id: read_u32(p)?,
            buffer_ms: read_u32(p)?,
        },
        UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(read_u32(p)?),
        UC_PING_REQUEST => UserControlEvent::PingRequest(read_u32(p)?),
        UC_PING_RESPONSE => UserControlEvent::PingResponse(read_u32(p)?),
        other => UserControlEvent::Other { event_type: other },
    };
    Ok(event)
}

fn encode_user_control(event: &UserControlEvent) -> Bytes {
    let mut b = BytesMut::with_capacity(10);
    match *event {
        UserControlEvent::StreamBegin(id) => {
            b.put_u16(UC_STREAM_BEGIN);
            b.put_u32(id);
        }
        UserControlEvent::StreamEof(id) => {
            b.put_u16(UC_STREAM_EOF);
            b.put_u32(id);
        }
        UserControlEvent::StreamDry(id) => {
            b.put_u16(UC_STREAM_DRY);
            b.put_u32(id);
        }
        UserControlEvent::SetBufferLength {
            stream_id,
            buffer_ms,
        } => {
            b.put_u16(UC_SET_BUFFER_LENGTH);
            b.put_u32(stream_id);
            b.put_u32(buffer_ms);
        }
        UserControlEvent::StreamIsRecorded(id) => {
            b.put_u16(UC_STREAM_IS_RECORDED);
            b.put_u32(id);
        }
        UserControlEvent::PingRequest(ts) => {
            b.put_u16(UC_PING_REQUEST);
            b.put_u32(ts);
        }
        UserControlEvent::PingResponse(ts) => {
            b.put_u16(UC_PING_RESPONSE);
            b.put_u32(ts);
        }
        UserControlEvent::Other { event_type } => b.put_u16(event_type),
    }
    b.freeze()
}
