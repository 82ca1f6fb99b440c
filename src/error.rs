//! Error types
//!
//! Every layer has its own error enum; all of them fold into [`Error`].
//!
//! Mapping to pipeline failures:
//! - `Initialization` - capture/encoder setup failed, reported by `Recorder::start`
//! - `Encode` - mid-stream encoder fault, reported through the sample sink
//! - `Connection` - bad URL, unreachable server, handshake failure or
//!   timeout, connect/publish rejected
//! - `Transport`/`Io`/`Timeout` - socket fault while publishing
//! - `Streaming` - reconnect attempts exhausted, terminal for the sender
//!
//! Queue overflow is deliberately not an error; it is counted in `stats`.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("AMF error: {0}")]
    Amf(#[from] AmfError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("encoder error: {0}")]
    Encode(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("streaming failed after {attempts} reconnect attempts: {source}")]
    Streaming {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether this error came from the network link (as opposed to a
    /// local encoding or configuration problem).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Handshake(_)
                | Error::Protocol(_)
                | Error::Connection(_)
                | Error::Transport(_)
                | Error::Timeout(_)
        )
    }

    /// Fold a failure while establishing a session into a
    /// [`ConnectionError`]. Errors that are not about the link pass through.
    pub fn into_connection_error(self) -> Error {
        let err = match self {
            Error::Io(e) => ConnectionError::Unreachable(e),
            Error::Handshake(e) => ConnectionError::Handshake(e),
            Error::Protocol(e) => ConnectionError::Protocol(e),
            Error::Amf(e) => ConnectionError::MalformedReply(e),
            Error::Timeout(_) => ConnectionError::Timeout,
            Error::Transport(reason) => {
                ConnectionError::Unreachable(io::Error::new(io::ErrorKind::Other, reason))
            }
            other => return other,
        };
        Error::Connection(err)
    }
}

/// RTMP handshake failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("unsupported RTMP version {0}")]
    InvalidVersion(u8),

    #[error("peer closed connection during handshake")]
    UnexpectedEof,
}

/// AMF0 encoding/decoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    #[error("unknown AMF marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid object end marker")]
    InvalidObjectEnd,

    #[error("invalid reference index {0}")]
    InvalidReference(u16),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("AMF nesting too deep")]
    NestingTooDeep,
}

/// Chunk/message level protocol violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("chunk on stream {0} continues a message that was never started")]
    MissingChunkHeader(u32),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(u32),

    #[error("malformed {0} message")]
    MalformedMessage(&'static str),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Codec payload problems
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("invalid AVC packet")]
    InvalidAvcPacket,

    #[error("invalid AAC packet")]
    InvalidAacPacket,

    #[error("missing SPS/PPS in video sequence header")]
    MissingParameterSets,

    #[error("empty payload")]
    EmptyPayload,

    #[error("truncated or invalid FLV tag")]
    InvalidTag,

    #[error("payload of {0} bytes exceeds the RTMP message limit")]
    TooLarge(usize),
}

/// Connection establishment failures
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid RTMP URL: {0}")]
    InvalidUrl(String),

    #[error("could not reach server: {0}")]
    Unreachable(#[source] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[source] HandshakeError),

    #[error("protocol violation while connecting: {0}")]
    Protocol(#[source] ProtocolError),

    #[error("malformed server reply: {0}")]
    MalformedReply(#[source] AmfError),

    #[error("timed out establishing connection")]
    Timeout,

    #[error("server rejected {command}: {reason}")]
    Rejected { command: String, reason: String },

    #[error("connection closed by peer")]
    Closed,

    #[error("not connected")]
    NotConnected,
}
