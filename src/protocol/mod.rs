//! RTMP wire protocol
//!
//! Handshake, chunk stream and message layer. Everything here is
//! transport-agnostic; the socket lives in [`crate::client`].

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
pub use handshake::{client_handshake, server_handshake, Handshake, HandshakeRole};
pub use message::{Command, RtmpMessage, UserControlEvent};
