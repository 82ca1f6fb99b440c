//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! Only the "simple" handshake is implemented (no HMAC digest); every
//! ingest server we publish to accepts it. The state machine works on
//! buffers so it can be unit tested without sockets; [`client_handshake`]
//! drives it over any async stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Which side of the exchange we play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

/// Keeps back-to-back packets from sharing random bytes
static PACKET_COUNTER: AtomicU64 = AtomicU64::new(0x9E37_79B9);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Nothing sent yet
    Initial,
    /// Client: sent C0C1, waiting for S0S1S2. Server: waiting for C0C1
    WaitingForPeerPacket,
    /// Server only: sent S0S1S2, waiting for C2
    WaitingForPeerEcho,
    Done,
}

/// Handshake state machine
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    /// Our C1/S1, kept so the peer's echo can be checked
    our_packet: Option<[u8; HANDSHAKE_SIZE]>,
    /// Whether the peer's echo matched our random bytes
    echo_verified: bool,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
            our_packet: None,
            echo_verified: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Whether the peer echoed our C1/S1 random block back unchanged.
    ///
    /// Informational only: plenty of servers echo garbage and still work.
    pub fn echo_verified(&self) -> bool {
        self.echo_verified
    }

    /// Bytes required before [`Handshake::process`] can make progress
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                1 + HANDSHAKE_SIZE * 2
            }
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerEcho, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Produce C0C1 (client); servers send nothing first.
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::WaitingForPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                let c1 = generate_packet();
                self.our_packet = Some(c1);

                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&c1);
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Consume peer bytes; returns what to send back, if anything.
    ///
    /// Returns `Ok(None)` without consuming when `data` is still short.
    pub fn process(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        if data.remaining() < self.bytes_needed() || self.bytes_needed() == 0 {
            return Ok(None);
        }

        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                check_version(data.get_u8())?;
                let s1 = take_packet(data);
                let s2 = take_packet(data);
                self.echo_verified = self.matches_our_random(&s2);

                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&generate_echo(&s1))))
            }
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => {
                check_version(data.get_u8())?;
                let c1 = take_packet(data);
                let s1 = generate_packet();
                self.our_packet = Some(s1);

                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&s1);
                response.put_slice(&generate_echo(&c1));

                self.state = HandshakeState::WaitingForPeerEcho;
                Ok(Some(response.freeze()))
            }
            (HandshakeState::WaitingForPeerEcho, _) => {
                let c2 = take_packet(data);
                self.echo_verified = self.matches_our_random(&c2);
                self.state = HandshakeState::Done;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn matches_our_random(&self, echo: &[u8; HANDSHAKE_SIZE]) -> bool {
        self.our_packet
            .map(|ours| ours[8..] == echo[8..])
            .unwrap_or(false)
    }
}

/// Run the client side of the handshake over `io`.
///
/// The caller wraps this in a timeout; a peer that goes silent otherwise
/// blocks forever.
pub async fn client_handshake<S>(io: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(HandshakeRole::Client);
    if let Some(c0c1) = handshake.generate_initial() {
        io.write_all(&c0c1).await?;
        io.flush().await?;
    }

    let mut s0s1s2 = vec![0u8; handshake.bytes_needed()];
    read_exact(io, &mut s0s1s2).await?;

    let mut buf = Bytes::from(s0s1s2);
    if let Some(c2) = handshake.process(&mut buf)? {
        io.write_all(&c2).await?;
        io.flush().await?;
    }

    if !handshake.echo_verified() {
        tracing::debug!("Server S2 did not echo C1; continuing");
    }
    Ok(())
}

/// Run the server side of the handshake over `io`.
pub async fn server_handshake<S>(io: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(HandshakeRole::Server);
    handshake.generate_initial();

    let mut c0c1 = vec![0u8; handshake.bytes_needed()];
    read_exact(io, &mut c0c1).await?;
    let mut buf = Bytes::from(c0c1);
    if let Some(response) = handshake.process(&mut buf)? {
        io.write_all(&response).await?;
        io.flush().await?;
    }

    let mut c2 = vec![0u8; handshake.bytes_needed()];
    read_exact(io, &mut c2).await?;
    let mut buf = Bytes::from(c2);
    handshake.process(&mut buf)?;
    Ok(())
}

async fn read_exact<S>(io: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match io.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(HandshakeError::UnexpectedEof.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn check_version(version: u8) -> Result<()> {
    // Some servers answer with odd versions; only reject the legacy ones
    if version < RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version).into());
    }
    Ok(())
}

fn take_packet(data: &mut Bytes) -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    data.copy_to_slice(&mut packet);
    packet
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// C1/S1 layout: time (4) | zero (4) | random (1528)
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    let timestamp = now_millis();
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    // LCG noise; the handshake has no security requirement
    let nonce = PACKET_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut seed = ((timestamp as u64) << 32) ^ nonce ^ u64::from(std::process::id());
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    packet
}

/// C2/S2 layout: peer time (4) | our time (4) | peer random (1528)
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machines_complete() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let mut c0c1 = client.generate_initial().unwrap();
        assert_eq!(c0c1.len(), 1 + HANDSHAKE_SIZE);
        assert_eq!(c0c1[0], RTMP_VERSION);

        assert!(server.generate_initial().is_none());
        let mut s0s1s2 = server.process(&mut c0c1).unwrap().unwrap();
        assert_eq!(s0s1s2.len(), 1 + HANDSHAKE_SIZE * 2);

        let mut c2 = client.process(&mut s0s1s2).unwrap().unwrap();
        assert!(client.is_done());
        assert!(client.echo_verified());

        assert!(server.process(&mut c2).unwrap().is_none());
        assert!(server.is_done());
        assert!(server.echo_verified());
    }

    #[test]
    fn test_short_input_is_not_consumed() {
        let mut client = Handshake::new(HandshakeRole::Client);
        client.generate_initial();

        let mut partial = Bytes::from(vec![RTMP_VERSION; 1000]);
        assert!(client.process(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 1000);
        assert!(!client.is_done());
    }

    #[test]
    fn test_bytes_needed_per_role() {
        let mut client = Handshake::new(HandshakeRole::Client);
        assert_eq!(client.bytes_needed(), 0);
        client.generate_initial();
        assert_eq!(client.bytes_needed(), 1 + HANDSHAKE_SIZE * 2);

        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();
        assert_eq!(server.bytes_needed(), 1 + HANDSHAKE_SIZE);
    }

    #[test]
    fn test_legacy_version_rejected() {
        let mut client = Handshake::new(HandshakeRole::Client);
        client.generate_initial();

        let mut reply = BytesMut::new();
        reply.put_u8(2);
        reply.put_slice(&[0u8; HANDSHAKE_SIZE * 2]);
        let mut reply = reply.freeze();

        assert!(client.process(&mut reply).is_err());
    }

    #[test]
    fn test_garbage_echo_is_tolerated() {
        let mut client = Handshake::new(HandshakeRole::Client);
        client.generate_initial();

        let mut reply = BytesMut::new();
        reply.put_u8(RTMP_VERSION);
        reply.put_slice(&generate_packet());
        reply.put_slice(&[0xAB; HANDSHAKE_SIZE]);
        let mut reply = reply.freeze();

        assert!(client.process(&mut reply).unwrap().is_some());
        assert!(client.is_done());
        assert!(!client.echo_verified());
    }

    #[test]
    fn test_echo_keeps_peer_random() {
        let original = generate_packet();
        let echo = generate_echo(&original);
        assert_eq!(&original[0..4], &echo[0..4]);
        assert_eq!(&original[8..], &echo[8..]);
    }

    #[test]
    fn test_double_initial_is_noop() {
        let mut client = Handshake::new(HandshakeRole::Client);
        assert!(client.generate_initial().is_some());
        assert!(client.generate_initial().is_none());
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let server = tokio::spawn(async move { server_handshake(&mut server_io).await });

        client_handshake(&mut client_io).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_peer_hangup() {
        let (mut client_io, server_io) = tokio::io::duplex(8192);
        drop(server_io);

        let err = client_handshake(&mut client_io).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Handshake(HandshakeError::UnexpectedEof)
                | crate::error::Error::Io(_)
        ));
    }
}
