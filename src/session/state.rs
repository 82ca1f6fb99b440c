//! Publisher session state machine
//!
//! Tracks one outgoing RTMP connection from TCP connect to teardown:
//!
//! ```text
//! Disconnected -> Handshaking -> Connecting -> Publishing -> Closing -> Disconnected
//! ```
//!
//! Any I/O failure moves straight back to `Disconnected`.

use std::time::{Duration, Instant};

use crate::protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW_ACK_SIZE};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No socket
    Disconnected,
    /// TCP connected, handshake in progress
    Handshaking,
    /// Handshake done, running connect/createStream/publish
    Connecting,
    /// Publish accepted; media may flow
    Publishing,
    /// Sending unpublish/deleteStream before teardown
    Closing,
}

/// Per-connection bookkeeping
#[derive(Debug)]
pub struct SessionState {
    pub phase: SessionPhase,

    /// When the current connection was established
    pub connected_at: Option<Instant>,

    /// Chunk size the server sends with
    pub in_chunk_size: u32,

    /// Chunk size we send with
    pub out_chunk_size: u32,

    /// Message stream ID returned by createStream
    pub stream_id: u32,

    /// Server's window acknowledgement size
    pub window_ack_size: u32,

    /// Bandwidth limit the server asked us to honor
    pub peer_bandwidth: Option<u32>,

    pub bytes_received: u64,

    pub bytes_sent: u64,

    /// Value of `bytes_received` when we last acknowledged
    pub last_ack: u64,

    next_transaction_id: f64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            connected_at: None,
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            stream_id: 0,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: None,
            bytes_received: 0,
            bytes_sent: 0,
            last_ack: 0,
            next_transaction_id: 1.0,
        }
    }

    /// TCP is up: forget everything from the previous connection
    pub fn start_handshake(&mut self) {
        *self = Self::new();
        self.phase = SessionPhase::Handshaking;
        self.connected_at = Some(Instant::now());
    }

    pub fn complete_handshake(&mut self) {
        if self.phase == SessionPhase::Handshaking {
            self.phase = SessionPhase::Connecting;
        }
    }

    pub fn on_publish_started(&mut self, stream_id: u32) {
        if self.phase == SessionPhase::Connecting {
            self.stream_id = stream_id;
            self.phase = SessionPhase::Publishing;
        }
    }

    pub fn close(&mut self) {
        if self.phase != SessionPhase::Disconnected {
            self.phase = SessionPhase::Closing;
        }
    }

    pub fn disconnect(&mut self) {
        self.phase = SessionPhase::Disconnected;
    }

    pub fn is_publishing(&self) -> bool {
        self.phase == SessionPhase::Publishing
    }

    /// Transaction id for the next command. `connect` always uses 1.
    pub fn next_transaction_id(&mut self) -> f64 {
        self.next_transaction_id += 1.0;
        self.next_transaction_id
    }

    /// Count received bytes; true when an Acknowledgement is due
    pub fn add_bytes_received(&mut self, bytes: u64) -> bool {
        self.bytes_received += bytes;
        self.window_ack_size > 0
            && self.bytes_received - self.last_ack >= self.window_ack_size as u64
    }

    /// Record an Acknowledgement; returns the sequence number to send
    /// (wraps at 32 bits)
    pub fn mark_ack_sent(&mut self) -> u32 {
        self.last_ack = self.bytes_received;
        self.bytes_received as u32
    }

    pub fn add_bytes_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
    }

    pub fn duration(&self) -> Duration {
        self.connected_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut state = SessionState::new();
        assert_eq!(state.phase, SessionPhase::Disconnected);

        state.start_handshake();
        assert_eq!(state.phase, SessionPhase::Handshaking);
        assert!(state.connected_at.is_some());

        state.complete_handshake();
        assert_eq!(state.phase, SessionPhase::Connecting);

        state.on_publish_started(1);
        assert!(state.is_publishing());
        assert_eq!(state.stream_id, 1);

        state.close();
        assert_eq!(state.phase, SessionPhase::Closing);
        state.disconnect();
        assert_eq!(state.phase, SessionPhase::Disconnected);
    }

    #[test]
    fn test_publish_requires_connecting() {
        let mut state = SessionState::new();
        state.on_publish_started(1);
        assert_eq!(state.phase, SessionPhase::Disconnected);
    }

    #[test]
    fn test_close_when_disconnected_is_noop() {
        let mut state = SessionState::new();
        state.close();
        assert_eq!(state.phase, SessionPhase::Disconnected);
    }

    #[test]
    fn test_ack_window() {
        let mut state = SessionState::new();
        state.window_ack_size = 1000;
        assert!(!state.add_bytes_received(999));
        assert!(state.add_bytes_received(1));
        assert_eq!(state.mark_ack_sent(), 1000);
        assert!(!state.add_bytes_received(500));
    }

    #[test]
    fn test_reconnect_resets_state() {
        let mut state = SessionState::new();
        state.start_handshake();
        state.out_chunk_size = 4096;
        state.bytes_sent = 10;
        assert_eq!(state.next_transaction_id(), 2.0);

        state.start_handshake();
        assert_eq!(state.out_chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(state.bytes_sent, 0);
        assert_eq!(state.next_transaction_id(), 2.0);
    }
}
