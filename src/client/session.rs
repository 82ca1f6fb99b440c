//! RTMP publishing session
//!
//! Owns one TCP connection to an ingest server. `connect` runs the
//! handshake and the publish command sequence:
//!
//! ```text
//! connect -> _result
//! releaseStream, FCPublish (replies ignored)
//! createStream -> _result(stream id)
//! publish(key, "live") -> onStatus(NetStream.Publish.Start)
//! ```
//!
//! After that, `send` writes one FLV tag per call as an audio/video/data
//! message on the created stream. Incoming traffic (pings, acknowledgement
//! windows, chunk size changes) is serviced opportunistically on each send.

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::amf::{amf0, AmfValue};
use crate::client::config::{ClientConfig, RtmpUrl};
use crate::client::transport::Transport;
use crate::error::{ConnectionError, Error, MediaError, ProtocolError, Result};
use crate::media::{FlvTag, FlvTagType};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake::client_handshake;
use crate::protocol::message::{Command, RtmpMessage, UserControlEvent};
use crate::session::{SessionPhase, SessionState};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// An RTMP publisher connection
pub struct RtmpSession {
    config: ClientConfig,
    state: SessionState,
    conn: Option<Connection>,
    stream_key: String,
}

struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    encoder: ChunkEncoder,
    decoder: ChunkDecoder,
    window_ack_size: u32,
}

impl RtmpSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: SessionState::new(),
            conn: None,
            stream_key: String::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    async fn establish(&mut self, url: &RtmpUrl) -> Result<()> {
        let stream = TcpStream::connect(url.address()).await?;
        if self.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        self.state.start_handshake();
        let mut conn = Connection {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            encoder: ChunkEncoder::new(),
            decoder: ChunkDecoder::new(),
            window_ack_size: self.config.window_ack_size,
        };
        client_handshake(&mut conn.stream).await?;
        self.state.complete_handshake();
        tracing::debug!(url = %url, "handshake complete");

        // Announce our chunk size before the first message that uses it
        let chunk_size = self.config.chunk_size;
        conn.write_message(&RtmpMessage::SetChunkSize(chunk_size), 0)
            .await?;
        conn.encoder.set_chunk_size(chunk_size)?;
        self.state.out_chunk_size = chunk_size;

        let connect = Command::connect(&url.app, &url.tc_url(), &self.config.flash_ver);
        conn.write_message(&RtmpMessage::Command(connect), 0).await?;
        conn.wait_for_result(&mut self.state, 1.0, CMD_CONNECT)
            .await?;
        tracing::debug!(app = %url.app, "connect accepted");

        let key = url.stream_key.as_str();
        let tx = self.state.next_transaction_id();
        conn.write_message(&RtmpMessage::Command(Command::release_stream(tx, key)), 0)
            .await?;
        let tx = self.state.next_transaction_id();
        conn.write_message(&RtmpMessage::Command(Command::fc_publish(tx, key)), 0)
            .await?;

        let tx = self.state.next_transaction_id();
        conn.write_message(&RtmpMessage::Command(Command::create_stream(tx)), 0)
            .await?;
        let reply = conn
            .wait_for_result(&mut self.state, tx, CMD_CREATE_STREAM)
            .await?;
        let stream_id = reply
            .arguments
            .iter()
            .chain(std::iter::once(&reply.command_object))
            .find_map(AmfValue::as_number)
            .ok_or(ProtocolError::MalformedMessage("createStream result"))? as u32;

        let tx = self.state.next_transaction_id();
        conn.write_message(
            &RtmpMessage::Command(Command::publish(tx, stream_id, key)),
            0,
        )
        .await?;
        conn.wait_for_publish_start(&mut self.state, tx).await?;

        self.state.on_publish_started(stream_id);
        self.stream_key = url.stream_key.clone();
        self.conn = Some(conn);
        Ok(())
    }

    /// Drop the connection after a failure
    fn fail(&mut self, err: &Error) {
        if self.conn.take().is_some() {
            tracing::warn!(error = %err, "connection lost");
        }
        self.state.disconnect();
    }

    /// Write one message on the publishing stream.
    ///
    /// Local problems (an oversized payload) are reported without touching
    /// the connection. Anything that fails on the wire drops it. Servicing
    /// pending server traffic counts against the write timeout too.
    async fn write_checked(&mut self, msg: RtmpMessage) -> Result<()> {
        let chunk = msg.to_chunk(self.state.stream_id);
        if chunk.payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(MediaError::TooLarge(chunk.payload.len()).into());
        }

        if !self.state.is_publishing() {
            return Err(ConnectionError::NotConnected.into());
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(ConnectionError::NotConnected.into());
        };

        let state = &mut self.state;
        let exchange = async {
            conn.service_incoming(state).await?;
            conn.write_chunk(&chunk).await
        };
        let outcome = timeout(self.config.write_timeout, exchange).await;
        let err = match outcome {
            Ok(Ok(n)) => {
                self.state.add_bytes_sent(n as u64);
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout("write"),
        };

        self.fail(&err);
        Err(err)
    }
}

#[async_trait]
impl Transport for RtmpSession {
    async fn connect(&mut self, url: &RtmpUrl) -> Result<()> {
        if self.conn.is_some() {
            self.close().await;
        }

        tracing::info!(url = %url, "connecting");
        match timeout(self.config.connect_timeout, self.establish(url)).await {
            Ok(Ok(())) => {
                tracing::info!(url = %url, stream_id = self.state.stream_id, "publishing");
                Ok(())
            }
            Ok(Err(e)) => {
                let e = e.into_connection_error();
                self.fail(&e);
                Err(e)
            }
            Err(_) => {
                let e = Error::Connection(ConnectionError::Timeout);
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn send_metadata(&mut self, metadata: &AmfValue) -> Result<()> {
        self.write_checked(RtmpMessage::set_data_frame(metadata.clone()))
            .await
    }

    async fn send(&mut self, tag: &FlvTag) -> Result<()> {
        let msg = match tag.tag_type {
            FlvTagType::Video => RtmpMessage::Video {
                timestamp: tag.timestamp,
                data: tag.data.clone(),
            },
            FlvTagType::Audio => RtmpMessage::Audio {
                timestamp: tag.timestamp,
                data: tag.data.clone(),
            },
            FlvTagType::Script => {
                let mut values = vec![AmfValue::from("@setDataFrame")];
                values.extend(amf0::decode_all(tag.data.clone())?);
                RtmpMessage::Data(values)
            }
        };
        tracing::trace!(
            kind = ?tag.tag_type,
            timestamp = tag.timestamp,
            size = tag.size(),
            "send tag"
        );
        self.write_checked(msg).await
    }

    async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            self.state.disconnect();
            return;
        };

        if self.state.is_publishing() {
            self.state.close();
            let stream_id = self.state.stream_id;
            let unpublish = Command::fc_unpublish(self.state.next_transaction_id(), &self.stream_key);
            let delete = Command::delete_stream(self.state.next_transaction_id(), stream_id);
            let goodbye = async {
                conn.write_message(&RtmpMessage::Command(unpublish), 0).await?;
                conn.write_message(&RtmpMessage::Command(delete), 0).await?;
                Ok::<_, Error>(())
            };
            match timeout(self.config.write_timeout, goodbye).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "unpublish failed"),
                Err(_) => tracing::debug!("unpublish timed out"),
            }
        }

        let _ = conn.stream.shutdown().await;
        self.state.disconnect();
        tracing::info!(
            bytes_sent = self.state.bytes_sent,
            duration_ms = self.state.duration().as_millis() as u64,
            "session closed"
        );
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some() && self.state.is_publishing()
    }
}

impl Connection {
    /// Chunk and write one message; returns the bytes written
    async fn write_message(&mut self, msg: &RtmpMessage, stream_id: u32) -> Result<usize> {
        self.write_chunk(&msg.to_chunk(stream_id)).await
    }

    async fn write_chunk(&mut self, chunk: &RtmpChunk) -> Result<usize> {
        self.write_buf.clear();
        self.encoder.encode(chunk, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(self.write_buf.len())
    }

    /// Next non-control message, reading from the socket as needed
    async fn read_message(&mut self, state: &mut SessionState) -> Result<RtmpMessage> {
        loop {
            while let Some(chunk) = self.decoder.decode(&mut self.read_buf)? {
                let msg = RtmpMessage::from_chunk(&chunk)?;
                if !self.handle_control(&msg, state).await? {
                    return Ok(msg);
                }
            }

            self.read_buf.reserve(READ_BUFFER_SIZE);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Closed.into());
            }
            self.on_bytes_received(n, state).await?;
        }
    }

    /// Process whatever the server sent since the last call without
    /// blocking. Commands arriving mid-publish are only logged, except
    /// error-level status which ends the session.
    async fn service_incoming(&mut self, state: &mut SessionState) -> Result<()> {
        loop {
            self.read_buf.reserve(READ_BUFFER_SIZE);
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(ConnectionError::Closed.into()),
                Ok(n) => self.on_bytes_received(n, state).await?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(chunk) = self.decoder.decode(&mut self.read_buf)? {
            let msg = RtmpMessage::from_chunk(&chunk)?;
            if self.handle_control(&msg, state).await? {
                continue;
            }
            if let RtmpMessage::Command(cmd) = msg {
                if is_error_status(&cmd) {
                    return Err(ConnectionError::Rejected {
                        command: cmd.name.clone(),
                        reason: cmd.describe(),
                    }
                    .into());
                }
                tracing::debug!(command = %cmd.name, code = ?cmd.status_code(), "server command");
            }
        }
        Ok(())
    }

    async fn on_bytes_received(&mut self, n: usize, state: &mut SessionState) -> Result<()> {
        if state.add_bytes_received(n as u64) {
            let sequence = state.mark_ack_sent();
            self.write_message(&RtmpMessage::Acknowledgement { sequence }, 0)
                .await?;
        }
        Ok(())
    }

    /// Apply protocol control messages; false if `msg` is not one
    async fn handle_control(&mut self, msg: &RtmpMessage, state: &mut SessionState) -> Result<bool> {
        match msg {
            RtmpMessage::SetChunkSize(size) => {
                self.decoder.set_chunk_size(*size)?;
                state.in_chunk_size = *size;
                tracing::debug!(size, "peer chunk size");
            }
            RtmpMessage::Abort { csid } => self.decoder.abort(*csid),
            RtmpMessage::Acknowledgement { .. } => {}
            RtmpMessage::WindowAckSize(size) => state.window_ack_size = *size,
            RtmpMessage::SetPeerBandwidth { size, .. } => {
                state.peer_bandwidth = Some(*size);
                let ours = RtmpMessage::WindowAckSize(self.window_ack_size);
                self.write_message(&ours, 0).await?;
            }
            RtmpMessage::UserControl(UserControlEvent::PingRequest(ts)) => {
                let pong = RtmpMessage::UserControl(UserControlEvent::PingResponse(*ts));
                self.write_message(&pong, 0).await?;
            }
            RtmpMessage::UserControl(_) => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Wait for the `_result` of `transaction_id`
    async fn wait_for_result(
        &mut self,
        state: &mut SessionState,
        transaction_id: f64,
        command: &str,
    ) -> Result<Command> {
        loop {
            let RtmpMessage::Command(cmd) = self.read_message(state).await? else {
                continue;
            };
            let ours = cmd.transaction_id == transaction_id;
            if ours && cmd.name == CMD_RESULT {
                return Ok(cmd);
            }
            if (ours && cmd.name == CMD_ERROR) || is_error_status(&cmd) {
                return Err(ConnectionError::Rejected {
                    command: command.to_string(),
                    reason: cmd.describe(),
                }
                .into());
            }
            tracing::trace!(command = %cmd.name, "ignoring reply");
        }
    }

    /// Wait for `onStatus(NetStream.Publish.Start)`
    async fn wait_for_publish_start(
        &mut self,
        state: &mut SessionState,
        transaction_id: f64,
    ) -> Result<()> {
        loop {
            let RtmpMessage::Command(cmd) = self.read_message(state).await? else {
                continue;
            };
            if cmd.name == CMD_ON_STATUS && cmd.status_code() == Some(NS_PUBLISH_START) {
                return Ok(());
            }
            if (cmd.name == CMD_ERROR && cmd.transaction_id == transaction_id)
                || is_error_status(&cmd)
            {
                return Err(ConnectionError::Rejected {
                    command: CMD_PUBLISH.to_string(),
                    reason: cmd.describe(),
                }
                .into());
            }
            tracing::trace!(command = %cmd.name, code = ?cmd.status_code(), "ignoring reply");
        }
    }
}

fn is_error_status(cmd: &Command) -> bool {
    cmd.name == CMD_ON_STATUS
        && cmd
            .info()
            .and_then(|info| info.get_string("level"))
            .is_some_and(|level| level == "error")
}
