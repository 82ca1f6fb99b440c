//! End-to-end publishing against an in-process RTMP ingest server.
//!
//! The server is built from the crate's own handshake, chunk and AMF
//! codecs. It answers the publish command sequence, pings the client and
//! reports every message it receives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use rtmp_screencast::amf::AmfValue;
use rtmp_screencast::error::{ConnectionError, MediaError};
use rtmp_screencast::media::{FlvTag, Track};
use rtmp_screencast::protocol::constants::*;
use rtmp_screencast::protocol::{
    server_handshake, ChunkDecoder, ChunkEncoder, Command, RtmpMessage, UserControlEvent,
};
use rtmp_screencast::recorder::{
    AudioChunk, CaptureEvent, EncodedPacket, EncoderPoll, VideoFrame,
};
use rtmp_screencast::session::SessionPhase;
use rtmp_screencast::{
    CaptureSource, ClientConfig, EncodedSample, Error, MediaEncoder, Recorder, RtmpSession,
    RtmpUrl, SampleKind, SenderConfig, SenderEvent, StreamConfig, StreamingSender, Transport,
};

static SPS_PPS: [u8; 17] = [
    0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F, 0xE9, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80,
];
static ASC: [u8; 2] = [0x12, 0x10];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, Default)]
struct Behavior {
    reject_publish: bool,
    /// Ping once more after publish, then never read again
    stall_after_publish: bool,
}

#[derive(Debug)]
enum ServerEvent {
    Message(RtmpMessage),
    Closed,
}

struct FakeServer {
    port: u16,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl FakeServer {
    async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, behavior, tx.clone()).await {
                        tracing::debug!(error = %e, "fake server connection ended");
                    }
                    let _ = tx.send(ServerEvent::Closed);
                });
            }
        });

        Self { port, events }
    }

    fn url(&self) -> String {
        format!("rtmp://127.0.0.1:{}/live/stream1", self.port)
    }

    /// Messages received up to the next connection close
    async fn session(&mut self) -> Vec<RtmpMessage> {
        let mut messages = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for server")
                .expect("server gone");
            match event {
                ServerEvent::Message(msg) => messages.push(msg),
                ServerEvent::Closed => return messages,
            }
        }
    }
}

async fn write(
    stream: &mut TcpStream,
    encoder: &ChunkEncoder,
    msg: RtmpMessage,
) -> rtmp_screencast::Result<()> {
    let mut out = BytesMut::new();
    encoder.encode(&msg.to_chunk(1), &mut out)?;
    stream.write_all(&out).await?;
    Ok(())
}

fn replies(cmd: &Command, behavior: Behavior) -> Vec<RtmpMessage> {
    let status = |level: &str, code: &str| {
        AmfValue::object([
            ("level", AmfValue::from(level)),
            ("code", AmfValue::from(code)),
            ("description", AmfValue::from("fake server")),
        ])
    };

    let reply = match cmd.name.as_str() {
        CMD_CONNECT => Command::new(CMD_RESULT, cmd.transaction_id)
            .with_object(AmfValue::object([
                ("fmsVer", AmfValue::from("FMS/3,0,1,123")),
                ("capabilities", AmfValue::from(31.0)),
            ]))
            .with_arg(status("status", NC_CONNECT_SUCCESS)),
        CMD_RELEASE_STREAM => Command::new(CMD_RESULT, cmd.transaction_id),
        CMD_CREATE_STREAM => Command::new(CMD_RESULT, cmd.transaction_id).with_arg(1.0),
        CMD_PUBLISH if behavior.reject_publish => Command::new(CMD_ON_STATUS, 0.0)
            .with_arg(status("error", "NetStream.Publish.BadName"))
            .on_stream(1),
        CMD_PUBLISH => Command::new(CMD_ON_STATUS, 0.0)
            .with_arg(status("status", NS_PUBLISH_START))
            .on_stream(1),
        _ => return Vec::new(),
    };
    vec![RtmpMessage::Command(reply)]
}

async fn serve(
    mut stream: TcpStream,
    behavior: Behavior,
    events: mpsc::UnboundedSender<ServerEvent>,
) -> rtmp_screencast::Result<()> {
    server_handshake(&mut stream).await?;

    let mut decoder = ChunkDecoder::new();
    let encoder = ChunkEncoder::new();
    let mut read_buf = BytesMut::with_capacity(64 * 1024);

    write(&mut stream, &encoder, RtmpMessage::WindowAckSize(2_500_000)).await?;
    write(
        &mut stream,
        &encoder,
        RtmpMessage::SetPeerBandwidth {
            size: 2_500_000,
            limit_type: 2,
        },
    )
    .await?;
    write(
        &mut stream,
        &encoder,
        RtmpMessage::UserControl(UserControlEvent::PingRequest(7)),
    )
    .await?;

    loop {
        while let Some(chunk) = decoder.decode(&mut read_buf)? {
            let msg = RtmpMessage::from_chunk(&chunk)?;
            if let RtmpMessage::SetChunkSize(size) = msg {
                decoder.set_chunk_size(size)?;
            }
            if let RtmpMessage::Command(cmd) = &msg {
                for reply in replies(cmd, behavior) {
                    write(&mut stream, &encoder, reply).await?;
                }
                if behavior.stall_after_publish && cmd.name == CMD_PUBLISH {
                    write(
                        &mut stream,
                        &encoder,
                        RtmpMessage::UserControl(UserControlEvent::PingRequest(9)),
                    )
                    .await?;
                    std::future::pending::<()>().await;
                }
            }
            let _ = events.send(ServerEvent::Message(msg));
        }

        read_buf.reserve(16 * 1024);
        if stream.read_buf(&mut read_buf).await? == 0 {
            return Ok(());
        }
    }
}

fn command_names(messages: &[RtmpMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|m| match m {
            RtmpMessage::Command(cmd) => Some(cmd.name.as_str()),
            _ => None,
        })
        .collect()
}

/// Audio/video/data messages in arrival order
fn media(messages: &[RtmpMessage]) -> Vec<&RtmpMessage> {
    messages
        .iter()
        .filter(|m| {
            matches!(
                m,
                RtmpMessage::Video { .. } | RtmpMessage::Audio { .. } | RtmpMessage::Data(_)
            )
        })
        .collect()
}

#[tokio::test]
async fn test_session_publishes_and_closes() {
    init_tracing();
    let mut server = FakeServer::spawn(Behavior::default()).await;

    let mut session = RtmpSession::new(ClientConfig::default());
    let url = RtmpUrl::parse(&server.url()).unwrap();
    session.connect(&url).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(session.phase(), SessionPhase::Publishing);
    assert_eq!(session.state().stream_id, 1);

    let mut big = vec![0x17u8, 0x01, 0, 0, 0];
    big.extend(std::iter::repeat(0x5A).take(10_000));
    let big = Bytes::from(big);

    let meta = AmfValue::ecma_array([("width", 1280.0), ("height", 720.0)]);
    session.send_metadata(&meta).await.unwrap();
    session
        .send(&FlvTag::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 1, 0x42])))
        .await
        .unwrap();
    session.send(&FlvTag::video(40, big.clone())).await.unwrap();
    session
        .send(&FlvTag::audio(46, Bytes::from_static(&[0xAF, 0x01, 0x21])))
        .await
        .unwrap();
    session.close().await;
    session.close().await;
    assert_eq!(session.phase(), SessionPhase::Disconnected);

    let messages = server.session().await;
    assert_eq!(messages[0], RtmpMessage::SetChunkSize(RECOMMENDED_CHUNK_SIZE));
    assert_eq!(
        command_names(&messages),
        vec![
            CMD_CONNECT,
            CMD_RELEASE_STREAM,
            CMD_FC_PUBLISH,
            CMD_CREATE_STREAM,
            CMD_PUBLISH,
            CMD_FC_UNPUBLISH,
            CMD_DELETE_STREAM,
        ]
    );
    assert!(messages.iter().any(|m| matches!(
        m,
        RtmpMessage::UserControl(UserControlEvent::PingResponse(7))
    )));
    assert!(messages
        .iter()
        .any(|m| matches!(m, RtmpMessage::WindowAckSize(_))));

    let publish = messages
        .iter()
        .find_map(|m| match m {
            RtmpMessage::Command(cmd) if cmd.name == CMD_PUBLISH => Some(cmd),
            _ => None,
        })
        .unwrap();
    assert_eq!(publish.stream_id, 1);
    assert_eq!(publish.arguments[0].as_str(), Some("stream1"));
    assert_eq!(publish.arguments[1].as_str(), Some("live"));

    let media = media(&messages);
    assert_eq!(media.len(), 4);
    match media[0] {
        RtmpMessage::Data(values) => {
            assert_eq!(values[0].as_str(), Some("@setDataFrame"));
            assert_eq!(values[1].as_str(), Some("onMetaData"));
            assert_eq!(values[2].get_number("width"), Some(1280.0));
        }
        other => panic!("expected metadata, got {:?}", other),
    }
    assert!(matches!(media[1], RtmpMessage::Video { timestamp: 0, .. }));
    match media[2] {
        RtmpMessage::Video { timestamp, data } => {
            assert_eq!(*timestamp, 40);
            assert_eq!(data, &big);
        }
        other => panic!("expected video, got {:?}", other),
    }
    assert!(matches!(media[3], RtmpMessage::Audio { timestamp: 46, .. }));
}

#[tokio::test]
async fn test_publish_rejected() {
    init_tracing();
    let server = FakeServer::spawn(Behavior {
        reject_publish: true,
        ..Behavior::default()
    })
    .await;

    let mut session = RtmpSession::new(ClientConfig::default());
    let url = RtmpUrl::parse(&server.url()).unwrap();
    let err = session.connect(&url).await.unwrap_err();

    match err {
        Error::Connection(ConnectionError::Rejected { command, reason }) => {
            assert_eq!(command, CMD_PUBLISH);
            assert!(reason.contains("BadName"), "{}", reason);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!session.is_connected());
    assert_eq!(session.phase(), SessionPhase::Disconnected);

    let err = session
        .send(&FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x01, 0x21])))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::NotConnected)
    ));
}

#[tokio::test]
async fn test_silent_server_times_out() {
    init_tracing();
    // Accepts at the TCP level but never answers the handshake
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = ClientConfig::default().connect_timeout(Duration::from_millis(200));
    let mut session = RtmpSession::new(config);
    let url = RtmpUrl::parse(&format!("rtmp://127.0.0.1:{}/live/key", port)).unwrap();

    let err = session.connect(&url).await.unwrap_err();
    assert!(
        matches!(err, Error::Connection(ConnectionError::Timeout)),
        "{:?}",
        err
    );
    assert_eq!(session.phase(), SessionPhase::Disconnected);
    drop(listener);
}

#[tokio::test]
async fn test_stalled_server_bounded_by_write_timeout() {
    init_tracing();
    let server = FakeServer::spawn(Behavior {
        stall_after_publish: true,
        ..Behavior::default()
    })
    .await;

    let config = ClientConfig::default().write_timeout(Duration::from_millis(300));
    let mut session = RtmpSession::new(config);
    let url = RtmpUrl::parse(&server.url()).unwrap();
    session.connect(&url).await.unwrap();

    let mut body = vec![0x27u8, 0x01, 0, 0, 0];
    body.resize(64 * 1024, 0x5A);
    let body = Bytes::from(body);

    // Socket buffers fill up eventually; the write that blocks must give up
    let mut failure = None;
    for i in 0..4096u32 {
        let started = std::time::Instant::now();
        if let Err(e) = session.send(&FlvTag::video(i * 40, body.clone())).await {
            failure = Some((e, started.elapsed()));
            break;
        }
    }

    let (err, elapsed) = failure.expect("writes never stalled");
    assert!(matches!(err, Error::Timeout("write")), "{:?}", err);
    assert!(err.is_network());
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_refused_connect_is_connection_error() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut session = RtmpSession::new(ClientConfig::default());
    let url = RtmpUrl::parse(&format!("rtmp://127.0.0.1:{}/live/key", port)).unwrap();

    let err = session.connect(&url).await.unwrap_err();
    assert!(
        matches!(err, Error::Connection(ConnectionError::Unreachable(_))),
        "{:?}",
        err
    );
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_oversized_payload_keeps_connection() {
    init_tracing();
    let mut server = FakeServer::spawn(Behavior::default()).await;
    let mut session = RtmpSession::new(ClientConfig::default());
    let url = RtmpUrl::parse(&server.url()).unwrap();
    session.connect(&url).await.unwrap();

    let mut body = vec![0x27u8, 0x01, 0, 0, 0];
    body.resize(MAX_MESSAGE_SIZE as usize + 1, 0x5A);
    let err = session
        .send(&FlvTag::video(40, Bytes::from(body)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Media(MediaError::TooLarge(_))), "{:?}", err);
    assert!(!err.is_network());
    assert!(session.is_connected());

    session
        .send(&FlvTag::video(80, Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 0xAB])))
        .await
        .unwrap();
    session.close().await;

    let messages = server.session().await;
    let media = media(&messages);
    assert_eq!(media.len(), 1);
    assert!(matches!(media[0], RtmpMessage::Video { timestamp: 80, .. }));
}

#[tokio::test]
async fn test_oversized_frame_is_skipped_without_reconnect() {
    init_tracing();
    let mut server = FakeServer::spawn(Behavior::default()).await;
    let (sender, mut events) = StreamingSender::with_config(SenderConfig::default());

    let mut oversized = vec![0x27u8, 0x01, 0, 0, 0];
    oversized.resize(17 * 1024 * 1024, 0);
    sender.enqueue(EncodedSample::new(SampleKind::VideoSequenceHeader, &SPS_PPS[..], 0));
    sender.enqueue(EncodedSample::new(SampleKind::VideoInterFrame, oversized, 40_000));
    sender.enqueue(EncodedSample::new(
        SampleKind::VideoInterFrame,
        vec![0u8, 0, 0, 1, 0x41, 0x9A],
        80_000,
    ));

    sender.start(&server.url()).unwrap();
    sender.stop();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for sender")
            .expect("sender gone");
        match event {
            SenderEvent::Stopped => break,
            SenderEvent::Reconnecting { .. } | SenderEvent::Failed(_) => {
                panic!("local error treated as a network fault: {:?}", event)
            }
            _ => {}
        }
    }
    sender.quit().await;

    let messages = server.session().await;
    let video: Vec<u32> = media(&messages)
        .into_iter()
        .filter_map(|m| match m {
            RtmpMessage::Video { timestamp, .. } => Some(*timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(video, vec![0, 80]);

    let stats = sender.stats();
    assert_eq!(stats.reconnects, 0);
    assert_eq!(stats.dropped_samples, 1);
}

async fn wait_for_stopped(events: &mut mpsc::Receiver<SenderEvent>) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for sender")
            .expect("sender gone");
        match event {
            SenderEvent::Stopped => return,
            SenderEvent::Failed(e) => panic!("sender failed: {}", e),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_sender_streams_headers_first() {
    init_tracing();
    let mut server = FakeServer::spawn(Behavior::default()).await;

    let stream_config = StreamConfig::default();
    let config = SenderConfig::default().metadata(stream_config.metadata());
    let (sender, mut events) = StreamingSender::with_config(config);

    // Queued before start: nothing may be lost
    sender.enqueue(EncodedSample::new(SampleKind::VideoSequenceHeader, &SPS_PPS[..], 0));
    sender.enqueue(EncodedSample::new(SampleKind::AudioSequenceHeader, &ASC[..], 0));
    sender.enqueue(EncodedSample::new(
        SampleKind::VideoKeyFrame,
        vec![0u8, 0, 0, 1, 0x65, 0x88, 0x84],
        0,
    ));
    sender.enqueue(EncodedSample::new(
        SampleKind::AudioFrame,
        vec![0x21u8, 0x10, 0x04],
        23_000,
    ));

    sender.start(&server.url()).unwrap();
    sender.stop();
    wait_for_stopped(&mut events).await;
    sender.quit().await;

    let messages = server.session().await;
    let media = media(&messages);
    assert_eq!(media.len(), 5, "{:?}", media);

    match media[0] {
        RtmpMessage::Data(values) => {
            assert_eq!(values[1].as_str(), Some("onMetaData"));
            assert_eq!(values[2].get_number("videocodecid"), Some(7.0));
        }
        other => panic!("expected metadata, got {:?}", other),
    }
    match media[1] {
        RtmpMessage::Video { timestamp: 0, data } => {
            assert_eq!(&data[..2], &[0x17, 0x00]);
            // AVCDecoderConfigurationRecord, profile from the SPS
            assert_eq!(data[5], 1);
            assert_eq!(data[6], 0x42);
        }
        other => panic!("expected AVC sequence header, got {:?}", other),
    }
    match media[2] {
        RtmpMessage::Audio { timestamp: 0, data } => {
            assert_eq!(&data[..], &[0xAF, 0x00, 0x12, 0x10]);
        }
        other => panic!("expected AAC sequence header, got {:?}", other),
    }
    match media[3] {
        RtmpMessage::Video { timestamp: 0, data } => {
            assert_eq!(&data[..], &[0x17, 0x01, 0, 0, 0, 0, 0, 0, 3, 0x65, 0x88, 0x84]);
        }
        other => panic!("expected key frame, got {:?}", other),
    }
    match media[4] {
        RtmpMessage::Audio { timestamp: 23, data } => {
            assert_eq!(&data[..], &[0xAF, 0x01, 0x21, 0x10, 0x04]);
        }
        other => panic!("expected AAC frame, got {:?}", other),
    }

    let stats = sender.stats();
    assert_eq!(stats.tags_sent, 4);
    assert_eq!(stats.keyframes, 1);
    assert_eq!(stats.total_dropped(), 0);
}

/// Three frames, then end of input
struct ScriptedScreen {
    frames: VecDeque<CaptureEvent>,
}

impl CaptureSource for ScriptedScreen {
    fn open(&mut self, _config: &StreamConfig) -> rtmp_screencast::Result<()> {
        Ok(())
    }

    fn next(&mut self, timeout: Duration) -> rtmp_screencast::Result<Option<CaptureEvent>> {
        match self.frames.pop_front() {
            Some(event) => Ok(Some(event)),
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {}
}

/// Emits Annex B SPS/PPS once, then one Annex B slice per frame
#[derive(Default)]
struct PassthroughEncoder {
    pending: VecDeque<EncodedPacket>,
    configured: bool,
    frames: u64,
    flushing: bool,
}

impl MediaEncoder for PassthroughEncoder {
    fn configure(&mut self, _config: &StreamConfig) -> rtmp_screencast::Result<()> {
        Ok(())
    }

    fn queue_video(&mut self, frame: VideoFrame) -> rtmp_screencast::Result<()> {
        if !self.configured {
            self.configured = true;
            self.pending.push_back(
                EncodedPacket::new(Track::Video, &SPS_PPS[..], frame.pts_us).codec_config(),
            );
        }
        let (nal, keyframe) = if self.frames == 0 { (0x65, true) } else { (0x41, false) };
        let mut packet =
            EncodedPacket::new(Track::Video, vec![0u8, 0, 0, 1, nal, 0x9A], frame.pts_us);
        if keyframe {
            packet = packet.keyframe();
        }
        self.pending.push_back(packet);
        self.frames += 1;
        Ok(())
    }

    fn queue_audio(&mut self, _chunk: AudioChunk) -> rtmp_screencast::Result<()> {
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> rtmp_screencast::Result<()> {
        self.flushing = true;
        Ok(())
    }

    fn poll_output(&mut self) -> rtmp_screencast::Result<EncoderPoll> {
        Ok(match self.pending.pop_front() {
            Some(packet) => EncoderPoll::Packet(packet),
            None if self.flushing => EncoderPoll::EndOfStream,
            None => EncoderPoll::TryAgain,
        })
    }

    fn release(&mut self) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recorder_to_server_pipeline() {
    init_tracing();
    let mut server = FakeServer::spawn(Behavior::default()).await;

    let (sender, mut events) = StreamingSender::with_config(SenderConfig::default());
    let sender = Arc::new(sender);
    sender.start(&server.url()).unwrap();

    let frames = (0..3u64)
        .map(|i| {
            CaptureEvent::Video(VideoFrame {
                data: Bytes::from_static(&[0; 8]),
                width: 1280,
                height: 720,
                pts_us: 7_000_000 + i * 33_333,
            })
        })
        .chain(std::iter::once(CaptureEvent::EndOfStream))
        .collect();

    let recorder = Recorder::new(
        StreamConfig::default()
            .audio(None)
            .poll_timeout(Duration::from_millis(1)),
        ScriptedScreen { frames },
        PassthroughEncoder::default(),
        sender.clone(),
    );
    recorder.start().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while recorder.is_running() {
        assert!(tokio::time::Instant::now() < deadline, "recorder never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    recorder.quit();

    sender.stop();
    wait_for_stopped(&mut events).await;
    sender.quit().await;

    let messages = server.session().await;
    let video: Vec<(u32, Bytes)> = media(&messages)
        .into_iter()
        .filter_map(|m| match m {
            RtmpMessage::Video { timestamp, data } => Some((*timestamp, data.clone())),
            _ => None,
        })
        .collect();

    assert_eq!(video.len(), 5, "{:?}", video);
    assert_eq!(&video[0].1[..2], &[0x17, 0x00]);
    assert_eq!((video[1].0, video[1].1[0]), (0, 0x17));
    assert_eq!((video[2].0, video[2].1[0]), (33, 0x27));
    assert_eq!((video[3].0, video[3].1[0]), (66, 0x27));
    // End of sequence
    assert_eq!(&video[4].1[..], &[0x17, 0x02, 0, 0, 0]);
}
