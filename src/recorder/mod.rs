//! Capture and encode driver
//!
//! The [`Recorder`] owns a [`CaptureSource`] and a [`MediaEncoder`] and runs
//! them on a dedicated thread. Each iteration pulls one raw event from the
//! source (bounded wait), feeds it to the encoder and drains whatever encoded
//! output is ready into the [`SampleSink`].
//!
//! States: `Idle -> Capturing -> Draining -> Idle`. A recorder runs once;
//! a new recording needs a new instance.

pub mod config;
pub mod encoder;
pub mod source;

pub use config::{AudioConfig, StreamConfig};
pub use encoder::{EncodedPacket, EncoderPoll, MediaEncoder};
pub use source::{AudioChunk, CaptureEvent, CaptureSource, VideoFrame};

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::media::{EncodedSample, SampleKind, Track};
use crate::sink::SampleSink;

/// Sleep between output polls while waiting for the encoder to flush
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecorderState {
    Idle = 0,
    Capturing = 1,
    Draining = 2,
}

impl RecorderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RecorderState::Capturing,
            2 => RecorderState::Draining,
            _ => RecorderState::Idle,
        }
    }
}

struct Devices {
    source: Box<dyn CaptureSource>,
    encoder: Box<dyn MediaEncoder>,
}

/// Drives capture and encoding on its own thread
pub struct Recorder {
    config: StreamConfig,
    sink: Arc<dyn SampleSink>,
    /// Present until `start` hands them to the capture thread
    devices: Mutex<Option<Devices>>,
    state: Arc<AtomicU8>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn initialization(e: Error) -> Error {
    match e {
        Error::Initialization(_) => e,
        other => Error::Initialization(other.to_string()),
    }
}

fn encode(e: Error) -> Error {
    match e {
        Error::Encode(_) => e,
        other => Error::Encode(other.to_string()),
    }
}

impl Recorder {
    pub fn new<S, E>(config: StreamConfig, source: S, encoder: E, sink: Arc<dyn SampleSink>) -> Self
    where
        S: CaptureSource + 'static,
        E: MediaEncoder + 'static,
    {
        Self {
            config,
            sink,
            devices: Mutex::new(Some(Devices {
                source: Box::new(source),
                encoder: Box::new(encoder),
            })),
            state: Arc::new(AtomicU8::new(RecorderState::Idle as u8)),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open the capture source, configure the encoder and start the
    /// capture thread.
    ///
    /// Setup failures are returned as [`Error::Initialization`] and leave
    /// the recorder idle.
    pub fn start(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Initialization("recorder has quit".into()));
        }

        let mut slot = lock(&self.devices);
        let mut devices = slot
            .take()
            .ok_or_else(|| Error::Initialization("recorder already started".into()))?;

        if let Err(e) = self.config.validate() {
            *slot = Some(devices);
            return Err(e);
        }
        if let Err(e) = devices.source.open(&self.config) {
            *slot = Some(devices);
            return Err(initialization(e));
        }
        if let Err(e) = devices.encoder.configure(&self.config) {
            devices.source.close();
            *slot = Some(devices);
            return Err(initialization(e));
        }
        drop(slot);

        self.state
            .store(RecorderState::Capturing as u8, Ordering::Release);

        let capture = CaptureLoop {
            config: self.config.clone(),
            source: devices.source,
            encoder: devices.encoder,
            sink: self.sink.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            timeline: Timeline::default(),
            released: false,
            frames_in: 0,
            samples_out: 0,
        };

        let handle = thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || capture.run())
            .map_err(|e| {
                self.state.store(RecorderState::Idle as u8, Ordering::Release);
                Error::Initialization(format!("failed to spawn capture thread: {}", e))
            })?;

        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    /// Drain, emit end-of-stream, release devices and join the capture
    /// thread. Later calls do nothing.
    pub fn quit(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }

        // Never started: the devices were never opened
        lock(&self.devices).take();
        self.state.store(RecorderState::Idle as u8, Ordering::Release);
    }

    pub fn state(&self) -> RecorderState {
        RecorderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() != RecorderState::Idle
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.quit();
    }
}

/// Turns encoder packets into stream samples: one sequence header per
/// track, timestamps rebased to the first frame and never decreasing
#[derive(Debug, Default)]
struct Timeline {
    base_us: Option<u64>,
    last_video_us: u64,
    last_audio_us: u64,
    video_header: bool,
    audio_header: bool,
}

impl Timeline {
    fn sample(&mut self, packet: EncodedPacket) -> Option<EncodedSample> {
        if packet.data.is_empty() {
            trace!(track = ?packet.track, "empty encoder output");
            return None;
        }

        if packet.codec_config {
            let seen = match packet.track {
                Track::Video => &mut self.video_header,
                Track::Audio => &mut self.audio_header,
            };
            if *seen {
                debug!(track = ?packet.track, "ignoring repeated codec config");
                return None;
            }
            *seen = true;
            let kind = match packet.track {
                Track::Video => SampleKind::VideoSequenceHeader,
                Track::Audio => SampleKind::AudioSequenceHeader,
            };
            return Some(EncodedSample::new(kind, packet.data, 0));
        }

        let base = *self.base_us.get_or_insert(packet.pts_us);
        let last = match packet.track {
            Track::Video => &mut self.last_video_us,
            Track::Audio => &mut self.last_audio_us,
        };
        let pts_us = packet.pts_us.saturating_sub(base).max(*last);
        *last = pts_us;

        let kind = match (packet.track, packet.keyframe) {
            (Track::Video, true) => SampleKind::VideoKeyFrame,
            (Track::Video, false) => SampleKind::VideoInterFrame,
            (Track::Audio, _) => SampleKind::AudioFrame,
        };
        Some(EncodedSample::new(kind, packet.data, pts_us))
    }

    fn end_pts(&self) -> u64 {
        self.last_video_us.max(self.last_audio_us)
    }
}

struct CaptureLoop {
    config: StreamConfig,
    source: Box<dyn CaptureSource>,
    encoder: Box<dyn MediaEncoder>,
    sink: Arc<dyn SampleSink>,
    state: Arc<AtomicU8>,
    shutdown: Arc<AtomicBool>,
    timeline: Timeline,
    released: bool,
    frames_in: u64,
    samples_out: u64,
}

impl CaptureLoop {
    fn run(mut self) {
        info!(
            width = self.config.width,
            height = self.config.height,
            fps = self.config.frame_rate,
            bitrate = self.config.bitrate,
            "capture started"
        );

        match self.capture() {
            Ok(()) => info!(
                frames = self.frames_in,
                samples = self.samples_out,
                "capture finished"
            ),
            Err(e) => {
                error!(error = %e, frames = self.frames_in, "capture stopped on error");
                self.sink.on_error(&e);
            }
        }

        self.release();
        self.state.store(RecorderState::Idle as u8, Ordering::Release);
    }

    fn capture(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.source.next(self.config.poll_timeout).map_err(encode)? {
                Some(CaptureEvent::Video(frame)) => {
                    self.frames_in += 1;
                    self.encoder.queue_video(frame).map_err(encode)?;
                }
                Some(CaptureEvent::Audio(chunk)) => {
                    if self.config.audio.is_some() {
                        self.encoder.queue_audio(chunk).map_err(encode)?;
                    }
                }
                Some(CaptureEvent::EndOfStream) => {
                    info!("capture source ended");
                    break;
                }
                None => {}
            }

            if self.drain_ready()? {
                warn!("encoder ended the stream before end of input");
                self.finish();
                return Ok(());
            }
        }

        self.state
            .store(RecorderState::Draining as u8, Ordering::Release);
        self.encoder.signal_end_of_input().map_err(encode)?;

        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            match self.encoder.poll_output().map_err(encode)? {
                EncoderPoll::Packet(packet) => self.emit(packet),
                EncoderPoll::EndOfStream => break,
                EncoderPoll::TryAgain if Instant::now() >= deadline => {
                    warn!(
                        timeout_ms = self.config.drain_timeout.as_millis() as u64,
                        "encoder flush timed out"
                    );
                    break;
                }
                EncoderPoll::TryAgain => thread::sleep(DRAIN_POLL_INTERVAL),
            }
        }

        self.finish();
        Ok(())
    }

    /// Hand over every ready packet. Returns true if the encoder reported
    /// end of stream.
    fn drain_ready(&mut self) -> Result<bool> {
        loop {
            match self.encoder.poll_output().map_err(encode)? {
                EncoderPoll::Packet(packet) => self.emit(packet),
                EncoderPoll::TryAgain => return Ok(false),
                EncoderPoll::EndOfStream => return Ok(true),
            }
        }
    }

    fn emit(&mut self, packet: EncodedPacket) {
        if let Some(sample) = self.timeline.sample(packet) {
            trace!(kind = ?sample.kind, pts_us = sample.pts_us, size = sample.payload.len(), "sample");
            self.samples_out += 1;
            self.sink.accept(sample);
        }
    }

    fn finish(&mut self) {
        self.sink
            .accept(EncodedSample::end_of_stream(self.timeline.end_pts()));
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.encoder.release();
        self.source.close();
        debug!("capture devices released");
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.release();
    }
}
