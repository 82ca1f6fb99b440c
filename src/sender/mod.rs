//! Streaming sender
//!
//! The sender is the consumer half of the pipeline. Producers hand it
//! samples through [`SampleSink::accept`]; a background task pops them off a
//! bounded queue, muxes them into FLV tags and publishes them over a
//! [`Transport`] (an [`RtmpSession`] unless a test substitutes one).
//!
//! Lifecycle:
//! - `start(url)` validates the URL synchronously and spawns the task on
//!   first use. Connecting happens in the background.
//! - `stop()` queues a stop marker; everything queued before it is sent,
//!   then the session closes and the task idles until the next `start`.
//! - `quit()` flushes, closes and joins the task. Calling it twice is fine.
//!
//! A transport failure triggers up to `max_reconnect_attempts` reconnects
//! with doubling backoff. When they are used up the task reports
//! [`SenderEvent::Failed`] and waits for an explicit restart.

pub mod config;
pub mod queue;

pub use config::SenderConfig;
pub use queue::{PushOutcome, QueueEntry, SampleQueue};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{RtmpSession, RtmpUrl, Transport};
use crate::error::{ConnectionError, Error, Result};
use crate::media::{EncodedSample, FlvMuxer, FlvTag};
use crate::sink::SampleSink;
use crate::stats::{SenderMetrics, SessionStats};

/// Polled sender state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Not streaming; samples are buffered
    Idle,
    Connecting,
    Publishing,
    /// Waiting out a backoff or retrying the connection
    Reconnecting,
    /// Reconnect attempts exhausted; waiting for `start`
    Failed,
    /// The task has exited after `quit`
    Terminated,
}

/// Status notifications for the controlling application
#[derive(Debug)]
pub enum SenderEvent {
    Connecting,
    Publishing,
    Reconnecting { attempt: u32, delay: Duration },
    /// Session closed after a stop marker or on quit
    Stopped,
    /// Terminal failure, usually [`Error::Streaming`]
    Failed(Error),
}

#[derive(Debug)]
enum Control {
    Start { url: RtmpUrl, generation: u64 },
    Quit,
}

/// State shared between the handle and the task
#[derive(Debug)]
struct Shared {
    queue: SampleQueue,
    metrics: SenderMetrics,
}

/// Queues encoded samples and publishes them from a background task
pub struct StreamingSender<T = RtmpSession> {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    state: Arc<watch::Sender<SenderState>>,
    /// Task parts, moved out on the first `start`
    worker: Mutex<Option<Worker<T>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    quitting: AtomicBool,
}

impl StreamingSender<RtmpSession> {
    /// Sender publishing over RTMP with default options
    pub fn new() -> (Self, mpsc::Receiver<SenderEvent>) {
        Self::with_config(SenderConfig::default())
    }

    /// Sender publishing over RTMP.
    ///
    /// Returns the sender and a receiver for status events.
    pub fn with_config(config: SenderConfig) -> (Self, mpsc::Receiver<SenderEvent>) {
        let transport = RtmpSession::new(config.client.clone());
        Self::with_transport(config, transport)
    }
}

impl<T: Transport + 'static> StreamingSender<T> {
    /// Sender over an arbitrary transport
    pub fn with_transport(
        config: SenderConfig,
        transport: T,
    ) -> (Self, mpsc::Receiver<SenderEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SenderState::Idle);
        let state = Arc::new(state_tx);

        let shared = Arc::new(Shared {
            queue: SampleQueue::new(config.queue_capacity),
            metrics: SenderMetrics::new(),
        });

        let worker = Worker {
            config,
            transport,
            muxer: FlvMuxer::new(),
            shared: shared.clone(),
            control_rx,
            events: event_tx,
            state: state.clone(),
            pending_start: None,
            stopped_through: 0,
            failures: 0,
        };

        let sender = Self {
            shared,
            control_tx,
            state,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
            quitting: AtomicBool::new(false),
        };
        (sender, event_rx)
    }

    /// Begin publishing to `url`.
    ///
    /// The URL is validated before returning; connecting happens on the
    /// sender task. Must be called from within a tokio runtime.
    pub fn start(&self, url: &str) -> Result<()> {
        if self.quitting.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed.into());
        }
        let url = RtmpUrl::parse(url)?;

        let mut pending = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_some() {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                Error::Initialization("streaming sender needs a tokio runtime".into())
            })?;
            if let Some(worker) = pending.take() {
                let handle = runtime.spawn(worker.run());
                *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
        }
        drop(pending);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(url = %url, generation, "start requested");
        self.control_tx
            .send(Control::Start { url, generation })
            .map_err(|_| Error::from(ConnectionError::Closed))
    }

    /// Flush what is queued, then close the session and go idle
    pub fn stop(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        if generation == 0 {
            return;
        }
        if self.shared.queue.push_stop(generation) {
            tracing::debug!(generation, "stop queued");
        }
    }

    /// Flush, close the session and join the task. Idempotent.
    pub async fn quit(&self) {
        if self.quitting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.close();
        let _ = self.control_tx.send(Control::Quit);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "sender task panicked");
                }
            }
            None => {
                // Never started: nothing to join
                self.state.send_replace(SenderState::Terminated);
            }
        }
    }

    /// Queue one sample. Never blocks on the network.
    pub fn enqueue(&self, sample: EncodedSample) -> PushOutcome {
        let outcome = self.shared.queue.push(sample);
        match outcome {
            PushOutcome::Evicted => {
                self.shared.metrics.record_dropped(1);
                tracing::warn!(
                    dropped = self.shared.metrics.dropped_samples(),
                    capacity = self.shared.queue.capacity(),
                    "queue full, evicted oldest sample"
                );
            }
            PushOutcome::Closed => {
                tracing::debug!("sender closed, sample discarded");
            }
            PushOutcome::Queued => {}
        }
        outcome
    }

    pub fn state(&self) -> SenderState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SenderState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.metrics.snapshot()
    }

    /// Samples waiting to be sent
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

impl<T> Drop for StreamingSender<T> {
    fn drop(&mut self) {
        // Lets a still-running task drain and exit
        self.shared.queue.close();
    }
}

impl<T: Transport + 'static> SampleSink for StreamingSender<T> {
    fn accept(&self, sample: EncodedSample) {
        self.enqueue(sample);
    }

    fn on_error(&self, error: &Error) {
        tracing::warn!(error = %error, "producer stopped with error");
    }
}

enum Flow {
    Idle,
    Quit,
}

enum Recovery {
    Resumed,
    Exhausted,
    Quit,
}

struct Worker<T> {
    config: SenderConfig,
    transport: T,
    muxer: FlvMuxer,
    shared: Arc<Shared>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    events: mpsc::Sender<SenderEvent>,
    state: Arc<watch::Sender<SenderState>>,
    /// A start that arrived while backing off
    pending_start: Option<(RtmpUrl, u64)>,
    /// Highest generation a stop marker has closed
    stopped_through: u64,
    /// Reconnect attempts since the last successful send
    failures: u32,
}

impl<T: Transport + 'static> Worker<T> {
    async fn run(mut self) {
        while let Some((url, generation)) = self.next_start().await {
            if generation <= self.stopped_through {
                tracing::debug!(generation, "start already superseded by stop");
                continue;
            }
            if let Flow::Quit = self.stream(&url, generation).await {
                break;
            }
        }

        self.transport.close().await;
        self.set_state(SenderState::Terminated);
        tracing::info!("sender task exited");
    }

    async fn next_start(&mut self) -> Option<(RtmpUrl, u64)> {
        if let Some(start) = self.pending_start.take() {
            return Some(start);
        }
        match self.control_rx.recv().await? {
            Control::Start { url, generation } => Some((url, generation)),
            Control::Quit => None,
        }
    }

    /// One publishing session, from connect to stop, quit or failure
    async fn stream(&mut self, url: &RtmpUrl, generation: u64) -> Flow {
        self.failures = 0;
        self.set_state(SenderState::Connecting);
        self.emit(SenderEvent::Connecting);

        if let Err(e) = self.open(url).await {
            tracing::warn!(url = %url, error = %e, "connect failed");
            match self.recover(url, e).await {
                Recovery::Resumed => {}
                Recovery::Exhausted => return Flow::Idle,
                Recovery::Quit => return Flow::Quit,
            }
        }

        loop {
            let entry = match self.shared.queue.pop().await {
                Some(entry) => entry,
                None => {
                    self.transport.close().await;
                    self.emit(SenderEvent::Stopped);
                    return Flow::Quit;
                }
            };

            match entry {
                QueueEntry::Stop(stop) if stop >= generation => {
                    self.stopped_through = self.stopped_through.max(stop);
                    self.transport.close().await;
                    self.set_state(SenderState::Idle);
                    self.emit(SenderEvent::Stopped);
                    tracing::info!(url = %url, "stream stopped");
                    return Flow::Idle;
                }
                QueueEntry::Stop(stop) => {
                    tracing::debug!(stop, generation, "ignoring stale stop marker");
                }
                QueueEntry::Sample(sample) => {
                    if let Some(flow) = self.forward(url, &sample).await {
                        return flow;
                    }
                }
            }
        }
    }

    /// Connect, then send metadata and cached sequence headers before
    /// anything else
    async fn open(&mut self, url: &RtmpUrl) -> Result<()> {
        self.transport.connect(url).await?;

        if let Some(metadata) = &self.config.metadata {
            self.transport.send_metadata(metadata).await?;
        }

        self.muxer.reset();
        for tag in self.muxer.session_headers() {
            self.transport.send(&tag).await?;
            self.shared.metrics.record_tag(&tag);
        }

        self.set_state(SenderState::Publishing);
        self.emit(SenderEvent::Publishing);
        tracing::info!(url = %url, "publishing");
        Ok(())
    }

    /// Mux and send one sample. Returns a flow change when the session
    /// ended.
    async fn forward(&mut self, url: &RtmpUrl, sample: &EncodedSample) -> Option<Flow> {
        let tags = match self.muxer.mux(sample) {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!(kind = ?sample.kind, error = %e, "skipping sample");
                return None;
            }
        };
        self.shared
            .metrics
            .set_dropped_unconfigured(self.muxer.dropped());

        for tag in &tags {
            match self.deliver(url, tag).await {
                Recovery::Resumed => {}
                Recovery::Exhausted => return Some(Flow::Idle),
                Recovery::Quit => return Some(Flow::Quit),
            }
        }
        None
    }

    async fn deliver(&mut self, url: &RtmpUrl, tag: &FlvTag) -> Recovery {
        loop {
            match self.transport.send(tag).await {
                Ok(()) => {
                    self.failures = 0;
                    self.shared.metrics.record_tag(tag);
                    tracing::trace!(
                        timestamp = tag.timestamp,
                        size = tag.size(),
                        video = tag.is_video(),
                        "tag sent"
                    );
                    return Recovery::Resumed;
                }
                Err(e) if !e.is_network() => {
                    // The link is fine; only this tag is unusable
                    self.shared.metrics.record_dropped(1);
                    tracing::warn!(
                        timestamp = tag.timestamp,
                        size = tag.size(),
                        error = %e,
                        "dropping tag"
                    );
                    return Recovery::Resumed;
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "send failed");
                    match self.recover(url, e).await {
                        // The reconnect already resent cached headers
                        Recovery::Resumed if tag.is_sequence_header() => {
                            return Recovery::Resumed
                        }
                        Recovery::Resumed => continue,
                        other => return other,
                    }
                }
            }
        }
    }

    /// Reconnect with backoff until it works, attempts run out or quit
    async fn recover(&mut self, url: &RtmpUrl, mut error: Error) -> Recovery {
        self.transport.close().await;

        while self.failures < self.config.max_reconnect_attempts {
            self.failures += 1;
            let attempt = self.failures;
            let delay = self.config.backoff_for(attempt);

            self.shared.metrics.record_reconnect();
            self.set_state(SenderState::Reconnecting);
            self.emit(SenderEvent::Reconnecting { attempt, delay });
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "reconnecting"
            );

            if !self.backoff(delay).await {
                return Recovery::Quit;
            }

            match self.open(url).await {
                Ok(()) => return Recovery::Resumed,
                Err(e) => {
                    self.transport.close().await;
                    error = e;
                }
            }
        }

        let attempts = self.failures;
        tracing::error!(url = %url, attempts, error = %error, "giving up on stream");
        self.set_state(SenderState::Failed);
        self.emit(SenderEvent::Failed(Error::Streaming {
            attempts,
            source: Box::new(error),
        }));
        Recovery::Exhausted
    }

    /// Sleep for `delay` unless quit arrives first. Returns false on quit.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                control = self.control_rx.recv() => match control {
                    Some(Control::Start { url, generation }) => {
                        self.pending_start = Some((url, generation));
                    }
                    Some(Control::Quit) | None => return false,
                },
            }
        }
    }

    fn set_state(&self, state: SenderState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SenderEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::debug!(?event, "event channel full, dropping event");
        }
    }
}
