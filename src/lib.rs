//! rtmp-screencast: screen capture to RTMP live streaming
//!
//! This library drives a capture → encode → mux → transport pipeline:
//! - `Recorder` pulls raw frames from a capture source and feeds the encoders
//! - Encoded access units become `EncodedSample`s handed to a `SampleSink`
//! - `StreamingSender` queues samples, muxes them into FLV tags and publishes
//!   them over an `RtmpSession`, reconnecting with bounded backoff
//!
//! The two halves run on independent execution contexts and only share the
//! bounded queue behind the `SampleSink` interface, so a stalled network never
//! stalls frame capture.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtmp_screencast::{SampleSink, SenderConfig, StreamingSender};
//!
//! # async fn example() -> rtmp_screencast::Result<()> {
//! let (sender, mut events) = StreamingSender::with_config(SenderConfig::default());
//! let sender = Arc::new(sender);
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! sender.start("rtmp://localhost/live/stream_key")?;
//!
//! // Hand `sender.clone() as Arc<dyn SampleSink>` to a Recorder...
//! let _sink: Arc<dyn SampleSink> = sender.clone();
//!
//! sender.stop();
//! sender.quit().await;
//! # Ok(())
//! # }
//! ```

pub mod amf;
pub mod client;
pub mod error;
pub mod media;
pub mod protocol;
pub mod recorder;
pub mod sender;
pub mod session;
pub mod sink;
pub mod stats;

// Re-export main types for convenience
pub use client::{ClientConfig, RtmpSession, RtmpUrl, Transport};
pub use error::{Error, Result};
pub use media::{EncodedSample, FlvMuxer, SampleKind};
pub use recorder::{CaptureSource, MediaEncoder, Recorder, RecorderState, StreamConfig};
pub use sender::{SenderConfig, SenderEvent, SenderState, StreamingSender};
pub use sink::SampleSink;
