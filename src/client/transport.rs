//! The seam between the sender and the network

use async_trait::async_trait;

use crate::amf::AmfValue;
use crate::client::config::RtmpUrl;
use crate::error::Result;
use crate::media::FlvTag;

/// A publishing connection.
///
/// [`crate::client::RtmpSession`] is the RTMP implementation; tests use
/// scripted fakes. No method retries on its own: retry policy belongs to
/// the caller.
#[async_trait]
pub trait Transport: Send {
    /// Open the connection and get to the point where media is accepted
    async fn connect(&mut self, url: &RtmpUrl) -> Result<()>;

    /// Send stream metadata (`@setDataFrame onMetaData`)
    async fn send_metadata(&mut self, metadata: &AmfValue) -> Result<()>;

    /// Send one muxed tag
    async fn send(&mut self, tag: &FlvTag) -> Result<()>;

    /// Unpublish and tear down. Safe to call in any state, idempotent.
    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}
