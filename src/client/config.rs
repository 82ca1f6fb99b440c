//! Client configuration and RTMP URL parsing

use std::fmt;
use std::time::Duration;

use crate::error::{ConnectionError, Result};
use crate::protocol::constants::*;

/// Publisher connection options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP connect + handshake + publish must finish within this time
    pub connect_timeout: Duration,

    /// A single tag write must be accepted by the socket within this time
    pub write_timeout: Duration,

    /// Chunk size we announce and send with
    pub chunk_size: u32,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// `flashVer` in the connect command
    pub flash_ver: String,

    /// Window acknowledgement size we announce to the server
    pub window_ack_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            tcp_nodelay: true,
            flash_ver: DEFAULT_FLASH_VER.to_string(),
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set chunk size (capped at the protocol maximum)
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn flash_ver(mut self, flash_ver: impl Into<String>) -> Self {
        self.flash_ver = flash_ver.into();
        self
    }

    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size;
        self
    }
}

/// Parsed `rtmp://host[:port]/app[/instance]/stream_key[?query]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    /// Application path, may contain an instance (`live/inst`)
    pub app: String,
    /// Stream key, including any query string
    pub stream_key: String,
}

impl RtmpUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || ConnectionError::InvalidUrl(url.to_string());

        let url = url.trim();
        let rest = url
            .strip_prefix("rtmp://")
            .or_else(|| url.strip_prefix("RTMP://"))
            .ok_or_else(invalid)?;

        let (authority, path) = rest.split_once('/').ok_or_else(invalid)?;
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (h, after) = v6.split_once(']').ok_or_else(invalid)?;
            match after.strip_prefix(':') {
                Some(p) => (h, parse_port(p)?),
                None if after.is_empty() => (h, DEFAULT_PORT),
                None => return Err(invalid().into()),
            }
        } else {
            match authority.split_once(':') {
                Some((h, p)) => (h, parse_port(p)?),
                None => (authority, DEFAULT_PORT),
            }
        };
        if host.is_empty() || port == 0 {
            return Err(invalid().into());
        }

        // The query string belongs to the stream key
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let path = path.trim_end_matches('/');
        let (app, key) = path.rsplit_once('/').ok_or_else(invalid)?;
        if app.is_empty() || key.is_empty() {
            return Err(invalid().into());
        }

        let stream_key = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", key, q),
            _ => key.to_string(),
        };

        Ok(RtmpUrl {
            host: host.to_string(),
            port,
            app: app.to_string(),
            stream_key,
        })
    }

    /// `host:port` for the TCP connect
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `tcUrl` for the connect command
    pub fn tc_url(&self) -> String {
        format!("rtmp://{}/{}", self.address(), self.app)
    }
}

impl fmt::Display for RtmpUrl {
    /// Stream key is left out so it never ends up in logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/***", self.tc_url())
    }
}
