//! RTMP client side
//!
//! - `ClientConfig`/`RtmpUrl`: connection options and URL parsing
//! - `Transport`: what the sender needs from a connection
//! - `RtmpSession`: the RTMP publisher implementing it

pub mod config;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, RtmpUrl};
pub use session::RtmpSession;
pub use transport::Transport;
