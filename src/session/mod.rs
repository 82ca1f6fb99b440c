//! Session bookkeeping for an outgoing RTMP connection

pub mod state;

pub use state::{SessionPhase, SessionState};
