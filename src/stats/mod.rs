//! Statistics for the streaming sender

pub mod metrics;

pub use metrics::{SenderMetrics, SessionStats};
