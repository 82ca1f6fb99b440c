//! Media handling
//!
//! This module provides:
//! - The `EncodedSample` data model handed from encoders to the sender
//! - FLV tag model and serialization
//! - H.264 (Annex B to AVCC, decoder configuration record) framing
//! - AAC (AudioSpecificConfig, ADTS stripping) framing
//! - `FlvMuxer`, which turns samples into FLV tags

pub mod aac;
pub mod flv;
pub mod h264;
pub mod muxer;
pub mod sample;

pub use aac::AudioSpecificConfig;
pub use flv::{FlvTag, FlvTagType};
pub use h264::AvcConfig;
pub use muxer::FlvMuxer;
pub use sample::{EncodedSample, SampleFlags, SampleKind, Track};
