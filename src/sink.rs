//! The boundary between encoding and transport
//!
//! The recorder only ever talks to a [`SampleSink`]. The streaming sender
//! is one; tests substitute a recording sink.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::media::EncodedSample;

/// Receives encoded samples from a producer.
///
/// `accept` is called from the producer's thread and must not block on
/// network I/O.
pub trait SampleSink: Send + Sync {
    /// Take ownership of one sample
    fn accept(&self, sample: EncodedSample);

    /// The producer hit a mid-stream error and stopped
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

impl<T: SampleSink + ?Sized> SampleSink for Arc<T> {
    fn accept(&self, sample: EncodedSample) {
        (**self).accept(sample)
    }

    fn on_error(&self, error: &Error) {
        (**self).on_error(error)
    }
}

/// Sink that keeps everything it receives. Useful in tests and for
/// offline inspection.
#[derive(Debug, Default)]
pub struct CollectingSink {
    samples: Mutex<Vec<EncodedSample>>,
    errors: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<EncodedSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl SampleSink for CollectingSink {
    fn accept(&self, sample: EncodedSample) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample);
        }
    }

    fn on_error(&self, error: &Error) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error.to_string());
        }
    }
}
