//! The ping uploader collaborator.
//!
//! Submission never blocks on network delivery succeeding; the events
//! database only needs to hand a fully-assembled ping off to something that
//! implements [`Uploader`] (§2.1, §6). The concrete HTTP client is out of
//! scope; [`RecordingUploader`] below exists for tests.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Result;

/// A single assembled ping, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PingRequest {
    pub ping_name: String,
    pub reason: String,
    pub events: Vec<Value>,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn submit(&self, request: PingRequest) -> Result<()>;
}

/// An [`Uploader`] that keeps every submitted request in memory, in order.
/// Used by tests to assert on what would have been sent.
#[derive(Default)]
pub struct RecordingUploader {
    requests: std::sync::Mutex<Vec<PingRequest>>,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<PingRequest> {
        self.requests
            .lock()
            .expect("recording uploader mutex poisoned")
            .clone()
    }

    pub fn count(&self) -> usize {
        self.requests
            .lock()
            .expect("recording uploader mutex poisoned")
            .len()
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn submit(&self, request: PingRequest) -> Result<()> {
        log::debug!(
            "submitting ping {} ({}, reason={})",
            request.ping_name,
            request.events.len(),
            request.reason
        );
        self.requests
            .lock()
            .expect("recording uploader mutex poisoned")
            .push(request);
        Ok(())
    }
}
