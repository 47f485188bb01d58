//! Upstream HTTP: the call envelope and its retry helper

mod envelope;
mod retry;

pub use envelope::{AuthStrategy, CallOptions, HttpEnvelope};
pub use retry::{with_retry, Idempotency, RetryPolicy};

use crate::config::HttpConfig;
use crate::error::HostError;
use std::time::Duration;

/// Shared client for every envelope of a host
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client, HostError> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .connect_timeout(Duration::from_secs(10))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| HostError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}
