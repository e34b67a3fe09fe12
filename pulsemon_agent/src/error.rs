//! Error taxonomy for the delivery pipeline.

use thiserror::Error;

use crate::retry;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Non-HTTPS endpoint that is not an allowed loopback address. Raised
    /// before any network I/O.
    #[error("server URL must use https (got {0})")]
    InsecureTransport(String),

    #[error("invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Non-2xx response, surfaced immediately for fatal statuses or after the
    /// retry budget for retryable ones.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    /// Transport-level failure surfaced after the retry budget (or
    /// immediately when not retryable).
    #[error("transport error: {0}")]
    Transport(String),

    /// Request encoding or 2xx response decoding failed. The attempt counts
    /// as failed even when the transport succeeded.
    #[error("encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// True when another cycle could plausibly succeed without operator
    /// intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http { status, .. } => retry::is_retryable_status(*status),
            ClientError::Transport(_) => true,
            _ => false,
        }
    }
}
