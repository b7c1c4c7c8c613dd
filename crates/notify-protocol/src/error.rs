//! Channel error type.
//!
//! None of these reach the callers of `connect`/`disconnect`; the channel
//! logs them and carries on. They exist so the helpers that can fail return
//! a real `Result`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The credential was empty once the `Bearer ` prefix was removed.
    #[error("bearer token is empty")]
    EmptyToken,

    /// The configured endpoint cannot carry a WebSocket connection.
    /// `endpoint` never contains the token.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("failed to parse push message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The channel task is gone (the handle outlived the runtime).
    #[error("notification channel has stopped")]
    Stopped,
}

impl ChannelError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn invalid_endpoint(endpoint: &str, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: strip_query(endpoint).to_string(),
            reason: reason.into(),
        }
    }
}

/// Drop the query string so a token never ends up in an error message.
fn strip_query(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}
