//! Channel configuration.

use std::time::Duration;

/// Backend push endpoint used when nothing else is configured.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:9000/ws";

/// Automatic retries allowed after unclean closes before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay between an unclean close and the retry it schedules.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// How long an open may take before it counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Notification channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket base endpoint; `token=<...>` is appended as a query parameter
    pub endpoint: String,
    /// Retry ceiling; reset whenever a connection opens
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each retry
    pub reconnect_delay: Duration,
    /// Open timeout applied by `WsConnector`
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}
