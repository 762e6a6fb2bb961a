//! Client configuration.

use std::time::Duration;

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "wss://compiler.skillshikshya.com/ws/compiler/";

/// Default time allowed for the connection to open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runner client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket endpoint of the execution backend.
    pub endpoint: String,
    /// How long [`wait_open`](crate::RunnerClient::wait_open) waits.
    pub connect_timeout: Duration,
    /// Optional watchdog: longest silence tolerated while waiting for a run.
    ///
    /// Silence never fails the session by itself; the caller decides what to
    /// do when the watchdog fires.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Configuration for `endpoint` with default timeouts.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("ws://localhost:3000/ws")
            .with_connect_timeout(Duration::from_secs(1))
            .with_idle_timeout(Some(Duration::from_secs(30)));
        assert_eq!(config.endpoint, "ws://localhost:3000/ws");
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }
}
