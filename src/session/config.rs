//! Session configuration.

use std::time::Duration;

use crate::core::constants::{
    DEFAULT_BACKOFF_BASE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_QUERY_TIMEOUT, KEEPALIVE_INTERVAL,
};
use crate::transport::ClientMode;

/// Tunable parameters for a [`Client`](super::Client).
///
/// Construct with [`SessionConfig::builder`]; the defaults match the
/// production endpoints.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server endpoint URL, `wss` scheme.
    pub endpoint_url: String,
    /// Which client surface to present.
    pub mode: ClientMode,
    /// Budget for transport connect plus handshake.
    pub connect_timeout: Duration,
    /// Default budget for a request/response exchange.
    pub query_timeout: Duration,
    /// Interval between keep-alive pings while connected.
    pub keepalive_interval: Duration,
    /// Initial rate-limit backoff; doubles per consecutive hit.
    pub backoff_base: Duration,
}

impl SessionConfig {
    /// Start building a config for the given endpoint URL.
    pub fn builder(endpoint_url: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig {
                endpoint_url: endpoint_url.into(),
                mode: ClientMode::default(),
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                query_timeout: DEFAULT_QUERY_TIMEOUT,
                keepalive_interval: KEEPALIVE_INTERVAL,
                backoff_base: DEFAULT_BACKOFF_BASE,
            },
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the client access mode.
    pub fn mode(mut self, mode: ClientMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the connect-plus-handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the default request/response timeout.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.query_timeout = timeout;
        self
    }

    /// Set the keep-alive ping interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the initial rate-limit backoff.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.config.backoff_base = base;
        self
    }

    /// Finish building.
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = SessionConfig::builder("wss://gateway.example.net/ws").build();
        assert_eq!(config.mode, ClientMode::Standard);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.query_timeout, DEFAULT_QUERY_TIMEOUT);
        assert_eq!(config.keepalive_interval, KEEPALIVE_INTERVAL);
    }

    #[test]
    fn test_builder_overrides() {
        let config = SessionConfig::builder("wss://gateway.example.net/ws")
            .connect_timeout(Duration::from_secs(5))
            .query_timeout(Duration::from_secs(10))
            .keepalive_interval(Duration::from_secs(7))
            .backoff_base(Duration::from_millis(250))
            .build();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.query_timeout, Duration::from_secs(10));
        assert_eq!(config.keepalive_interval, Duration::from_secs(7));
        assert_eq!(config.backoff_base, Duration::from_millis(250));
    }
}
