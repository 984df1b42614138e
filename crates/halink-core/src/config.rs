// ── Runtime session configuration ──
//
// Describes *how* to reach the backend and how the session behaves once
// connected. Carries the credential but never touches disk: the CLI (or
// any embedding program) builds a `SessionConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use halink_api::UpstreamConfig;

use crate::error::CoreError;
use crate::reconnect::ReconnectPolicy;

/// Configuration for one session against one backend.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: Url,
    /// Long-lived access token.
    pub token: SecretString,
    /// Default deadline for `call` and for waiting on a first subscribe.
    pub request_timeout: Duration,
    /// Bound on opening the socket.
    pub connect_timeout: Duration,
    /// Bound on the `auth` → `auth_ok` exchange.
    pub auth_timeout: Duration,
    /// Backoff and re-arm behavior after a lost connection.
    pub reconnect: ReconnectPolicy,
    /// Events buffered per consumer before the oldest is dropped.
    pub consumer_depth: usize,
    /// Send a `ping` this often to detect half-open sockets. `None` = off.
    pub heartbeat_interval: Option<Duration>,
}

impl SessionConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            consumer_depth: 256,
            heartbeat_interval: None,
        }
    }

    /// Reject configurations the session cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self.url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(CoreError::Config {
                    message: format!("URL scheme must be ws or wss, got '{other}'"),
                });
            }
        }
        if self.consumer_depth == 0 {
            return Err(CoreError::Config {
                message: "consumer_depth must be at least 1".into(),
            });
        }
        let timeouts = [
            ("request_timeout", self.request_timeout),
            ("connect_timeout", self.connect_timeout),
            ("auth_timeout", self.auth_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(CoreError::Config {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }
        if self.heartbeat_interval.is_some_and(|d| d.is_zero()) {
            return Err(CoreError::Config {
                message: "heartbeat_interval must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// The slice of this config the wire layer needs.
    pub fn upstream(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.url.clone(),
            token: self.token.clone(),
            connect_timeout: self.connect_timeout,
            auth_timeout: self.auth_timeout,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(url: &str) -> SessionConfig {
        SessionConfig::new(
            Url::parse(url).unwrap(),
            SecretString::from("token".to_string()),
        )
    }

    #[test]
    fn defaults() {
        let cfg = config("ws://ha.local:8123/api/websocket");
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
        assert_eq!(cfg.consumer_depth, 256);
        assert!(cfg.heartbeat_interval.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_http_scheme() {
        let err = config("http://ha.local:8123").validate().unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn rejects_zero_depth_and_timeouts() {
        let mut cfg = config("wss://ha.example.com/api/websocket");
        cfg.consumer_depth = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config("wss://ha.example.com/api/websocket");
        cfg.request_timeout = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout"));
    }
}
