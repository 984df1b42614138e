// ── Core error types ──
//
// Session-level errors from halink-core. Callers never see socket or
// frame-decoding failures directly: the `From<halink_api::Error>` impl
// folds wire errors into the variants below. Errors are `Clone` because a
// single failure (a lost connection, a rejected subscribe) is delivered to
// every caller waiting on it.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to upstream: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Not connected to upstream")]
    NotConnected,

    /// The socket went away while the request was outstanding, or the
    /// session was closed.
    #[error("Upstream connection closed")]
    ConnectionClosed,

    /// Reconnection gave up. The session is unusable from here on.
    #[error("Upstream connection lost: {reason}")]
    ConnectionLost { reason: String },

    // ── Request errors ───────────────────────────────────────────────
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The backend answered with `success: false`.
    #[error("Upstream error ({code}): {message}")]
    Upstream { code: String, message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // ── Subscription errors ──────────────────────────────────────────
    #[error("Subscription to '{category}' failed: {message}")]
    Subscription { category: String, message: String },

    #[error("Invalid filter '{expression}': {reason}")]
    InvalidFilter { expression: String, reason: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the session can no longer serve requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::AuthenticationFailed { .. }
        )
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<halink_api::Error> for CoreError {
    fn from(err: halink_api::Error) -> Self {
        match err {
            halink_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            halink_api::Error::WebSocketConnect(_)
            | halink_api::Error::WebSocketClosed { .. }
            | halink_api::Error::Timeout { .. } => CoreError::ConnectionFailed {
                reason: err.to_string(),
            },
            halink_api::Error::NotConnected => CoreError::NotConnected,
            halink_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            halink_api::Error::InvalidRequest { message } => {
                CoreError::InvalidRequest { message }
            }
            halink_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            halink_api::Error::Encode(e) => CoreError::Internal(format!("Encoding error: {e}")),
        }
    }
}
