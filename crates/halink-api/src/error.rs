use thiserror::Error;

/// Top-level error type for the `halink-api` crate.
///
/// Covers every failure mode of the wire layer: handshake, socket,
/// framing and request encoding. `halink-core` maps these into
/// session-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The backend answered the handshake with `auth_invalid`.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket connection failed or broke mid-session.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the peer (or the stream simply ended).
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// A bounded stage of the connection lifecycle ran out of time.
    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    /// No authenticated socket is available.
    #[error("Not connected to upstream")]
    NotConnected,

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Data ────────────────────────────────────────────────────────
    /// Inbound message could not be decoded, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// Request payload rejected before it reached the wire.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Outbound message could not be serialized.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl Error {
    /// Returns `true` if the backend rejected our credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth reconnecting for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_)
                | Self::WebSocketClosed { .. }
                | Self::Timeout { .. }
                | Self::NotConnected
        )
    }
}
