//! The single upstream socket.
//!
//! [`UpstreamConnection`] owns the WebSocket to the backend and the
//! authoritative [`ConnectionState`]. Nothing else writes that state: other
//! components observe it through the `watch` receiver handed out by
//! [`UpstreamConnection::watch_state`].
//!
//! The handshake is `auth` → `auth_ok | auth_invalid`, bounded by
//! `auth_timeout`. Inbound frames are decoded by the codec; malformed
//! messages are logged and dropped without touching the connection.

use std::fmt;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::codec::{self, Inbound, Request};
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

// ── ConnectionState ──────────────────────────────────────────────────

/// Lifecycle of the upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting { attempt: u32 },
    Closing,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closing => f.write_str("closing"),
        }
    }
}

// ── Config ───────────────────────────────────────────────────────────

/// Where and how to reach the backend.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket endpoint, e.g. `ws://homeassistant.local:8123/api/websocket`.
    pub url: Url,
    /// Long-lived access token.
    pub token: SecretString,
    /// Bound on TCP + TLS + upgrade.
    pub connect_timeout: Duration,
    /// Bound on waiting for `auth_ok` after sending the credential.
    pub auth_timeout: Duration,
}

/// What the backend told us during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub ha_version: Option<String>,
}

// ── UpstreamConnection ───────────────────────────────────────────────

struct Link {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

/// Owner of the upstream socket and its [`ConnectionState`].
pub struct UpstreamConnection {
    config: UpstreamConfig,
    state: watch::Sender<ConnectionState>,
    link: Option<Link>,
}

impl UpstreamConnection {
    pub fn new(config: UpstreamConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state,
            link: None,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether an authenticated socket is held.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open the socket and authenticate.
    ///
    /// Walks `Connecting → Authenticating → Connected`. On any failure the
    /// state falls back to `Disconnected` and the error is returned:
    /// [`Error::Authentication`] on `auth_invalid`, a connect or timeout
    /// error otherwise.
    pub async fn connect(&mut self) -> Result<HandshakeInfo, Error> {
        self.set_state(ConnectionState::Connecting);
        match self.establish(true).await {
            Ok(info) => {
                self.set_state(ConnectionState::Connected);
                tracing::info!(url = %self.config.url, ha_version = ?info.ha_version, "upstream connected");
                Ok(info)
            }
            Err(e) => {
                self.link = None;
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Re-open the socket after a loss.
    ///
    /// The state stays `Reconnecting { attempt }` even on success: the
    /// session flips it to `Connected` with [`mark_connected`] once its
    /// subscriptions are re-armed.
    ///
    /// [`mark_connected`]: Self::mark_connected
    pub async fn reconnect(&mut self, attempt: u32) -> Result<HandshakeInfo, Error> {
        self.set_state(ConnectionState::Reconnecting { attempt });
        let result = self.establish(false).await;
        if result.is_err() {
            self.link = None;
        }
        result
    }

    /// Announce that the session is fully usable again.
    pub fn mark_connected(&mut self) {
        if self.link.is_some() {
            self.set_state(ConnectionState::Connected);
        }
    }

    /// Drop a broken socket and report `Reconnecting`.
    pub fn mark_lost(&mut self, attempt: u32) {
        self.link = None;
        self.set_state(ConnectionState::Reconnecting { attempt });
    }

    /// Close the socket. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = link.sink.close().await {
                tracing::debug!(error = %e, "close handshake failed (non-fatal)");
            }
            tracing::info!("upstream connection closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    // ── I/O ──────────────────────────────────────────────────────

    /// Write one command envelope. Correlation happens elsewhere.
    pub async fn send(&mut self, id: u64, request: &Request) -> Result<(), Error> {
        let link = self.link.as_mut().ok_or(Error::NotConnected)?;
        let text = codec::encode_request(id, request)?;
        tracing::trace!(id, kind = request.kind(), "sending request");
        link.sink
            .send(Message::text(text))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }

    /// Wait for the next batch of decoded messages.
    ///
    /// Cancel-safe. Returns an error once the socket is gone; the link is
    /// dropped at that point.
    pub async fn recv(&mut self) -> Result<Vec<Inbound>, Error> {
        let Some(link) = self.link.as_mut() else {
            return Err(Error::NotConnected);
        };
        let result = read_batch(&mut link.stream).await;
        if result.is_err() {
            self.link = None;
        }
        result
    }

    // ── Internals ────────────────────────────────────────────────

    async fn establish(&mut self, report_progress: bool) -> Result<HandshakeInfo, Error> {
        self.link = None;
        let url = self.config.url.as_str().to_owned();
        tracing::debug!(url = %url, "opening upstream socket");

        let (ws, _response) =
            tokio::time::timeout(self.config.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| Error::Timeout {
                    stage: "connect",
                    timeout_ms: millis(self.config.connect_timeout),
                })?
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        if report_progress {
            self.set_state(ConnectionState::Authenticating);
        }

        let (mut sink, mut stream) = ws.split();
        let credential = codec::encode_auth(self.config.token.expose_secret())?;

        let info = tokio::time::timeout(
            self.config.auth_timeout,
            authenticate(&mut sink, &mut stream, credential),
        )
        .await
        .map_err(|_| Error::Timeout {
            stage: "authentication",
            timeout_ms: millis(self.config.auth_timeout),
        })??;

        self.link = Some(Link { sink, stream });
        Ok(info)
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "connection state");
            *current = next;
            true
        });
    }
}

/// Send the credential and wait for the verdict.
async fn authenticate(
    sink: &mut SplitSink<WsStream, Message>,
    stream: &mut SplitStream<WsStream>,
    credential: String,
) -> Result<HandshakeInfo, Error> {
    sink.send(Message::text(credential))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                for decoded in codec::decode_frame(text.as_str()) {
                    match decoded {
                        Ok(Inbound::AuthOk { ha_version }) => return Ok(HandshakeInfo { ha_version }),
                        Ok(Inbound::AuthInvalid { message }) => {
                            tracing::warn!(%message, "upstream rejected credentials");
                            return Err(Error::Authentication { message });
                        }
                        Ok(Inbound::AuthRequired { ha_version }) => {
                            tracing::trace!(?ha_version, "auth required");
                        }
                        Ok(other) => {
                            tracing::debug!(message = ?other, "ignoring message before auth verdict");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed handshake message");
                        }
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => return Err(closed_error(frame)),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
            None => {
                return Err(Error::WebSocketClosed {
                    code: ABNORMAL_CLOSURE,
                    reason: "stream ended during authentication".into(),
                });
            }
        }
    }
}

/// Read frames until at least one message decodes.
async fn read_batch(stream: &mut SplitStream<WsStream>) -> Result<Vec<Inbound>, Error> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let batch: Vec<Inbound> = codec::decode_frame(text.as_str())
                    .into_iter()
                    .filter_map(|decoded| match decoded {
                        Ok(message) => Some(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed upstream message");
                            None
                        }
                    })
                    .collect();
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            Some(Ok(Message::Close(frame))) => return Err(closed_error(frame)),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // tungstenite queues pong replies on its own
                tracing::trace!("upstream ping/pong");
            }
            Some(Ok(_)) => {
                tracing::debug!("ignoring non-text upstream frame");
            }
            Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
            None => {
                return Err(Error::WebSocketClosed {
                    code: ABNORMAL_CLOSURE,
                    reason: "stream ended".into(),
                });
            }
        }
    }
}

fn closed_error(frame: Option<CloseFrame>) -> Error {
    match frame {
        Some(cf) => {
            tracing::info!(code = %cf.code, reason = cf.reason.as_str(), "upstream close frame received");
            Error::WebSocketClosed {
                code: u16::from(cf.code),
                reason: cf.reason.as_str().to_owned(),
            }
        }
        None => Error::WebSocketClosed {
            code: ABNORMAL_CLOSURE,
            reason: "close frame without payload".into(),
        },
    }
}

/// Milliseconds in a duration, saturating.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
