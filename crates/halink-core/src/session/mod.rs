// ── Session handle ──
//
// The public face of one upstream connection: correlated calls, filtered
// event subscriptions, state observation and shutdown. The handle is
// cheap to clone; all work happens in the session actor.

mod actor;
pub(crate) mod command;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use halink_api::connection::millis;
use halink_api::{ConnectionState, HandshakeInfo, Request, UpstreamConnection};

use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::fanout::{ConsumerId, ConsumerInfo, Registration};
use crate::filter::EventFilter;
use crate::mailbox::Mailbox;
use crate::reconnect::ReconnectPhase;
use crate::registry::SubscriptionInfo;
use crate::stream::{EventStream, UnsubscribeHandle};

use self::actor::SessionActor;
use self::command::Command;

/// Point-in-time view of a session's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub phase: ReconnectPhase,
    /// Requests on the wire awaiting a response.
    pub pending_requests: usize,
    /// Calls held back while the upstream is down.
    pub queued_calls: usize,
    pub subscriptions: Vec<SubscriptionInfo>,
    pub consumers: Vec<ConsumerInfo>,
}

// ── Session ──────────────────────────────────────────────────────────

/// One authenticated upstream connection shared by any number of
/// callers and event consumers.
///
/// Cheaply cloneable via `Arc<SessionInner>`.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    /// Set once if reconnection gives up.
    fatal: Arc<OnceLock<CoreError>>,
    request_timeout: Duration,
    consumer_depth: usize,
    handshake: HandshakeInfo,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect, authenticate and start the session actor.
    ///
    /// The first connection attempt is made here, not in the background:
    /// a refused credential or unreachable backend is returned to the
    /// caller and nothing keeps running.
    pub async fn connect(config: SessionConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let mut connection = UpstreamConnection::new(config.upstream());
        let handshake = connection.connect().await?;
        let state = connection.watch_state();

        let (commands, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let fatal = Arc::new(OnceLock::new());

        let actor = SessionActor::new(
            connection,
            receiver,
            cancel.clone(),
            Arc::clone(&fatal),
            &config,
        );
        let task = tokio::spawn(actor.run());
        info!(url = %config.url, "session started");

        Ok(Self {
            inner: Arc::new(SessionInner {
                commands,
                state,
                cancel,
                fatal,
                request_timeout: config.request_timeout,
                consumer_depth: config.consumer_depth,
                handshake,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// What the backend reported during the first handshake.
    pub fn handshake(&self) -> &HandshakeInfo {
        &self.inner.handshake
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Send a request and wait for its result, bounded by the session's
    /// `request_timeout`.
    pub async fn call(&self, request: Request) -> Result<Value, CoreError> {
        self.call_with_timeout(request, self.inner.request_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for its result.
    ///
    /// Dropping the returned future abandons the call; a response that
    /// arrives later is discarded.
    pub async fn call_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        self.ensure_usable()?;
        if timeout.is_zero() {
            return Err(CoreError::InvalidRequest {
                message: "timeout must be greater than zero".into(),
            });
        }

        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            request,
            timeout,
            reply,
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(CoreError::Timeout {
                timeout_ms: millis(timeout),
            }),
        }
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Start receiving events that match `filter`.
    ///
    /// The first consumer of a category waits for the upstream subscribe
    /// to be acknowledged (bounded by `request_timeout`); later consumers
    /// attach immediately.
    pub async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, CoreError> {
        self.ensure_usable()?;

        let id = ConsumerId::new();
        let category = filter.category().clone();
        let mailbox = Arc::new(Mailbox::new(self.inner.consumer_depth));
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            registration: Registration {
                id,
                filter,
                mailbox: Arc::clone(&mailbox),
                reply,
            },
        })?;

        // From here on, dropping `stream` releases whatever was taken.
        let stream = EventStream::new(
            UnsubscribeHandle::new(id, mailbox, self.inner.commands.clone()),
            category,
        );

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(consumer = %id, category = %stream.category(), "subscribed");
                Ok(stream)
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(CoreError::Subscription {
                category: stream.category().to_string(),
                message: format!(
                    "not acknowledged within {}ms",
                    millis(self.inner.request_timeout)
                ),
            }),
        }
    }

    // ── Introspection / lifecycle ────────────────────────────────

    pub async fn stats(&self) -> Result<SessionStats, CoreError> {
        self.ensure_usable()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(CoreError::Timeout {
                timeout_ms: millis(self.inner.request_timeout),
            }),
        }
    }

    /// Stop the session: pending calls fail with `ConnectionClosed`,
    /// event streams end, the socket is closed. Idempotent.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "session task ended abnormally");
            }
        }
    }

    /// Whether the session can still serve requests.
    pub fn is_usable(&self) -> bool {
        self.ensure_usable().is_ok()
    }

    fn ensure_usable(&self) -> Result<(), CoreError> {
        if let Some(err) = self.inner.fatal.get() {
            return Err(err.clone());
        }
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::ConnectionClosed);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), CoreError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> CoreError {
        self.inner
            .fatal
            .get()
            .cloned()
            .unwrap_or(CoreError::ConnectionClosed)
    }
}
