// ── Request correlator ──
//
// Owns the table of in-flight requests for the current socket. Every
// request gets a fresh id and a deadline; the matching response, the
// deadline, or a connection loss settles it, whichever comes first, and
// only once. Lives inside the session actor, so there is no locking.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};

use halink_api::Category;
use halink_api::connection::millis;

use crate::error::CoreError;

/// Reply slot handed back to a `call` caller.
pub(crate) type CallReply = oneshot::Sender<Result<Value, CoreError>>;

/// Work the session itself is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Task {
    /// `subscribe_events` for a category (first consumer or re-arm).
    Subscribe(Category),
    /// Best-effort `unsubscribe_events` for an upstream subscription.
    Unsubscribe(u64),
    /// Liveness `ping`.
    Heartbeat,
}

/// Who is waiting for a request to settle.
#[derive(Debug)]
pub(crate) enum Completion {
    Caller(CallReply),
    Internal(Task),
}

struct PendingRequest {
    submitted_at: Instant,
    timeout: Duration,
    deadline: delay_queue::Key,
    completion: Completion,
}

/// Result of settling one id.
#[derive(Debug)]
pub(crate) enum Settled {
    /// A caller's slot was fulfilled, or the caller had already gone away.
    Caller,
    /// An internal continuation the session must act on.
    Internal {
        id: u64,
        task: Task,
        outcome: Result<Value, CoreError>,
    },
    /// No such request: already retired, or never issued on this socket.
    Unknown,
}

/// Pending-request table with deadline tracking.
pub(crate) struct Correlator {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    deadlines: DelayQueue<u64>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            deadlines: DelayQueue::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Allocate an id and arm its deadline. The caller must put the
    /// request on the wire under that id.
    pub(crate) fn register(&mut self, completion: Completion, timeout: Duration) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = self.deadlines.insert(id, timeout);
        self.pending.insert(
            id,
            PendingRequest {
                submitted_at: Instant::now(),
                timeout,
                deadline,
                completion,
            },
        );
        id
    }

    /// Settle `id` with the backend's answer.
    pub(crate) fn resolve(&mut self, id: u64, outcome: Result<Value, CoreError>) -> Settled {
        let Some(pending) = self.pending.remove(&id) else {
            tracing::debug!(id, "discarding response for unknown or retired request");
            return Settled::Unknown;
        };
        self.deadlines.try_remove(&pending.deadline);
        tracing::trace!(
            id,
            elapsed_ms = millis(pending.submitted_at.elapsed()),
            ok = outcome.is_ok(),
            "request settled"
        );
        settle(id, pending.completion, outcome)
    }

    /// Wait for the next deadline to pass and return its id.
    ///
    /// Cancel-safe. Never completes while nothing is pending.
    pub(crate) async fn next_expired(&mut self) -> u64 {
        match poll_fn(|cx| self.deadlines.poll_expired(cx)).await {
            Some(expired) => expired.into_inner(),
            None => std::future::pending().await,
        }
    }

    /// Settle an expired id with `Timeout`.
    pub(crate) fn expire(&mut self, id: u64) -> Settled {
        let Some(pending) = self.pending.remove(&id) else {
            return Settled::Unknown;
        };
        let timeout_ms = millis(pending.timeout);
        tracing::debug!(id, timeout_ms, "request timed out");
        settle(id, pending.completion, Err(CoreError::Timeout { timeout_ms }))
    }

    /// Settle everything with `err` in one pass and restart ids for the
    /// next socket.
    pub(crate) fn fail_all(&mut self, err: &CoreError) -> Vec<Settled> {
        let count = self.pending.len();
        if count > 0 {
            tracing::debug!(count, error = %err, "failing all pending requests");
        }
        self.deadlines.clear();
        self.next_id = 1;
        self.pending
            .drain()
            .map(|(id, pending)| settle(id, pending.completion, Err(err.clone())))
            .collect()
    }
}

fn settle(id: u64, completion: Completion, outcome: Result<Value, CoreError>) -> Settled {
    match completion {
        Completion::Caller(reply) => {
            if reply.send(outcome).is_err() {
                tracing::debug!(id, "caller went away, result discarded");
            }
            Settled::Caller
        }
        Completion::Internal(task) => Settled::Internal { id, task, outcome },
    }
}

// ── Tests ────────────────────────────────────────────────────────────
