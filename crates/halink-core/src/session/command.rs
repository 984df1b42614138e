// ── Session commands ──
//
// Everything a `Session` handle (or an `EventStream`) asks of the actor
// travels as a `Command` over one unbounded channel. Replies come back on
// a oneshot carried inside the command.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use halink_api::Request;

use crate::correlator::CallReply;
use crate::error::CoreError;
use crate::fanout::{ConsumerId, Registration};

use super::SessionStats;

pub(crate) enum Command {
    /// Send a request and settle `reply` with its outcome.
    Call {
        request: Request,
        timeout: Duration,
        reply: CallReply,
    },
    /// Attach a new consumer.
    Subscribe { registration: Registration },
    /// Detach a consumer. Its mailbox is already closed.
    Unsubscribe { consumer: ConsumerId },
    /// Snapshot the session's bookkeeping.
    Stats { reply: oneshot::Sender<SessionStats> },
}

impl Command {
    /// Answer a command the actor will never run.
    pub(crate) fn refuse(self, err: &CoreError) {
        match self {
            Self::Call { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Self::Subscribe { registration } => registration.fail(err.clone()),
            Self::Unsubscribe { .. } | Self::Stats { .. } => {}
        }
    }
}

/// A call issued while no socket is available.
pub(crate) struct QueuedCall {
    pub(crate) request: Request,
    pub(crate) timeout: Duration,
    pub(crate) deadline: Instant,
    pub(crate) reply: CallReply,
}
