// ── Downstream event streams ──
//
// What a consumer holds after `Session::subscribe`. Events arrive in the
// consumer's own bounded mailbox; unsubscribing closes the mailbox on the
// spot and tells the session to release the category.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_core::Stream;
use tokio::sync::mpsc;

use halink_api::{Category, EventEnvelope};

use crate::fanout::ConsumerId;
use crate::mailbox::Mailbox;
use crate::session::command::Command;

/// Cloneable way to end a consumer's subscription from anywhere,
/// e.g. from a task watching for the downstream client to disconnect.
#[derive(Clone)]
pub struct UnsubscribeHandle {
    id: ConsumerId,
    mailbox: Arc<Mailbox>,
    commands: mpsc::UnboundedSender<Command>,
    done: Arc<AtomicBool>,
}

impl UnsubscribeHandle {
    pub(crate) fn new(
        id: ConsumerId,
        mailbox: Arc<Mailbox>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            mailbox,
            commands,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop delivery. No event is delivered once this returns; the
    /// upstream subscription is released in the background. Idempotent.
    pub fn unsubscribe(&self) {
        self.mailbox.close();
        if !self.done.swap(true, Ordering::AcqRel) {
            // The session may already be gone; nothing left to release then.
            let _ = self.commands.send(Command::Unsubscribe { consumer: self.id });
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// A consumer's live feed of matching events.
///
/// Ends (`recv` returns `None`) on unsubscribe, on session close, or when
/// the session gives up reconnecting. Dropping it unsubscribes.
pub struct EventStream {
    handle: UnsubscribeHandle,
    category: Category,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.handle.id)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    pub(crate) fn new(handle: UnsubscribeHandle, category: Category) -> Self {
        Self { handle, category }
    }

    pub fn id(&self) -> ConsumerId {
        self.handle.id
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.handle.mailbox.recv().await
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.handle.mailbox.try_recv()
    }

    /// Events evicted because this consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.handle.mailbox.dropped()
    }

    /// Events handed out so far.
    pub fn delivered(&self) -> u64 {
        self.handle.mailbox.delivered()
    }

    pub fn unsubscribe_handle(&self) -> UnsubscribeHandle {
        self.handle.clone()
    }

    /// End the subscription now.
    pub fn unsubscribe(self) {
        self.handle.unsubscribe();
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> impl Stream<Item = Arc<EventEnvelope>> + Send + 'static {
        futures_util::stream::unfold(self, |mut stream| async move {
            let event = stream.recv().await?;
            Some((event, stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}
