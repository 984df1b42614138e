// ── Downstream fan-out manager ──
//
// Owns the consumer table. Consumers whose category is still being
// subscribed wait in `waiting` until the registry reports the outcome;
// live consumers receive every matching event in their own mailbox.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use halink_api::{Category, EventEnvelope};

use crate::error::CoreError;
use crate::filter::EventFilter;
use crate::mailbox::Mailbox;

/// Opaque identity of one downstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-consumer view for stats.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub filter: String,
    pub buffered: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// A consumer on its way in. `reply` settles the caller's `subscribe`.
pub(crate) struct Registration {
    pub(crate) id: ConsumerId,
    pub(crate) filter: EventFilter,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) reply: oneshot::Sender<Result<(), CoreError>>,
}

impl Registration {
    pub(crate) fn category(&self) -> &Category {
        self.filter.category()
    }

    pub(crate) fn fail(self, err: CoreError) {
        self.mailbox.close();
        // The caller may have given up already.
        let _ = self.reply.send(Err(err));
    }
}

struct Consumer {
    filter: EventFilter,
    mailbox: Arc<Mailbox>,
}

/// Consumer table and dispatcher.
#[derive(Default)]
pub(crate) struct FanoutManager {
    consumers: HashMap<ConsumerId, Consumer>,
    waiting: HashMap<Category, Vec<Registration>>,
}

impl FanoutManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.consumers.len()
    }

    /// Attach a consumer whose category is live. Returns `false` if the
    /// caller already gave up; the reference it took must be released.
    pub(crate) fn add_live(&mut self, registration: Registration) -> bool {
        let Registration {
            id,
            filter,
            mailbox,
            reply,
        } = registration;
        if mailbox.is_closed() || reply.send(Ok(())).is_err() {
            mailbox.close();
            tracing::debug!(consumer = %id, "subscriber went away before attaching");
            return false;
        }
        tracing::debug!(consumer = %id, filter = %filter, "consumer attached");
        self.consumers.insert(id, Consumer { filter, mailbox });
        true
    }

    /// Hold a consumer until its category's first subscribe settles.
    pub(crate) fn park(&mut self, registration: Registration) {
        self.waiting
            .entry(registration.category().clone())
            .or_default()
            .push(registration);
    }

    /// The category is live: attach everyone waiting on it. Returns how
    /// many had gone away in the meantime.
    pub(crate) fn activate(&mut self, category: &Category) -> usize {
        let parked = self.waiting.remove(category).unwrap_or_default();
        parked
            .into_iter()
            .map(|registration| self.add_live(registration))
            .filter(|attached| !attached)
            .count()
    }

    /// The category's first subscribe failed: fail everyone waiting on it.
    pub(crate) fn reject(&mut self, category: &Category, err: &CoreError) -> usize {
        let parked = self.waiting.remove(category).unwrap_or_default();
        let count = parked.len();
        for registration in parked {
            registration.fail(err.clone());
        }
        count
    }

    /// Detach a consumer, live or waiting. Returns its category so the
    /// caller can release the reference.
    pub(crate) fn remove(&mut self, id: ConsumerId) -> Option<Category> {
        if let Some(consumer) = self.consumers.remove(&id) {
            consumer.mailbox.close();
            tracing::debug!(consumer = %id, "consumer detached");
            return Some(consumer.filter.category().clone());
        }

        let mut found = None;
        for (category, parked) in &mut self.waiting {
            if let Some(pos) = parked.iter().position(|r| r.id == id) {
                found = Some((category.clone(), parked.swap_remove(pos)));
                break;
            }
        }
        let (category, registration) = found?;
        if self.waiting.get(&category).is_some_and(Vec::is_empty) {
            self.waiting.remove(&category);
        }
        registration.fail(CoreError::ConnectionClosed);
        Some(category)
    }

    /// Deliver one event to every matching live consumer.
    ///
    /// `routed` is the category of the upstream subscription that produced
    /// the event, when the backend tagged it. Untagged events go to every
    /// consumer whose category covers their type.
    pub(crate) fn dispatch(&self, event: &Arc<EventEnvelope>, routed: Option<&Category>) -> usize {
        let mut delivered = 0;
        for consumer in self.consumers.values() {
            let category = consumer.filter.category();
            let wanted = match routed {
                Some(routed) => category == routed,
                None => category.covers(&event.header.event_type),
            };
            if wanted
                && consumer.filter.matches(&event.header)
                && consumer.mailbox.push(Arc::clone(event))
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// End every stream and fail every waiting registration.
    pub(crate) fn close_all(&mut self, err: &CoreError) {
        for consumer in self.consumers.values() {
            consumer.mailbox.close();
        }
        self.consumers.clear();
        let waiting: Vec<Category> = self.waiting.keys().cloned().collect();
        for category in waiting {
            self.reject(&category, err);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<ConsumerInfo> {
        let mut infos: Vec<ConsumerInfo> = self
            .consumers
            .iter()
            .map(|(id, consumer)| ConsumerInfo {
                id: *id,
                filter: consumer.filter.to_string(),
                buffered: consumer.mailbox.len(),
                delivered: consumer.mailbox.delivered(),
                dropped: consumer.mailbox.dropped(),
            })
            .collect();
        infos.sort_by(|a, b| a.filter.cmp(&b.filter).then(a.id.0.cmp(&b.id.0)));
        infos
    }
}

// ── Tests ────────────────────────────────────────────────────────────
