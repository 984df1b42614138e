// ── Per-consumer bounded mailbox ──
//
// The reader pushes, the consumer pulls. A full mailbox evicts its oldest
// event so the reader never waits on a slow consumer. The critical section
// is a handful of `VecDeque` operations under a std mutex, never held
// across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use halink_api::EventEnvelope;

struct Queue {
    events: VecDeque<Arc<EventEnvelope>>,
    closed: bool,
}

/// Bounded drop-oldest queue for one consumer.
pub(crate) struct Mailbox {
    capacity: usize,
    queue: Mutex<Queue>,
    notify: Notify,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Mailbox {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(Queue {
                events: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without waiting. Returns `false` if the mailbox is closed.
    pub(crate) fn push(&self, event: Arc<EventEnvelope>) -> bool {
        {
            let mut queue = self.lock();
            if queue.closed {
                return false;
            }
            if queue.events.len() >= self.capacity {
                queue.events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.events.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    /// Close and discard anything buffered. Nothing is delivered after
    /// this returns.
    pub(crate) fn close(&self) {
        {
            let mut queue = self.lock();
            queue.closed = true;
            queue.events.clear();
        }
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Take the next event if one is buffered.
    pub(crate) fn try_recv(&self) -> Option<Arc<EventEnvelope>> {
        let event = self.lock().events.pop_front();
        if event.is_some() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    /// Wait for the next event. `None` once closed.
    ///
    /// Single receiver: `notify_one` keeps a permit when nobody is
    /// waiting, so a push between the check and the wait is not lost.
    pub(crate) async fn recv(&self) -> Option<Arc<EventEnvelope>> {
        loop {
            {
                let mut queue = self.lock();
                if let Some(event) = queue.events.pop_front() {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use halink_api::{Category, EventHeader};

    use super::*;

    pub(crate) fn event(entity_id: &str) -> Arc<EventEnvelope> {
        Arc::new(EventEnvelope {
            subscription: None,
            category: Category::state_changed(),
            header: EventHeader {
                event_type: "state_changed".into(),
                entity_id: Some(entity_id.into()),
                domain: entity_id.split_once('.').map(|(d, _)| d.to_owned()),
                time_fired: None,
            },
            payload: Arc::new(json!({ "event_type": "state_changed" })),
            received_at: Utc::now(),
        })
    }

    fn entity(event: &EventEnvelope) -> &str {
        event.header.entity_id.as_deref().unwrap()
    }

    #[test]
    fn full_mailbox_drops_oldest() {
        let mailbox = Mailbox::new(2);
        assert!(mailbox.push(event("light.a")));
        assert!(mailbox.push(event("light.b")));
        assert!(mailbox.push(event("light.c")));

        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.dropped(), 1);
        assert_eq!(entity(&mailbox.try_recv().unwrap()), "light.b");
        assert_eq!(entity(&mailbox.try_recv().unwrap()), "light.c");
        assert!(mailbox.try_recv().is_none());
        assert_eq!(mailbox.delivered(), 2);
    }

    #[test]
    fn close_discards_buffer_and_refuses_pushes() {
        let mailbox = Mailbox::new(4);
        mailbox.push(event("light.a"));
        mailbox.close();

        assert!(mailbox.is_closed());
        assert!(mailbox.try_recv().is_none());
        assert!(!mailbox.push(event("light.b")));
        assert_eq!(mailbox.len(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_on_close() {
        let mailbox = Arc::new(Mailbox::new(4));

        let reader = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move {
                let first = mailbox.recv().await.map(|e| entity(&e).to_owned());
                let second = mailbox.recv().await;
                (first, second.is_none())
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.push(event("light.kitchen"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.close();

        let (first, ended) = reader.await.unwrap();
        assert_eq!(first.as_deref(), Some("light.kitchen"));
        assert!(ended);
    }
}
