// ── Event subscription registry ──
//
// One upstream subscription per category, shared by every consumer that
// asked for it. The registry only does the bookkeeping (refcounts,
// upstream ids, re-arm progress) and tells the session actor which
// subscribe/unsubscribe commands to put on the wire.

use std::collections::HashMap;

use serde::Serialize;

use halink_api::Category;

/// Upstream binding of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// Needs a `subscribe_events` as soon as a socket is available.
    Unbound,
    /// `subscribe_events` in flight under `request_id`.
    Requested { request_id: u64, attempt: u32 },
    /// Live; events arrive tagged with `upstream_id`.
    Bound { upstream_id: u64 },
    /// Re-arm retries exhausted on this socket.
    Degraded,
}

#[derive(Debug)]
struct Entry {
    refcount: usize,
    binding: Binding,
    /// The backend has accepted this category at least once. Until then
    /// consumers wait for the first subscribe to settle.
    confirmed: bool,
}

/// What `ensure` wants the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ensure {
    /// Already live (or known good and being re-armed); attach now.
    Ready,
    /// First of its kind: issue `subscribe_events` and wait for it.
    Subscribe,
    /// A subscribe is already pending (or the socket is down); wait.
    Wait,
}

/// Outcome of a successful `subscribe_events` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Subscribed {
    Activated,
    /// Nobody wants this subscription any more; unsubscribe it.
    Stale,
}

/// Outcome of a failed `subscribe_events` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejected {
    /// A first subscribe failed: the entry is gone and every waiting
    /// registration must be failed.
    Dropped,
    /// A re-arm failed; try again as attempt `attempt`.
    Retry { attempt: u32 },
    /// A re-arm failed too often; consumers stay attached without events.
    Degraded,
    /// Response for a request nobody tracks any more.
    Stale,
}

/// Outcome of `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Other consumers still hold the category.
    Retained,
    /// Last reference gone; unsubscribe this upstream id.
    Unsubscribe(u64),
    /// Last reference gone; nothing is live upstream.
    Dropped,
}

/// Per-category view for stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub category: Category,
    pub refcount: usize,
    pub upstream_id: Option<u64>,
    pub degraded: bool,
}

/// Refcounted category → upstream subscription table.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<Category, Entry>,
    by_upstream: HashMap<u64, Category>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `category`.
    pub(crate) fn ensure(&mut self, category: &Category, online: bool) -> Ensure {
        let entry = self.entries.entry(category.clone()).or_insert_with(|| Entry {
            refcount: 0,
            binding: Binding::Unbound,
            confirmed: false,
        });
        entry.refcount += 1;
        tracing::debug!(%category, refcount = entry.refcount, "subscription reference taken");

        if entry.confirmed {
            Ensure::Ready
        } else if online && entry.binding == Binding::Unbound {
            Ensure::Subscribe
        } else {
            Ensure::Wait
        }
    }

    /// Record that `subscribe_events` for `category` went out as `request_id`.
    pub(crate) fn mark_requested(&mut self, category: &Category, request_id: u64, attempt: u32) {
        if let Some(entry) = self.entries.get_mut(category) {
            entry.binding = Binding::Requested {
                request_id,
                attempt,
            };
        }
    }

    /// The backend accepted `subscribe_events` sent as `request_id`.
    /// The backend tags the category's events with that same id.
    pub(crate) fn on_subscribed(&mut self, category: &Category, request_id: u64) -> Subscribed {
        let Some(entry) = self.entries.get_mut(category) else {
            return Subscribed::Stale;
        };
        if !matches!(entry.binding, Binding::Requested { request_id: r, .. } if r == request_id) {
            return Subscribed::Stale;
        }
        entry.binding = Binding::Bound {
            upstream_id: request_id,
        };
        entry.confirmed = true;
        self.by_upstream.insert(request_id, category.clone());
        tracing::debug!(%category, upstream_id = request_id, "subscription bound");
        Subscribed::Activated
    }

    /// The backend refused (or never answered) `subscribe_events` sent as
    /// `request_id`. `budget` is how many re-arm attempts a category gets.
    pub(crate) fn on_rejected(
        &mut self,
        category: &Category,
        request_id: u64,
        budget: u32,
    ) -> Rejected {
        let Some(entry) = self.entries.get_mut(category) else {
            return Rejected::Stale;
        };
        let Binding::Requested {
            request_id: expected,
            attempt,
        } = entry.binding
        else {
            return Rejected::Stale;
        };
        if expected != request_id {
            return Rejected::Stale;
        }

        if !entry.confirmed {
            self.entries.remove(category);
            return Rejected::Dropped;
        }

        if attempt < budget {
            entry.binding = Binding::Unbound;
            Rejected::Retry {
                attempt: attempt + 1,
            }
        } else {
            entry.binding = Binding::Degraded;
            tracing::warn!(
                %category,
                attempts = attempt,
                "re-subscribe failed repeatedly, category degraded until next reconnect"
            );
            Rejected::Degraded
        }
    }

    /// Drop one reference on `category`.
    pub(crate) fn release(&mut self, category: &Category) -> Release {
        let Some(entry) = self.entries.get_mut(category) else {
            tracing::debug!(%category, "release for unknown category ignored");
            return Release::Dropped;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return Release::Retained;
        }

        let binding = entry.binding;
        self.entries.remove(category);
        tracing::debug!(%category, "last subscription reference released");
        match binding {
            Binding::Bound { upstream_id } => {
                self.by_upstream.remove(&upstream_id);
                Release::Unsubscribe(upstream_id)
            }
            Binding::Unbound | Binding::Requested { .. } | Binding::Degraded => Release::Dropped,
        }
    }

    /// The socket is gone: every upstream id is void.
    pub(crate) fn unbind_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.binding = Binding::Unbound;
        }
        self.by_upstream.clear();
    }

    /// Categories that need a `subscribe_events` on the current socket.
    pub(crate) fn rearm_targets(&self) -> Vec<Category> {
        let mut targets: Vec<Category> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.refcount > 0 && entry.binding == Binding::Unbound)
            .map(|(category, _)| category.clone())
            .collect();
        targets.sort();
        targets
    }

    /// No subscribe is outstanding or owed. Degraded categories count as
    /// settled.
    pub(crate) fn is_settled(&self) -> bool {
        self.entries
            .values()
            .all(|entry| matches!(entry.binding, Binding::Bound { .. } | Binding::Degraded))
    }

    pub(crate) fn category_for(&self, upstream_id: u64) -> Option<&Category> {
        self.by_upstream.get(&upstream_id)
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, category: &Category) -> usize {
        self.entries.get(category).map_or(0, |entry| entry.refcount)
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .entries
            .iter()
            .map(|(category, entry)| SubscriptionInfo {
                category: category.clone(),
                refcount: entry.refcount,
                upstream_id: match entry.binding {
                    Binding::Bound { upstream_id } => Some(upstream_id),
                    _ => None,
                },
                degraded: entry.binding == Binding::Degraded,
            })
            .collect();
        infos.sort_by(|a, b| a.category.cmp(&b.category));
        infos
    }
}

// ── Tests ────────────────────────────────────────────────────────────
