use crate::error::{LiveError, Result};
use crate::model::{Event, Filter};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Entry {
    filter: Filter,
    consumer: mpsc::UnboundedSender<Result<Event>>,
}

/// Active subscriptions keyed by id. Ids grow monotonically, so iteration
/// order is subscription order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionId, Entry>,
}

impl SubscriptionRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn has_filter(&self, filter: &Filter) -> bool {
        self.entries.values().any(|e| &e.filter == filter)
    }

    /// Returns `true` when the active filter set grew.
    pub fn insert(
        &mut self,
        id: SubscriptionId,
        filter: Filter,
        consumer: mpsc::UnboundedSender<Result<Event>>,
    ) -> bool {
        let grew = !self.has_filter(&filter);
        self.entries.insert(id, Entry { filter, consumer });
        grew
    }

    /// Returns `true` when the active filter set shrank. Unknown ids are a no-op.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => !self.has_filter(&entry.filter),
            None => false,
        }
    }

    /// Union of every active subscription's filter, in first-subscribed order.
    pub fn active_filters(&self) -> Vec<Filter> {
        let mut out: Vec<Filter> = Vec::new();
        for e in self.entries.values() {
            if !out.contains(&e.filter) {
                out.push(e.filter.clone());
            }
        }
        out
    }

    /// Deliver to every matching consumer. Consumers whose receiver is gone
    /// are pruned; returns `true` if that shrank the filter set.
    pub fn fan_out(&mut self, event: &Event) -> bool {
        let keys = event.matching_filters();
        if keys.is_empty() {
            return false;
        }
        let mut gone = Vec::new();
        let mut delivered = 0usize;
        for (id, entry) in &self.entries {
            if !keys.contains(&entry.filter) {
                continue;
            }
            if entry.consumer.send(Ok(event.clone())).is_err() {
                gone.push(*id);
            } else {
                delivered += 1;
            }
        }
        tracing::trace!(type_event = %event.type_event, delivered, "event dispatched");
        let mut shrank = false;
        for id in gone {
            shrank |= self.remove(id);
        }
        shrank
    }

    /// Hand `err` to every consumer and drop them all.
    pub fn fail_all(&mut self, err: LiveError) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            let _ = entry.consumer.send(Err(err.clone()));
        }
    }
}
