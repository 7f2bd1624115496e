//! Subscription table: per data kind, which consumer fields want the data.

use std::sync::Arc;

use ahash::AHashMap as HashMap;

use crate::mux::types::{Consumer, ConsumerId, DataKind, ReferenceKey};

/// Identifies one acquisition of a reference by one subscription. A fresh
/// ticket is issued every time a subscription is (re)bound to a key.
pub type Ticket = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub key: ReferenceKey,
    pub ticket: Ticket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub field: String,
    pub kind: DataKind,
    /// The reference this field holds, if any. Unbound subscriptions belong to
    /// consumers with no (or an incompatible) instrument.
    pub binding: Option<Binding>,
}

struct ConsumerEntry {
    sink: Arc<dyn Consumer>,
    subscriptions: Vec<Subscription>,
}

#[derive(Default)]
pub struct SubscriptionTable {
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, consumer: ConsumerId, field: &str) -> Option<&Subscription> {
        self.consumers.get(&consumer)?.subscriptions.iter().find(|s| s.field == field)
    }

    /// Register a subscription. Returns `false` (and changes nothing) when the
    /// consumer already has this field.
    pub fn insert(&mut self, sink: &Arc<dyn Consumer>, subscription: Subscription) -> bool {
        let entry = self.consumers.entry(sink.id()).or_insert_with(|| ConsumerEntry {
            sink: Arc::clone(sink),
            subscriptions: Vec::new(),
        });
        if entry.subscriptions.iter().any(|s| s.field == subscription.field) {
            return false;
        }
        entry.subscriptions.push(subscription);
        true
    }

    /// Remove a field; the consumer is dropped once it has none left.
    pub fn remove(&mut self, consumer: ConsumerId, field: &str) -> Option<Subscription> {
        let entry = self.consumers.get_mut(&consumer)?;
        let index = entry.subscriptions.iter().position(|s| s.field == field)?;
        let removed = entry.subscriptions.remove(index);
        if entry.subscriptions.is_empty() {
            self.consumers.remove(&consumer);
        }
        Some(removed)
    }

    fn locate(&self, ticket: Ticket) -> Option<(ConsumerId, usize)> {
        self.consumers.iter().find_map(|(id, entry)| {
            entry
                .subscriptions
                .iter()
                .position(|s| s.binding.as_ref().is_some_and(|b| b.ticket == ticket))
                .map(|index| (*id, index))
        })
    }

    /// Remove the subscription that holds `ticket`, if it still does.
    pub fn forget(&mut self, ticket: Ticket) -> Option<Subscription> {
        let (consumer, index) = self.locate(ticket)?;
        let entry = self.consumers.get_mut(&consumer)?;
        let removed = entry.subscriptions.remove(index);
        if entry.subscriptions.is_empty() {
            self.consumers.remove(&consumer);
        }
        Some(removed)
    }

    /// Unbind the subscription that holds `ticket`, keeping the field.
    pub fn detach(&mut self, ticket: Ticket) -> Option<ReferenceKey> {
        let (consumer, index) = self.locate(ticket)?;
        let sub = self.consumers.get_mut(&consumer)?.subscriptions.get_mut(index)?;
        sub.binding.take().map(|b| b.key)
    }

    pub fn subscriptions(&self, consumer: ConsumerId) -> &[Subscription] {
        self.consumers.get(&consumer).map(|e| e.subscriptions.as_slice()).unwrap_or(&[])
    }

    pub fn subscriptions_mut(&mut self, consumer: ConsumerId) -> Option<&mut Vec<Subscription>> {
        self.consumers.get_mut(&consumer).map(|e| &mut e.subscriptions)
    }

    /// Every `(consumer, field)` currently bound to `key`.
    pub fn bound_to(&self, key: &ReferenceKey) -> Vec<(Arc<dyn Consumer>, String)> {
        let mut out = Vec::new();
        for entry in self.consumers.values() {
            for sub in &entry.subscriptions {
                if sub.binding.as_ref().is_some_and(|b| &b.key == key) {
                    out.push((Arc::clone(&entry.sink), sub.field.clone()));
                }
            }
        }
        out
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
