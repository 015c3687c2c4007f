// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle returned by [`SubscriberRegistry::subscribe`].
/// Unsubscribing is by token rather than callback identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<R> = Box<dyn Fn(&'static str, &R) + Send + Sync>;

/// Set of event subscribers notified with (event name, record snapshot)
/// after each applied event. Adding and removing subscribers is safe
/// from any thread; removal is idempotent.
pub struct SubscriberRegistry<R> {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, Subscriber<R>>>,
}

impl<R> Default for SubscriberRegistry<R> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }
}

impl<R> SubscriberRegistry<R> {
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&'static str, &R) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().insert(id, Box::new(subscriber));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().remove(&id.0);
    }

    pub fn notify(&self, event: &'static str, record: &R) {
        for subscriber in self.subscribers.read().values() {
            subscriber(event, record);
        }
    }
}
