//! Typed content-changed notifications

use std::collections::BTreeMap;

use crate::types::DisplayId;

/// A display's content entry was created, mutated or removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChanged {
    pub display: DisplayId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(ContentChanged)>;

#[derive(Default)]
pub struct ContentObservers {
    next_id: u64,
    callbacks: BTreeMap<SubscriptionId, Callback>,
}

impl ContentObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: impl FnMut(ContentChanged) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.callbacks.insert(id, Box::new(callback));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Deliver in subscription order
    pub fn emit(&mut self, event: ContentChanged) {
        for callback in self.callbacks.values_mut() {
            callback(event);
        }
    }
}
