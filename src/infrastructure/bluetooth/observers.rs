//! Observer registry for link state broadcasts.

use crate::domain::models::LinkState;
use std::sync::Arc;

pub type Observer = Arc<dyn Fn(&LinkState) + Send + Sync>;

/// Identity of a registered observer, returned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Identity-keyed observer set, iterated in registration order.
///
/// Broadcasts iterate a [`snapshot`](Self::snapshot), so removing an observer
/// while a broadcast is running does not affect that broadcast.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: u64,
    entries: Vec<(ObserverId, Observer)>,
}

impl ObserverRegistry {
    pub fn register(&mut self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Observer> {
        self.entries.iter().map(|(_, o)| o.clone()).collect()
    }
}
