use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use ripple_core::{EventKind, ObserverExtent, TransactionObserver};

/// Observers are shared so notification snapshots can outlive registry
/// mutation. The registry locks an observer only for the duration of one
/// callback.
pub type SharedObserver = Arc<Mutex<dyn TransactionObserver>>;

/// Handle returned by [`ObserverRegistry::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Slot {
    id: ObserverId,
    observer: SharedObserver,
    extent: ObserverExtent,
}

impl Slot {
    fn is_dead(&self) -> bool {
        match &self.extent {
            ObserverExtent::ObserverOwned(liveness) => !liveness.is_alive(),
            _ => false,
        }
    }
}

/// Registration-ordered collection of observers.
///
/// Registration order is the notification order for commit and rollback.
/// Slots whose owner died are skipped immediately and pruned lazily.
#[derive(Default)]
pub struct ObserverRegistry {
    slots: Vec<Slot>,
    next_id: u64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: SharedObserver, extent: ObserverExtent) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        debug!(id = self.next_id, ?extent, "observer registered");
        self.slots.push(Slot {
            id,
            observer,
            extent,
        });
        id
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| s.id != id);
        before != self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.slots.iter().any(|s| s.id == id)
    }

    fn prune_dead(&mut self) {
        self.slots.retain(|s| !s.is_dead());
    }

    /// Observers interested in at least one of the given event kinds.
    /// Recomputed per statement: interest depends on the statement, not the
    /// connection.
    pub fn active_for(&mut self, kinds: &[EventKind]) -> Vec<SharedObserver> {
        self.prune_dead();
        self.slots
            .iter()
            .filter(|s| {
                let observer = s.observer.lock();
                kinds.iter().any(|k| observer.observes(k))
            })
            .map(|s| Arc::clone(&s.observer))
            .collect()
    }

    /// Every live observer, registration order.
    pub fn all_live(&mut self) -> Vec<SharedObserver> {
        self.prune_dead();
        self.slots.iter().map(|s| Arc::clone(&s.observer)).collect()
    }

    /// Snapshot for commit notification. `UntilNextTransaction` observers
    /// are expired from the registry as part of taking the snapshot; the
    /// returned list still contains them so they receive this final
    /// notification.
    pub fn notify_commit(&mut self) -> Vec<SharedObserver> {
        self.take_transaction_snapshot()
    }

    /// Snapshot for rollback notification, symmetric with
    /// [`notify_commit`](Self::notify_commit).
    pub fn notify_rollback(&mut self) -> Vec<SharedObserver> {
        self.take_transaction_snapshot()
    }

    fn take_transaction_snapshot(&mut self) -> Vec<SharedObserver> {
        self.prune_dead();
        let snapshot: Vec<SharedObserver> =
            self.slots.iter().map(|s| Arc::clone(&s.observer)).collect();
        self.slots
            .retain(|s| !matches!(s.extent, ObserverExtent::UntilNextTransaction));
        snapshot
    }
}
