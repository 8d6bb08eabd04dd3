use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::CommitVeto;
use crate::event::{ChangeEvent, EventKind, PreUpdateEvent};

/// Capability interface for transaction observers.
///
/// All callbacks run synchronously on the writer's execution context and
/// are fast-path: they must not block or perform I/O. Work that takes time
/// belongs on the read scheduler.
///
/// `changed` is only invoked for events whose kind passed `observes` when
/// the producing statement was prepared; it fires as rows mutate, possibly
/// before the transaction's fate is known. `committed`/`rolled_back` close
/// every transaction the observer lived through, in registration order
/// across observers.
pub trait TransactionObserver: Send {
    /// Declares interest in a kind of event. Called once per registered
    /// observer per statement, before the statement executes.
    fn observes(&self, kind: &EventKind) -> bool;

    /// A row matching this observer's interest was inserted, updated, or
    /// deleted. Changes inside open savepoints are buffered and delivered
    /// only once they can no longer be rolled back individually.
    fn changed(&mut self, event: &ChangeEvent);

    /// Before/after column values for a row about to change. Only invoked
    /// when the optional pre-update capability is compiled in and
    /// [`wants_before_values`](Self::wants_before_values) returns true.
    fn will_change(&mut self, _event: &PreUpdateEvent) {}

    /// Opt-in for the pre-update capability.
    fn wants_before_values(&self) -> bool {
        false
    }

    /// Last chance to veto the commit. An `Err` forces a rollback and is
    /// re-raised to the writer as the authoritative error.
    fn will_commit(&mut self) -> Result<(), CommitVeto> {
        Ok(())
    }

    /// The transaction committed; buffered changes were delivered first.
    fn committed(&mut self);

    /// The transaction rolled back; buffered changes were discarded.
    fn rolled_back(&mut self);
}

/// Lifetime policy of a registered observer.
#[derive(Clone, Debug)]
pub enum ObserverExtent {
    /// Lives while the owning registrant does. The registry skips and
    /// eventually prunes the observer once the probe reports it dead.
    ObserverOwned(Liveness),
    /// Receives exactly one `committed` or `rolled_back`, then self-removes.
    UntilNextTransaction,
    /// Lives as long as the connection, or until explicitly removed.
    ConnectionLifetime,
}

/// Shared liveness probe for `ObserverOwned` observers.
///
/// Cheap to clone; reports dead once the paired [`OwnerToken`] is dropped.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Ownership token held by an observer's registrant.
///
/// Dropping the token marks every [`Liveness`] probe derived from it dead,
/// which retires the observer from the registry without any further call.
#[derive(Debug)]
pub struct OwnerToken {
    flag: Arc<AtomicBool>,
}

impl OwnerToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn liveness(&self) -> Liveness {
        Liveness(Arc::clone(&self.flag))
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OwnerToken {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
