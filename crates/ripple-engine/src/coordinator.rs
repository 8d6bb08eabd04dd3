use tracing::{debug, warn};

use ripple_core::{
    ChangeEvent, ChangeKind, CommitVeto, EventKind, ObserverExtent, TransactionObserver,
};

use crate::registry::{ObserverId, ObserverRegistry, SharedObserver};
use crate::savepoint::SavepointStack;
use crate::statement::{SavepointOp, StatementKind, TransactionOp};

/// Where the connection stands in its transaction lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    NoTransaction,
    Pending,
    Committing,
    RollingBack,
}

/// One-shot slot capturing how the just-executed statement ended a
/// transaction, filled synchronously by the engine's commit/rollback hooks
/// and consumed after statement bookkeeping.
enum HookOutcome {
    Commit,
    Rollback,
    Cancelled(CommitVeto),
}

/// A deferred observer notification. Coordinator methods return these so
/// the caller can deliver them after releasing the coordinator lock;
/// observer callbacks never run while coordinator state is held.
pub enum Notification {
    Change {
        event: ChangeEvent,
        observers: Vec<SharedObserver>,
    },
    Commit(Vec<SharedObserver>),
    Rollback(Vec<SharedObserver>),
}

impl Notification {
    /// Deliver to the captured observers. Callbacks run in list order.
    pub fn deliver(self) {
        match self {
            Self::Change { event, observers } => {
                for observer in observers {
                    observer.lock().changed(&event);
                }
            }
            Self::Commit(observers) => {
                for observer in observers {
                    observer.lock().committed();
                }
            }
            Self::Rollback(observers) => {
                for observer in observers {
                    observer.lock().rolled_back();
                }
            }
        }
    }
}

/// State machine that interprets statement execution as transaction and
/// savepoint transitions, drives the savepoint stack, and fires registry
/// notifications at commit/rollback boundaries.
///
/// All mutation happens synchronously on the writer's execution context.
/// The engine's hooks reach the coordinator through a shared
/// `Arc<parking_lot::Mutex<TransactionCoordinator>>`; the writer brackets
/// each statement with [`statement_will_execute`] and
/// [`statement_did_execute`]/[`statement_did_fail`].
///
/// [`statement_will_execute`]: Self::statement_will_execute
/// [`statement_did_execute`]: Self::statement_did_execute
/// [`statement_did_fail`]: Self::statement_did_fail
pub struct TransactionCoordinator {
    state: TransactionState,
    savepoints: SavepointStack,
    registry: ObserverRegistry,
    /// Active observers for the statement currently executing. Computed
    /// before execution, cleared after; statements are typically reused so
    /// this is per-statement work, not per-transaction.
    statement_observers: Vec<SharedObserver>,
    /// SET-list columns of the current UPDATE, for event construction.
    statement_update_columns: Vec<String>,
    hook_outcome: Option<HookOutcome>,
    /// Bumped on DDL so collaborators can invalidate schema-derived caches.
    schema_generation: u64,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self {
            state: TransactionState::NoTransaction,
            savepoints: SavepointStack::new(),
            registry: ObserverRegistry::new(),
            statement_observers: Vec::new(),
            statement_update_columns: Vec::new(),
            hook_outcome: None,
            schema_generation: 0,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn schema_generation(&self) -> u64 {
        self.schema_generation
    }

    pub fn add_observer(
        &mut self,
        observer: SharedObserver,
        extent: ObserverExtent,
    ) -> ObserverId {
        self.registry.add(observer, extent)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.registry.remove(id)
    }

    pub fn observer_count(&self) -> usize {
        self.registry.len()
    }

    /// Prepare for a statement: reset the hook-outcome slot and compute the
    /// set of observers whose filter matches any event kind the statement
    /// could produce.
    pub fn statement_will_execute(&mut self, stmt: &StatementKind) {
        self.hook_outcome = None;
        self.statement_update_columns.clear();
        self.statement_observers = match stmt {
            StatementKind::Mutation { kinds } => {
                for kind in kinds {
                    if let EventKind::Update { columns, .. } = kind {
                        self.statement_update_columns = columns.clone();
                    }
                }
                self.registry.active_for(kinds)
            }
            // Unknown reach: assume any observer could be interested.
            StatementKind::Unclassified => self.registry.all_live(),
            _ => Vec::new(),
        };
    }

    /// Engine update hook: one row changed. Buffered while savepoints are
    /// open, otherwise delivered immediately to the statement's active set.
    pub fn row_changed(
        &mut self,
        kind: ChangeKind,
        table: &str,
        row_id: i64,
    ) -> Option<Notification> {
        let event = match kind {
            ChangeKind::Insert => ChangeEvent::insert(table, row_id),
            ChangeKind::Delete => ChangeEvent::delete(table, row_id),
            ChangeKind::Update => ChangeEvent::update(
                table,
                row_id,
                self.statement_update_columns.iter().cloned(),
            ),
        };
        if event.is_internal() || self.statement_observers.is_empty() {
            return None;
        }
        if !self.savepoints.is_empty() {
            // Copy now: the event must not reference anything transient,
            // and the observer list is the one computed for this statement.
            self.savepoints
                .record(event, self.statement_observers.clone());
            return None;
        }
        Some(Notification::Change {
            event,
            observers: self.statement_observers.clone(),
        })
    }

    /// Observers that asked for before/after values, for the pre-update
    /// hook. Restricted to the statement's active set.
    pub fn pre_update_targets(&self) -> Vec<SharedObserver> {
        self.statement_observers
            .iter()
            .filter(|o| o.lock().wants_before_values())
            .cloned()
            .collect()
    }

    /// Engine commit hook. Gives every live observer a chance to veto;
    /// returns true to abort the commit (the engine then rolls back).
    ///
    /// Runs synchronously inside the hook: the veto must be decided before
    /// the engine proceeds. Observer `will_commit` implementations are
    /// fast-path and must not touch the database.
    pub fn engine_will_commit(&mut self) -> bool {
        for observer in self.registry.all_live() {
            if let Err(veto) = observer.lock().will_commit() {
                debug!(reason = veto.reason(), "commit vetoed by observer");
                self.hook_outcome = Some(HookOutcome::Cancelled(veto));
                return true;
            }
        }
        self.hook_outcome = Some(HookOutcome::Commit);
        false
    }

    /// Engine rollback hook. A veto already captured stays authoritative.
    pub fn engine_did_rollback(&mut self) {
        match self.hook_outcome {
            Some(HookOutcome::Cancelled(_)) => {}
            _ => self.hook_outcome = Some(HookOutcome::Rollback),
        }
    }

    /// Post-execution bookkeeping for a successful statement, then
    /// processing of any transaction outcome the hooks captured while it
    /// ran. Bookkeeping strictly precedes outcome processing so a hook
    /// outcome never observes a half-updated savepoint stack.
    ///
    /// `autocommit` is the engine's flag queried after execution; it lets
    /// the coordinator synthesize outcomes for empty transactions, whose
    /// COMMIT/ROLLBACK the engine completes without firing any hook.
    pub fn statement_did_execute(
        &mut self,
        stmt: &StatementKind,
        autocommit: bool,
    ) -> Vec<Notification> {
        let mut notifications = Vec::new();
        match stmt {
            StatementKind::Transaction(TransactionOp::Begin(_)) => {
                self.state = TransactionState::Pending;
            }
            StatementKind::Transaction(TransactionOp::Commit) => {
                self.synthesize_outcome(HookOutcome::Commit, autocommit);
            }
            StatementKind::Transaction(TransactionOp::Rollback) => {
                self.synthesize_outcome(HookOutcome::Rollback, autocommit);
            }
            StatementKind::Savepoint(SavepointOp::Begin(name)) => {
                // The outermost savepoint opens a transaction of its own.
                if self.state == TransactionState::NoTransaction {
                    self.state = TransactionState::Pending;
                }
                self.savepoints.begin(name);
            }
            StatementKind::Savepoint(SavepointOp::RollbackTo(name)) => {
                self.savepoints.rollback_to(name);
            }
            StatementKind::Savepoint(SavepointOp::Release(name)) => {
                if let Some(flushed) = self.savepoints.release(name) {
                    notifications.extend(flushed.into_iter().map(|b| Notification::Change {
                        event: b.event,
                        observers: b.observers,
                    }));
                    // Outermost release of a savepoint-born transaction
                    // commits it.
                    self.synthesize_outcome(HookOutcome::Commit, autocommit);
                }
            }
            StatementKind::SchemaChange => {
                self.schema_generation += 1;
                debug!(generation = self.schema_generation, "schema changed");
            }
            _ => {}
        }

        if let Some(outcome) = self.hook_outcome.take() {
            match outcome {
                HookOutcome::Commit => self.finish_commit(&mut notifications),
                HookOutcome::Rollback => {
                    let notify = self.state == TransactionState::Pending;
                    self.finish_rollback(notify, &mut notifications);
                }
                HookOutcome::Cancelled(veto) => {
                    // A vetoed commit fails its statement; reaching here
                    // means the engine disagreed. Treat as rollback.
                    warn!(reason = veto.reason(), "veto captured on successful statement");
                    self.finish_rollback(true, &mut notifications);
                }
            }
        }
        self.statement_observers.clear();
        notifications
    }

    /// Failure path. Decides, from the captured outcome and the engine's
    /// autocommit flag, whether the transaction ended and whether observers
    /// must hear about it, and surfaces a captured veto as the
    /// authoritative error.
    pub fn statement_did_fail(
        &mut self,
        _stmt: &StatementKind,
        autocommit: bool,
    ) -> (Vec<Notification>, Option<CommitVeto>) {
        let mut notifications = Vec::new();
        let mut veto = None;
        match self.hook_outcome.take() {
            Some(HookOutcome::Cancelled(v)) => {
                // The engine converted the vetoed COMMIT into a rollback.
                self.finish_rollback(true, &mut notifications);
                veto = Some(v);
            }
            Some(HookOutcome::Rollback) => {
                let notify = self.state == TransactionState::Pending;
                self.finish_rollback(notify, &mut notifications);
            }
            Some(HookOutcome::Commit) => {
                // Commit went through before the statement failed.
                self.finish_commit(&mut notifications);
            }
            None => {
                if self.state == TransactionState::Pending && autocommit {
                    // The engine auto-rolled back without a visible hook;
                    // SQLite does this for some error classes.
                    debug!("transaction auto-rolled back by engine after failed statement");
                    self.finish_rollback(true, &mut notifications);
                }
                // Otherwise the transaction, if any, is still open and an
                // explicit ROLLBACK remains the caller's responsibility.
            }
        }
        self.statement_observers.clear();
        (notifications, veto)
    }

    /// Promote a control statement that completed without firing hooks
    /// (empty transaction) to an explicit outcome.
    fn synthesize_outcome(&mut self, outcome: HookOutcome, autocommit: bool) {
        if self.hook_outcome.is_none() && self.state == TransactionState::Pending && autocommit {
            self.hook_outcome = Some(outcome);
        }
    }

    fn finish_commit(&mut self, notifications: &mut Vec<Notification>) {
        self.state = TransactionState::Committing;
        // Savepoints not explicitly released are committed with the
        // transaction; their buffered events are delivered first.
        for buffered in self.savepoints.drain() {
            notifications.push(Notification::Change {
                event: buffered.event,
                observers: buffered.observers,
            });
        }
        notifications.push(Notification::Commit(self.registry.notify_commit()));
        self.state = TransactionState::NoTransaction;
        debug!("transaction committed");
    }

    fn finish_rollback(&mut self, notify: bool, notifications: &mut Vec<Notification>) {
        self.state = TransactionState::RollingBack;
        self.savepoints.clear();
        if notify {
            notifications.push(Notification::Rollback(self.registry.notify_rollback()));
        }
        self.state = TransactionState::NoTransaction;
        debug!(notified = notify, "transaction rolled back");
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
