//! Transactional change notification and concurrency coordination for
//! SQLite, built on [`rusqlite`].
//!
//! A [`Database`] owns one writer connection and a pool of read-only WAL
//! readers. Observers registered against the writer see row changes as they
//! happen, can veto commits, and are told the transaction's outcome.
//! [`Database::observe`] builds on that to re-fetch a query after every
//! commit that touches its [`Region`], delivering results in commit order.

pub mod database;

pub use database::Database;

pub use ripple_core::{
    ChangeEvent, ChangeKind, CommitVeto, EventKind, Liveness, ObserverExtent, OwnerToken,
    PreUpdateEvent, Region, SqlValue, TransactionObserver,
};
pub use ripple_engine::{
    EngineError, ObserverId, TransactionKind, TransactionState, WriterConnection,
};
pub use ripple_watch::{InitialDispatch, ReadHandle, ReadScheduler, ReaderPool, WatchHandle};
