pub mod error;
pub mod event;
pub mod observer;
pub mod region;

pub use error::CommitVeto;
pub use event::{ChangeEvent, ChangeKind, EventKind, PreUpdateEvent, SqlValue};
pub use observer::{Liveness, ObserverExtent, OwnerToken, TransactionObserver};
pub use region::Region;
