pub mod coordinator;
pub mod error;
pub mod registry;
pub mod savepoint;
pub mod statement;
pub mod writer;

pub use coordinator::{Notification, TransactionCoordinator, TransactionState};
pub use error::EngineError;
pub use registry::{ObserverId, ObserverRegistry, SharedObserver};
pub use savepoint::SavepointStack;
pub use statement::{SavepointOp, StatementKind, TransactionKind, TransactionOp};
pub use writer::WriterConnection;
