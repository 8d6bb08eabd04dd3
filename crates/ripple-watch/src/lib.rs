pub mod pool;
pub mod scheduler;
pub mod watcher;

pub use pool::ReaderPool;
pub use scheduler::{ReadHandle, ReadScheduler};
pub use watcher::{observe, InitialDispatch, WatchHandle};
