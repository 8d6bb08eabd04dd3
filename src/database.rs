use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use ripple_core::{ObserverExtent, OwnerToken, Region, TransactionObserver};
use ripple_engine::{
    EngineError, ObserverId, TransactionCoordinator, TransactionKind, WriterConnection,
};
use ripple_watch::{observe, InitialDispatch, ReadHandle, ReadScheduler, ReaderPool, WatchHandle};

/// One SQLite database with a single serialized writer, a pool of WAL
/// readers, and ordered change observation.
///
/// All writes go through the writer connection behind a mutex. Reads run
/// concurrently on pooled read-only connections via [`read`](Self::read),
/// and [`observe`](Self::observe) watches a region across commits.
///
/// Must be opened from within a tokio runtime; result delivery rides on it.
pub struct Database {
    writer: Mutex<WriterConnection>,
    coordinator: Arc<Mutex<TransactionCoordinator>>,
    scheduler: ReadScheduler,
    readers: ReaderPool,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database at `path`.
    ///
    /// In-memory databases are rejected: readers attach to the same file as
    /// the writer, which `:memory:` cannot provide.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let repr = path.to_string_lossy();
        if repr.is_empty() || repr == ":memory:" || repr.starts_with("file::memory:") {
            return Err(EngineError::Config(
                "a file path is required; in-memory databases have no shared readers".into(),
            ));
        }
        let writer = WriterConnection::open(path)?;
        let coordinator = writer.coordinator();
        let scheduler = ReadScheduler::new();
        let readers = ReaderPool::new(path);
        info!(path = %repr, "database open");
        Ok(Self {
            writer: Mutex::new(writer),
            coordinator,
            scheduler,
            readers,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute one write statement on the writer connection.
    pub fn execute<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<usize, EngineError> {
        self.writer.lock().execute(sql, params)
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T, EngineError>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.writer.lock().query_row(sql, params, f)
    }

    /// Run `f` inside a deferred transaction on the writer, committing on
    /// success and rolling back on error.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut WriterConnection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.writer.lock().transaction(f)
    }

    pub fn transaction_with<T>(
        &self,
        kind: TransactionKind,
        f: impl FnOnce(&mut WriterConnection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.writer.lock().transaction_with(kind, f)
    }

    pub fn add_observer(
        &self,
        observer: impl TransactionObserver + 'static,
        extent: ObserverExtent,
    ) -> ObserverId {
        self.writer.lock().add_observer(observer, extent)
    }

    /// Register an observer whose lifetime is tied to the returned token.
    /// Once the token is dropped the observer stops receiving callbacks and
    /// is pruned on the next registry pass.
    pub fn add_owned_observer(
        &self,
        observer: impl TransactionObserver + 'static,
    ) -> (ObserverId, OwnerToken) {
        let token = OwnerToken::new();
        let id = self.writer.lock().add_observer(
            observer,
            ObserverExtent::ObserverOwned(token.liveness()),
        );
        (id, token)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.writer.lock().remove_observer(id)
    }

    /// Run `fetch` on a pooled reader via the ordered scheduler.
    ///
    /// Reads scheduled after a commit observe at least that commit, and two
    /// reads scheduled in sequence resolve their deliveries in that sequence.
    pub fn read<T, F>(&self, fetch: F) -> ReadHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let readers = self.readers.clone();
        self.scheduler.read(move || readers.with(fetch))
    }

    /// Watch `region`: after every commit that touches it, `fetch` runs on a
    /// pooled reader and `dispatch` receives the result, in commit order.
    pub fn observe<T>(
        &self,
        region: Region,
        fetch: impl Fn(&Connection) -> Result<T, EngineError> + Send + Sync + 'static,
        dispatch: impl FnMut(Result<T, EngineError>) + Send + 'static,
        initial: InitialDispatch,
    ) -> Result<WatchHandle, EngineError>
    where
        T: Send + 'static,
    {
        observe(
            &self.coordinator,
            &self.scheduler,
            &self.readers,
            region,
            fetch,
            dispatch,
            initial,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_in_memory_paths() {
        assert!(matches!(
            Database::open(":memory:"),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(Database::open(""), Err(EngineError::Config(_))));
    }
}
