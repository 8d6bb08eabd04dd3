use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;

use ripple_core::{ChangeEvent, EventKind, ObserverExtent, Region, TransactionObserver};
use ripple_engine::{EngineError, ObserverId, TransactionCoordinator};

use crate::pool::ReaderPool;
use crate::scheduler::ReadScheduler;

/// What to deliver before the first change lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialDispatch {
    /// No value until the watched region first changes.
    None,
    /// Fetch on the calling thread and dispatch before `observe` returns.
    Immediate,
    /// Queue a fetch so the first value arrives asynchronously, ahead of any
    /// value produced by a later commit.
    Deferred,
}

/// Everything a scheduled fetch needs to outlive the watcher registration.
struct WatchCore<T> {
    cancelled: Arc<AtomicBool>,
    scheduler: ReadScheduler,
    pool: ReaderPool,
    fetch: Box<dyn Fn(&Connection) -> Result<T, EngineError> + Send + Sync>,
    dispatch: Mutex<Box<dyn FnMut(Result<T, EngineError>) + Send>>,
}

impl<T: Send + 'static> WatchCore<T> {
    /// Queue one fetch-and-dispatch round. The cancellation flag is checked
    /// again on the delivery side so a value fetched before `cancel` never
    /// reaches the dispatch closure after it.
    fn schedule_fetch(self: &Arc<Self>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let fetch_core = Arc::clone(self);
        let deliver_core = Arc::clone(self);
        self.scheduler.schedule(
            move || {
                if fetch_core.cancelled.load(Ordering::Acquire) {
                    return Err(EngineError::Cancelled);
                }
                fetch_core.pool.with(|conn| (fetch_core.fetch)(conn))
            },
            move |result| {
                if deliver_core.cancelled.load(Ordering::Acquire) {
                    return;
                }
                (deliver_core.dispatch.lock())(result);
            },
        );
    }

    fn dispatch_now(&self, result: Result<T, EngineError>) {
        (self.dispatch.lock())(result);
    }
}

/// Transaction observer that tracks whether the current transaction touched
/// the watched region and queues a fresh fetch on commit.
struct RegionWatcher<T> {
    region: Region,
    dirty: bool,
    core: Arc<WatchCore<T>>,
}

impl<T: Send + 'static> TransactionObserver for RegionWatcher<T> {
    fn observes(&self, kind: &EventKind) -> bool {
        self.region.observes(kind)
    }

    fn changed(&mut self, event: &ChangeEvent) {
        if self.region.impacts(event) {
            self.dirty = true;
        }
    }

    fn committed(&mut self) {
        if self.dirty {
            self.dirty = false;
            self.core.schedule_fetch();
        }
    }

    fn rolled_back(&mut self) {
        self.dirty = false;
    }
}

/// Watch `region` on a writer's coordinator: after every commit that touched
/// the region, `fetch` runs against a pooled reader and `dispatch` receives
/// the result, in commit order.
///
/// Dropping the returned handle (or calling [`WatchHandle::cancel`]) stops
/// the watch and discards in-flight fetches.
pub fn observe<T>(
    coordinator: &Arc<Mutex<TransactionCoordinator>>,
    scheduler: &ReadScheduler,
    pool: &ReaderPool,
    region: Region,
    fetch: impl Fn(&Connection) -> Result<T, EngineError> + Send + Sync + 'static,
    dispatch: impl FnMut(Result<T, EngineError>) + Send + 'static,
    initial: InitialDispatch,
) -> Result<WatchHandle, EngineError>
where
    T: Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let core = Arc::new(WatchCore {
        cancelled: Arc::clone(&cancelled),
        scheduler: scheduler.clone(),
        pool: pool.clone(),
        fetch: Box::new(fetch),
        dispatch: Mutex::new(Box::new(dispatch)),
    });
    let watcher = RegionWatcher {
        region,
        dirty: false,
        core: Arc::clone(&core),
    };
    let id = coordinator
        .lock()
        .add_observer(Arc::new(Mutex::new(watcher)), ObserverExtent::ConnectionLifetime);
    match initial {
        InitialDispatch::None => {}
        InitialDispatch::Immediate => {
            let result = core.pool.with(|conn| (core.fetch)(conn));
            core.dispatch_now(result);
        }
        InitialDispatch::Deferred => core.schedule_fetch(),
    }
    Ok(WatchHandle {
        cancelled,
        coordinator: Arc::clone(coordinator),
        id,
    })
}

/// Keeps a watch registered; cancelling or dropping it unregisters the
/// observer and suppresses any fetch still in flight.
pub struct WatchHandle {
    cancelled: Arc<AtomicBool>,
    coordinator: Arc<Mutex<TransactionCoordinator>>,
    id: ObserverId,
}

impl WatchHandle {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(id = ?self.id, "watch cancelled");
        self.coordinator.lock().remove_observer(self.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_engine::WriterConnection;
    use std::path::PathBuf;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("ripple-watch-{}", uuid::Uuid::now_v7()))
            .join("test.db")
    }

    fn setup() -> (WriterConnection, ReaderPool) {
        let path = temp_path();
        let mut writer = WriterConnection::open(&path).unwrap();
        writer
            .execute(
                "CREATE TABLE player (id INTEGER PRIMARY KEY, name TEXT, score INTEGER)",
                [],
            )
            .unwrap();
        writer
            .execute("CREATE TABLE team (id INTEGER PRIMARY KEY, name TEXT)", [])
            .unwrap();
        let pool = ReaderPool::new(&path);
        (writer, pool)
    }

    fn player_count(conn: &Connection) -> Result<i64, EngineError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM player", [], |r| r.get(0))?)
    }

    fn recv(rx: &std_mpsc::Receiver<i64>) -> i64 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_dispatch_runs_before_observe_returns() {
        let (writer, pool) = setup();
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();
        let _handle = observe(
            &writer.coordinator(),
            &scheduler,
            &pool,
            Region::table("player"),
            player_count,
            move |result| tx.send(result.unwrap()).unwrap(),
            InitialDispatch::Immediate,
        )
        .unwrap();
        // Already in the channel, no waiting.
        assert_eq!(rx.try_recv().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commit_to_watched_region_schedules_a_fetch() {
        let (mut writer, pool) = setup();
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();
        let _handle = observe(
            &writer.coordinator(),
            &scheduler,
            &pool,
            Region::table("player"),
            player_count,
            move |result| tx.send(result.unwrap()).unwrap(),
            InitialDispatch::None,
        )
        .unwrap();

        writer
            .execute("INSERT INTO player (name, score) VALUES ('arthur', 10)", [])
            .unwrap();
        let observed = tokio::task::spawn_blocking(move || recv(&rx)).await.unwrap();
        assert_eq!(observed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commits_outside_the_region_are_silent() {
        let (mut writer, pool) = setup();
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();
        let _handle = observe(
            &writer.coordinator(),
            &scheduler,
            &pool,
            Region::table("player"),
            player_count,
            move |result| tx.send(result.unwrap()).unwrap(),
            InitialDispatch::None,
        )
        .unwrap();

        writer
            .execute("INSERT INTO team (name) VALUES ('reds')", [])
            .unwrap();
        writer
            .execute("INSERT INTO player (name, score) VALUES ('zelda', 3)", [])
            .unwrap();
        // Only the player insert produces a value.
        let observed = tokio::task::spawn_blocking(move || {
            let first = recv(&rx);
            let extra = rx.recv_timeout(Duration::from_millis(200));
            (first, extra.is_err())
        })
        .await
        .unwrap();
        assert_eq!(observed, (1, true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rollback_clears_pending_dirtiness() {
        let (mut writer, pool) = setup();
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();
        let _handle = observe(
            &writer.coordinator(),
            &scheduler,
            &pool,
            Region::table("player"),
            player_count,
            move |result| tx.send(result.unwrap()).unwrap(),
            InitialDispatch::None,
        )
        .unwrap();

        writer.begin(ripple_engine::TransactionKind::Deferred).unwrap();
        writer
            .execute("INSERT INTO player (name, score) VALUES ('ghost', 0)", [])
            .unwrap();
        writer.rollback().unwrap();

        let silent = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(Duration::from_millis(200)).is_err()
        })
        .await
        .unwrap();
        assert!(silent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_unregisters_and_suppresses_dispatch() {
        let (mut writer, pool) = setup();
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel::<i64>();
        let handle = observe(
            &writer.coordinator(),
            &scheduler,
            &pool,
            Region::table("player"),
            player_count,
            move |result| tx.send(result.unwrap()).unwrap(),
            InitialDispatch::None,
        )
        .unwrap();

        handle.cancel();
        assert_eq!(writer.coordinator().lock().observer_count(), 0);
        writer
            .execute("INSERT INTO player (name, score) VALUES ('late', 1)", [])
            .unwrap();
        let silent = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(Duration::from_millis(200)).is_err()
        })
        .await
        .unwrap();
        assert!(silent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn column_scoped_region_ignores_other_columns() {
        let (mut writer, pool) = setup();
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();
        let _handle = observe(
            &writer.coordinator(),
            &scheduler,
            &pool,
            Region::columns("player", ["score".to_string()]),
            |conn| {
                Ok(conn.query_row(
                    "SELECT COALESCE(MAX(score), 0) FROM player",
                    [],
                    |r| r.get::<_, i64>(0),
                )?)
            },
            move |result| tx.send(result.unwrap()).unwrap(),
            InitialDispatch::None,
        )
        .unwrap();

        writer
            .execute("INSERT INTO player (name, score) VALUES ('eve', 5)", [])
            .unwrap();
        let (first, rx) = tokio::task::spawn_blocking(move || (recv(&rx), rx))
            .await
            .unwrap();
        assert_eq!(first, 5);

        // Renames do not touch the watched column.
        writer
            .execute("UPDATE player SET name = 'eva' WHERE id = 1", [])
            .unwrap();
        writer
            .execute("UPDATE player SET score = 9 WHERE id = 1", [])
            .unwrap();
        let observed = tokio::task::spawn_blocking(move || {
            let next = recv(&rx);
            let extra = rx.recv_timeout(Duration::from_millis(200));
            (next, extra.is_err())
        })
        .await
        .unwrap();
        assert_eq!(observed, (9, true));
    }
}
