use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use ripple_engine::EngineError;

/// Pool of read-only connections against the writer's WAL database.
///
/// WAL readers run against a stable snapshot: they neither block nor are
/// blocked by the writer, and a read transaction opened after a commit sees
/// at least that commit. Connections are opened lazily, checked out per
/// fetch, and returned afterwards.
#[derive(Clone)]
pub struct ReaderPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                path: path.to_owned(),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run `f` with a pooled read-only connection.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let conn = self.checkout()?;
        let result = f(&conn);
        self.inner.idle.lock().push(conn);
        result
    }

    fn checkout(&self) -> Result<Connection, EngineError> {
        if let Some(conn) = self.inner.idle.lock().pop() {
            return Ok(conn);
        }
        let conn = Connection::open_with_flags(
            &self.inner.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(
            "PRAGMA query_only = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ripple-pool-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE t (id INTEGER PRIMARY KEY);
             INSERT INTO t (id) VALUES (1);",
        )
        .unwrap();
        path
    }

    #[test]
    fn reads_and_recycles_connections() {
        let pool = ReaderPool::new(&temp_db());
        let count: i64 = pool
            .with(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(pool.idle_count(), 1);
        // Reused, not reopened.
        pool.with(|_| Ok(())).unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn connections_are_read_only() {
        let pool = ReaderPool::new(&temp_db());
        let result = pool.with(|conn| {
            conn.execute("INSERT INTO t (id) VALUES (2)", [])?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
