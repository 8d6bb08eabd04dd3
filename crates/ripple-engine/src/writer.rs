use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::hooks::{Action, AuthAction, AuthContext, Authorization};
use rusqlite::Connection;
use tracing::{info, warn};

use ripple_core::{ChangeKind, ObserverExtent, TransactionObserver};

use crate::coordinator::{Notification, TransactionCoordinator, TransactionState};
use crate::error::EngineError;
use crate::registry::ObserverId;
use crate::statement::{StatementKind, TransactionKind};

/// The single write connection, with engine hooks bridged into the
/// transaction coordinator.
///
/// Exactly one execution context may drive a `WriterConnection`; all
/// coordinator, savepoint-stack, and registry mutation happens synchronously
/// on it. Every statement executed through [`execute`](Self::execute) is
/// classified and bracketed so the coordinator can track transaction and
/// savepoint nesting.
pub struct WriterConnection {
    conn: Connection,
    coordinator: Arc<Mutex<TransactionCoordinator>>,
    path: PathBuf,
    /// Per-SQL classification cache; statements are typically reused.
    /// Invalidated when DDL bumps the schema generation.
    classified: HashMap<String, StatementKind>,
    schema_generation_seen: u64,
}

impl WriterConnection {
    /// Open or create the database at `path` in WAL mode and install the
    /// change/commit/rollback hooks.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Config(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        info!(path = %path.display(), "writer connection opened");
        Ok(Self::with_connection(conn, path.to_owned()))
    }

    /// In-memory database (coordinator-level tests; snapshot reads need a
    /// file-backed database).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::with_connection(conn, PathBuf::from(":memory:")))
    }

    fn with_connection(conn: Connection, path: PathBuf) -> Self {
        let coordinator = Arc::new(Mutex::new(TransactionCoordinator::new()));
        install_hooks(&conn, &coordinator);
        Self {
            conn,
            coordinator,
            path,
            classified: HashMap::new(),
            schema_generation_seen: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle to the coordinator, for observation entry points that
    /// live off the writer thread (registration, cancellation).
    pub fn coordinator(&self) -> Arc<Mutex<TransactionCoordinator>> {
        Arc::clone(&self.coordinator)
    }

    pub fn add_observer(
        &self,
        observer: impl TransactionObserver + 'static,
        extent: ObserverExtent,
    ) -> ObserverId {
        self.coordinator
            .lock()
            .add_observer(Arc::new(Mutex::new(observer)), extent)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.coordinator.lock().remove_observer(id)
    }

    pub fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.coordinator.lock().state()
    }

    /// Execute one statement, bracketed by coordinator bookkeeping.
    ///
    /// Change, commit, and rollback notifications captured during execution
    /// are delivered before this returns, in event order, with the
    /// coordinator lock released.
    pub fn execute<P: rusqlite::Params>(
        &mut self,
        sql: &str,
        params: P,
    ) -> Result<usize, EngineError> {
        let stmt = self.classify(sql);
        self.coordinator.lock().statement_will_execute(&stmt);
        match self.conn.execute(sql, params) {
            Ok(rows) => {
                let autocommit = self.conn.is_autocommit();
                let notifications = self
                    .coordinator
                    .lock()
                    .statement_did_execute(&stmt, autocommit);
                if stmt == StatementKind::SchemaChange {
                    self.classified.clear();
                }
                deliver(notifications);
                Ok(rows)
            }
            Err(err) => {
                let autocommit = self.conn.is_autocommit();
                let (notifications, veto) =
                    self.coordinator.lock().statement_did_fail(&stmt, autocommit);
                deliver(notifications);
                match veto {
                    Some(veto) => Err(EngineError::CommitVetoed(veto)),
                    None => Err(err.into()),
                }
            }
        }
    }

    /// Untracked read on the write connection.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T, EngineError>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn.query_row(sql, params, f)?)
    }

    pub fn begin(&mut self, kind: TransactionKind) -> Result<(), EngineError> {
        self.execute(kind.sql(), [])?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), EngineError> {
        self.execute("COMMIT", [])?;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), EngineError> {
        self.execute("ROLLBACK", [])?;
        Ok(())
    }

    /// Run `f` inside a deferred transaction, committing on `Ok` and
    /// rolling back on `Err`.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.transaction_with(TransactionKind::Deferred, f)
    }

    /// [`transaction`](Self::transaction) with an explicit locking kind.
    ///
    /// The engine may already have rolled back after a failed statement
    /// (error-class dependent); the autocommit flag decides whether an
    /// explicit ROLLBACK is still required. A rollback failure never
    /// shadows the original error.
    pub fn transaction_with<T>(
        &mut self,
        kind: TransactionKind,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.begin(kind)?;
        match f(self) {
            Ok(value) => match self.commit() {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.rollback_if_needed();
                    Err(err)
                }
            },
            Err(err) => {
                self.rollback_if_needed();
                Err(err)
            }
        }
    }

    fn rollback_if_needed(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(rollback_err) = self.rollback() {
                warn!(
                    kind = rollback_err.error_kind(),
                    error = %rollback_err,
                    "rollback after failed transaction also failed"
                );
            }
        }
    }

    fn classify(&mut self, sql: &str) -> StatementKind {
        let generation = self.coordinator.lock().schema_generation();
        if generation != self.schema_generation_seen {
            self.classified.clear();
            self.schema_generation_seen = generation;
        }
        if let Some(stmt) = self.classified.get(sql) {
            return stmt.clone();
        }
        let stmt = StatementKind::classify(sql);
        self.classified.insert(sql.to_string(), stmt.clone());
        stmt
    }
}

fn deliver(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.deliver();
    }
}

fn change_kind(action: Action) -> Option<ChangeKind> {
    match action {
        Action::SQLITE_INSERT => Some(ChangeKind::Insert),
        Action::SQLITE_UPDATE => Some(ChangeKind::Update),
        Action::SQLITE_DELETE => Some(ChangeKind::Delete),
        _ => None,
    }
}

fn install_hooks(conn: &Connection, coordinator: &Arc<Mutex<TransactionCoordinator>>) {
    let coord = Arc::clone(coordinator);
    conn.update_hook(Some(
        move |action: Action, _db: &str, table: &str, row_id: i64| {
            let Some(kind) = change_kind(action) else {
                return;
            };
            // Lock only to classify/buffer; callbacks run after release.
            let notification = coord.lock().row_changed(kind, table, row_id);
            if let Some(notification) = notification {
                notification.deliver();
            }
        },
    ));

    let coord = Arc::clone(coordinator);
    conn.commit_hook(Some(move || coord.lock().engine_will_commit()));

    let coord = Arc::clone(coordinator);
    conn.rollback_hook(Some(move || coord.lock().engine_did_rollback()));

    // DELETE without WHERE normally takes SQLite's truncate path, which
    // skips per-row update hooks. Ignoring the authorizer request forces
    // the row-by-row plan so deletions stay observable.
    conn.authorizer(Some(|ctx: AuthContext<'_>| match ctx.action {
        AuthAction::Delete { table_name } if !table_name.starts_with("sqlite_") => {
            Authorization::Ignore
        }
        _ => Authorization::Allow,
    }));

    #[cfg(feature = "preupdate")]
    install_preupdate_hook(conn, coordinator);
}

#[cfg(feature = "preupdate")]
fn install_preupdate_hook(conn: &Connection, coordinator: &Arc<Mutex<TransactionCoordinator>>) {
    use rusqlite::hooks::PreUpdateCase;
    use rusqlite::types::Value;

    use ripple_core::{PreUpdateEvent, SqlValue};

    fn convert(value: Value) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Integer(i),
            Value::Real(r) => SqlValue::Real(r),
            Value::Text(t) => SqlValue::Text(t),
            Value::Blob(b) => SqlValue::Blob(b),
        }
    }

    let coord = Arc::clone(coordinator);
    conn.preupdate_hook(Some(
        move |action: Action, _db: &str, table: &str, case: &PreUpdateCase| {
            let Some(kind) = change_kind(action) else {
                return;
            };
            let targets = coord.lock().pre_update_targets();
            if targets.is_empty() {
                return;
            }
            let (row_id, old_values, new_values) = match case {
                PreUpdateCase::Insert(new) => {
                    let count = new.get_column_count();
                    let values: Vec<_> = (0..count)
                        .filter_map(|i| new.get_new_column_value(i).ok())
                        .map(convert)
                        .collect();
                    (new.get_new_row_id(), None, Some(values))
                }
                PreUpdateCase::Delete(old) => {
                    let count = old.get_column_count();
                    let values: Vec<_> = (0..count)
                        .filter_map(|i| old.get_old_column_value(i).ok())
                        .map(convert)
                        .collect();
                    (old.get_old_row_id(), Some(values), None)
                }
                PreUpdateCase::Update {
                    old_value_accessor: old,
                    new_value_accessor: new,
                } => {
                    let count = old.get_column_count();
                    let old_values: Vec<_> = (0..count)
                        .filter_map(|i| old.get_old_column_value(i).ok())
                        .map(convert)
                        .collect();
                    let new_values: Vec<_> = (0..count)
                        .filter_map(|i| new.get_new_column_value(i).ok())
                        .map(convert)
                        .collect();
                    (old.get_old_row_id(), Some(old_values), Some(new_values))
                }
                _ => return,
            };
            let event = PreUpdateEvent {
                kind,
                table: table.to_lowercase(),
                row_id,
                old_values,
                new_values,
            };
            for observer in targets {
                observer.lock().will_change(&event);
            }
        },
    ));
}
