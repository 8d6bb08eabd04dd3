use serde::{Deserialize, Serialize};

/// The three row-level mutations SQLite can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row mutation, as reported by the engine's update hook.
///
/// Table and column names are stored lowercase (SQLite identifiers are
/// case-insensitive). The event handed to observer callbacks borrows from
/// the notification path; observers that retain it past the callback must
/// clone it. Buffered events are always owned clones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub row_id: i64,
    /// Columns named in the statement's SET list. Populated for updates
    /// only; empty means "unknown, assume any column".
    pub changed_columns: Vec<String>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row_id: i64) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: lowercase(table),
            row_id,
            changed_columns: Vec::new(),
        }
    }

    pub fn delete(table: impl Into<String>, row_id: i64) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: lowercase(table),
            row_id,
            changed_columns: Vec::new(),
        }
    }

    pub fn update(
        table: impl Into<String>,
        row_id: i64,
        changed_columns: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: lowercase(table),
            row_id,
            changed_columns: changed_columns
                .into_iter()
                .map(|c| c.to_lowercase())
                .collect(),
        }
    }

    /// True for SQLite's own bookkeeping tables, which are never observable.
    pub fn is_internal(&self) -> bool {
        self.table.starts_with("sqlite_")
    }
}

/// The kinds of events a statement could produce, used by observers to
/// declare interest without inspecting every event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert { table: String },
    Delete { table: String },
    Update { table: String, columns: Vec<String> },
}

impl EventKind {
    pub fn insert(table: impl Into<String>) -> Self {
        Self::Insert {
            table: lowercase(table),
        }
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Self::Delete {
            table: lowercase(table),
        }
    }

    pub fn update(
        table: impl Into<String>,
        columns: impl IntoIterator<Item = String>,
    ) -> Self {
        Self::Update {
            table: lowercase(table),
            columns: columns.into_iter().map(|c| c.to_lowercase()).collect(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table } | Self::Delete { table } | Self::Update { table, .. } => table,
        }
    }

    pub fn change_kind(&self) -> ChangeKind {
        match self {
            Self::Insert { .. } => ChangeKind::Insert,
            Self::Delete { .. } => ChangeKind::Delete,
            Self::Update { .. } => ChangeKind::Update,
        }
    }
}

/// Engine-independent mirror of SQLite's storage classes, used by the
/// optional pre-update event so that core stays free of the binding crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Before/after column values for a row about to be mutated.
///
/// Only produced when the `preupdate` feature is enabled and the engine
/// exposes the pre-update hook; observers opt in via
/// [`crate::TransactionObserver::wants_before_values`].
#[derive(Clone, Debug, PartialEq)]
pub struct PreUpdateEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub row_id: i64,
    /// Full row before the mutation (deletes and updates).
    pub old_values: Option<Vec<SqlValue>>,
    /// Full row after the mutation (inserts and updates).
    pub new_values: Option<Vec<SqlValue>>,
}

fn lowercase(name: impl Into<String>) -> String {
    let name = name.into();
    if name.chars().all(|c| !c.is_ascii_uppercase()) {
        name
    } else {
        name.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased() {
        let event = ChangeEvent::update("Player", 1, vec!["Score".to_string()]);
        assert_eq!(event.table, "player");
        assert_eq!(event.changed_columns, vec!["score"]);
    }

    #[test]
    fn internal_tables_detected() {
        assert!(ChangeEvent::insert("sqlite_sequence", 1).is_internal());
        assert!(!ChangeEvent::insert("player", 1).is_internal());
    }

    #[test]
    fn event_kind_accessors() {
        let kind = EventKind::update("T", vec!["A".to_string()]);
        assert_eq!(kind.table(), "t");
        assert_eq!(kind.change_kind(), ChangeKind::Update);
    }
}
