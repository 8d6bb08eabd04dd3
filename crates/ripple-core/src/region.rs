use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::event::{ChangeEvent, ChangeKind, EventKind};

/// A declarative set of `(table, columns | all)` pairs.
///
/// Regions decide whether a change event impacts a tracked query. They
/// never influence SQL semantics. Table and column names are normalized to
/// lowercase on construction.
///
/// Inserts and deletes impact a table regardless of column selection (the
/// row as a whole appears or vanishes); updates are filtered against the
/// selected columns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    tables: BTreeMap<String, ColumnSet>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ColumnSet {
    All,
    Columns(BTreeSet<String>),
}

impl Region {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A whole table, every column.
    pub fn table(name: impl Into<String>) -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(name.into().to_lowercase(), ColumnSet::All);
        Self { tables }
    }

    /// Specific columns of one table.
    pub fn columns(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = String>,
    ) -> Self {
        let set: BTreeSet<String> = columns.into_iter().map(|c| c.to_lowercase()).collect();
        let mut tables = BTreeMap::new();
        tables.insert(name.into().to_lowercase(), ColumnSet::Columns(set));
        Self { tables }
    }

    /// Set union; `All` absorbs any column list for the same table.
    pub fn union(mut self, other: Region) -> Region {
        for (table, cols) in other.tables {
            match self.tables.get_mut(&table) {
                None => {
                    self.tables.insert(table, cols);
                }
                Some(existing) => match (existing, cols) {
                    (ColumnSet::All, _) => {}
                    (existing @ ColumnSet::Columns(_), ColumnSet::All) => {
                        *existing = ColumnSet::All;
                    }
                    (ColumnSet::Columns(mine), ColumnSet::Columns(theirs)) => {
                        mine.extend(theirs);
                    }
                },
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Would events of this kind ever intersect the region?
    pub fn observes(&self, kind: &EventKind) -> bool {
        let Some(cols) = self.tables.get(kind.table()) else {
            return false;
        };
        match kind {
            EventKind::Insert { .. } | EventKind::Delete { .. } => true,
            EventKind::Update { columns, .. } => match cols {
                ColumnSet::All => true,
                // An empty column list means the statement's columns are
                // unknown; assume intersection.
                ColumnSet::Columns(selected) => {
                    columns.is_empty() || columns.iter().any(|c| selected.contains(c))
                }
            },
        }
    }

    /// Does this concrete event touch the region?
    pub fn impacts(&self, event: &ChangeEvent) -> bool {
        let Some(cols) = self.tables.get(&event.table) else {
            return false;
        };
        match event.kind {
            ChangeKind::Insert | ChangeKind::Delete => true,
            ChangeKind::Update => match cols {
                ColumnSet::All => true,
                ColumnSet::Columns(selected) => {
                    event.changed_columns.is_empty()
                        || event.changed_columns.iter().any(|c| selected.contains(c))
                }
            },
        }
    }
}
