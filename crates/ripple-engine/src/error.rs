use ripple_core::CommitVeto;

/// Errors surfaced by the write path and the read scheduler.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Engine-native failure, surfaced verbatim so callers keep the SQLite
    /// result code.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// An observer vetoed the commit; the transaction was rolled back and
    /// the veto is the authoritative error.
    #[error("commit vetoed: {0}")]
    CommitVetoed(#[from] CommitVeto),

    /// The observation handle was cancelled before the result could be
    /// delivered.
    #[error("observation cancelled")]
    Cancelled,

    /// The database cannot support the requested mode of operation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::CommitVetoed(_) => "commit_vetoed",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_names_every_variant() {
        assert_eq!(
            EngineError::from(rusqlite::Error::InvalidQuery).error_kind(),
            "sqlite"
        );
        assert_eq!(
            EngineError::from(CommitVeto::new("no")).error_kind(),
            "commit_vetoed"
        );
        assert_eq!(EngineError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            EngineError::Config("bad path".into()).error_kind(),
            "config"
        );
    }
}
