/// Error raised by an observer's `will_commit` callback to veto a commit.
///
/// A veto forces the transaction to roll back; the veto is then re-raised
/// to the caller of the write as the authoritative error.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{reason}")]
pub struct CommitVeto {
    reason: String,
}

impl CommitVeto {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
