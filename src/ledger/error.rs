use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("malformed event: {reason}")]
    MalformedEvent { reason: String },
    #[error("authoritative balance missing or not a finite number")]
    MissingAuthoritativeBalance,
    #[error("insertion index {index} breaks chronological order (ledger len {len})")]
    OutOfRangeInsertion { index: usize, len: usize },
    #[error("bulk load from epoch {ticket_epoch} is stale (current epoch {current_epoch})")]
    StaleLoad {
        ticket_epoch: u64,
        current_epoch: u64,
    },
}

impl LedgerError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        LedgerError::MalformedEvent {
            reason: reason.into(),
        }
    }
}
