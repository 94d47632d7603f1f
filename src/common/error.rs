use thiserror::Error;

use super::types::{RecordId, TxnId};

/// Why the lock manager forced a transaction into the aborted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Lock requested after the transaction entered its shrinking phase
    LockOnShrinking,
    /// Unlock of a lock the transaction does not hold
    UnlockOnNonHeld,
    /// Shared lock requested under READ_UNCOMMITTED
    LockSharedOnReadUncommitted,
    /// A second transaction tried to upgrade on the same record
    UpgradeConflict,
    /// Chosen as the victim of a deadlock cycle
    Deadlock,
}

/// Database error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer pool is full, no evictable frames available")]
    BufferPoolFull,

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error("Tuple of {tuple_size} bytes does not fit in {available} bytes of page space")]
    TupleTooLarge { tuple_size: usize, available: usize },

    #[error("Invalid slot ID: {0}")]
    InvalidSlotId(u16),

    #[error("Slot {0} is empty")]
    EmptySlot(u16),

    #[error("Tuple {0} not found")]
    TupleNotFound(RecordId),

    #[error("Transaction {txn_id} aborted: {reason:?}")]
    TransactionAborted { txn_id: TxnId, reason: AbortReason },
}

pub type Result<T> = std::result::Result<T, KeelError>;

impl KeelError {
    /// True when the error carries a deadlock-victim or state-machine abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, KeelError::TransactionAborted { .. })
    }
}
