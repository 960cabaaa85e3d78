//! Primary error type for QuarryDB MVCC operations.
//!
//! The taxonomy follows the engine's recovery semantics rather than the call
//! site: *resource exhaustion* is recoverable before a commit's durability
//! point and fatal after it; *consistency violations* are hard errors on the
//! read path and degrade to "already resolved" on maintenance paths;
//! *corruption* degrades to "no evidence" in the narrow documented cases.

use thiserror::Error;

use quarry_types::{RsegId, TableId, TrxId};

/// Primary error type for QuarryDB operations.
#[derive(Error, Debug)]
pub enum QuarryError {
    // === Resource exhaustion ===
    /// The undo tablespace cannot grow any further.
    #[error("undo tablespace is full")]
    TablespaceFull,

    /// A rollback segment reached its configured maximum size.
    #[error("rollback segment {rseg} is out of space")]
    RsegOutOfSpace { rseg: RsegId },

    /// Every undo-log slot of a rollback segment is occupied.
    #[error("no free undo-log slot in rollback segment {rseg}")]
    UndoSlotsExhausted { rseg: RsegId },

    /// The transaction id counter reached the end of its domain.
    #[error("transaction id space exhausted")]
    TrxIdExhausted,

    // === Consistency violations ===
    /// A version-chain walk reached an undo record that has already been
    /// purged. Hard error on the consistent-read path.
    #[error("missing history: undo record at roll_ptr {roll_ptr:#x} already purged")]
    MissingHistory { roll_ptr: u64 },

    /// An undo record failed to parse or referenced an impossible location.
    #[error("corrupt undo record: {detail}")]
    CorruptUndo { detail: String },

    /// An on-page structure failed a sanity check.
    #[error("corrupt page {page}: {detail}")]
    CorruptPage { page: u32, detail: String },

    // === Lifecycle misuse ===
    /// The engine configuration is unusable as given.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    /// An operation was applied to a transaction in the wrong state.
    #[error("transaction {trx_id} is {state}, operation requires {required}")]
    InvalidTrxState {
        trx_id: TrxId,
        state: &'static str,
        required: &'static str,
    },

    /// A duplicate primary key was inserted.
    #[error("duplicate key in table {table}")]
    DuplicateKey { table: TableId },

    /// A row expected by the write path does not exist.
    #[error("row not found in table {table}")]
    RowNotFound { table: TableId },

    /// A referenced table is not registered in the store.
    #[error("no such table: {table}")]
    NoSuchTable { table: TableId },

    /// An update assigned to a primary-key column. Key changes are a
    /// delete plus an insert at the client layer.
    #[error("primary-key columns of table {table} cannot be updated in place")]
    ImmutableKey { table: TableId },

    // === Contention ===
    /// The pessimistic delete path was retried to its bound and still could
    /// not proceed.
    #[error("pessimistic operation failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    // === Post-durability failures ===
    /// An error occurred past a commit's durability point. The transaction
    /// system is poisoned; the embedding process must abort, because the
    /// on-disk state can no longer be made consistent by this library.
    #[error("fatal engine state: {detail}")]
    FatalState { detail: String },
}

impl QuarryError {
    /// Whether the embedding process must treat this error as fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalState { .. })
    }

    /// Whether the caller may retry the operation after freeing resources.
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::TablespaceFull
                | Self::RsegOutOfSpace { .. }
                | Self::UndoSlotsExhausted { .. }
                | Self::TrxIdExhausted
        )
    }

    /// Whether this error reports a broken cross-structure invariant.
    #[must_use]
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            Self::MissingHistory { .. } | Self::CorruptUndo { .. } | Self::CorruptPage { .. }
        )
    }
}

/// Convenience alias used across the engine crates.
pub type Result<T> = std::result::Result<T, QuarryError>;
