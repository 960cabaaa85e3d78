//! Undo-log-based MVCC engine for QuarryDB.
//!
//! This crate implements the multi-version concurrency control machinery of
//! the storage engine:
//!
//! - [`mtr`]: the scoped atomic page-modification unit over the undo
//!   tablespace.
//! - [`undo_rec`] / [`undo_log`]: the per-transaction append-only undo logs
//!   and their record codec.
//! - [`rseg`]: rollback segments, their slot tables, and history lists.
//! - [`trx`] / [`dml`]: the transaction lifecycle coordinator and the row
//!   write path that reports every change into the undo log.
//! - [`row_undo`]: the resumable rollback state machine.
//! - [`purge`] / [`row_purge`]: the background reclamation of obsolete row
//!   versions in commit order.
//! - [`versions`]: the version-chain walker used by snapshot reads, purge
//!   safety checks, and implicit-lock detection.
//! - [`sys`]: the explicitly constructed [`TransactionSystem`] context that
//!   owns all of the above.

pub mod dml;
pub mod index;
pub mod mtr;
pub mod purge;
pub mod row_purge;
pub mod row_undo;
pub mod rseg;
pub mod sys;
pub mod trx;
pub mod undo_log;
pub mod undo_rec;
pub mod versions;
pub mod view;

pub use dml::ColumnChange;
pub use index::{ClusteredRec, DeleteOutcome, IndexDef, RecHdr, SecRec, Table, TableSchema, TableStore};
pub use mtr::{Mtr, UndoTablespace, PAGE_SIZE};
pub use purge::{PurgeScheduler, PurgeSys};
pub use row_purge::{row_purge_step, PurgeOutcome};
pub use row_undo::{row_undo_step, RowUndoNode, StepOutcome};
pub use rseg::{HistoryEntry, Rseg};
pub use sys::{MvccConfig, RecoveryReport, TransactionSystem};
pub use trx::{CommitEvent, Savepoint, Trx, TrxState};
pub use undo_log::{SegQuota, TopRec, UndoKind, UndoLog, UndoState};
pub use undo_rec::{PrevInfo, UndoRec, UndoRecKind};
pub use versions::{
    build_for_consistent_read, implicit_lock_holder, old_has_index_entry, read_row, RowVersion,
};
pub use view::ReadView;
