//! Transaction lifecycle.
//!
//! States: NOT_STARTED -> ACTIVE -> { PREPARED -> } COMMITTED_IN_MEMORY ->
//! NOT_STARTED. Commit assigns the serialization number, files the update
//! log into its segment's history list (the durability point), and only then
//! cleans up the insert log; a crash in between still finds the insert log
//! and rolls the transaction back.
//!
//! Any error past the durability point poisons the whole system: the
//! embedding process must treat [`QuarryError::FatalState`] as unrecoverable.

use quarry_error::{QuarryError, Result};
use quarry_types::{RollPtr, RsegId, TrxId, TrxNo, UndoNo};

use crate::row_undo::{RowUndoNode, StepOutcome};
use crate::sys::TransactionSystem;
use crate::undo_log::{UndoKind, UndoLog};
use crate::undo_rec::UndoRec;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    NotStarted,
    Active,
    Prepared,
    CommittedInMemory,
}

impl TrxState {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Active => "ACTIVE",
            Self::Prepared => "PREPARED",
            Self::CommittedInMemory => "COMMITTED_IN_MEMORY",
        }
    }
}

/// A point within a transaction that a partial rollback can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    pub undo_no: UndoNo,
}

/// Typed notification emitted by the lifecycle coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitEvent {
    Committed {
        trx_id: TrxId,
        /// Serialization number; `None` for a read-only commit.
        trx_no: Option<TrxNo>,
    },
    RolledBack {
        trx_id: TrxId,
        /// Undo-number floor the rollback stopped at; zero for a full
        /// rollback.
        to: UndoNo,
    },
    Prepared {
        trx_id: TrxId,
    },
}

/// One transaction's mutable state, owned by its client task.
#[derive(Debug)]
pub struct Trx {
    pub id: TrxId,
    pub state: TrxState,
    /// Serialization number, assigned at commit.
    pub no: Option<TrxNo>,
    /// Rollback segment assigned at start (round-robin).
    pub rseg_id: RsegId,
    /// Next undo number to hand out.
    pub undo_no: UndoNo,
    /// Floor for an in-progress rollback; records below it stay applied.
    pub roll_limit: UndoNo,
    pub insert_undo: Option<UndoLog>,
    pub update_undo: Option<UndoLog>,
    pub xid: Option<Vec<u8>>,
}

impl Trx {
    /// Take the next undo number.
    pub(crate) fn next_undo_no(&mut self) -> UndoNo {
        let n = self.undo_no;
        self.undo_no = n.next();
        n
    }

    /// Capture the current position for a later partial rollback.
    #[must_use]
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            undo_no: self.undo_no,
        }
    }

    pub(crate) fn require_state(&self, required: TrxState) -> Result<()> {
        if self.state == required {
            Ok(())
        } else {
            Err(QuarryError::InvalidTrxState {
                trx_id: self.id,
                state: self.state.name(),
                required: required.name(),
            })
        }
    }

    fn has_undo(&self) -> bool {
        self.insert_undo.is_some() || self.update_undo.is_some()
    }
}

impl TransactionSystem {
    /// Start a transaction: allocate an id, pick a rollback segment
    /// round-robin, and register it in the active table.
    pub fn begin(&self) -> Result<Trx> {
        self.ensure_usable()?;
        let id = self.alloc_trx_id()?;
        let rseg_id = self.pick_rseg();
        self.trx_table.lock().active.insert(id);
        tracing::debug!(trx_id = %id, rseg = %rseg_id, "transaction started");
        Ok(Trx {
            id,
            state: TrxState::Active,
            no: None,
            rseg_id,
            undo_no: UndoNo::ZERO,
            roll_limit: UndoNo::ZERO,
            insert_undo: None,
            update_undo: None,
            xid: None,
        })
    }

    /// Append an undo record for `trx`, assigning a log of the right kind
    /// on first use.
    ///
    /// The record's `undo_no` must come from [`Trx::next_undo_no`]; the
    /// write path in `dml` is the only caller.
    pub(crate) fn append_undo(
        &self,
        trx: &mut Trx,
        kind: UndoKind,
        rec: &UndoRec,
    ) -> Result<RollPtr> {
        let rseg = self.rseg(trx.rseg_id);
        let slot = match kind {
            UndoKind::Insert => &mut trx.insert_undo,
            UndoKind::Update => &mut trx.update_undo,
        };
        if slot.is_none() {
            *slot = Some(rseg.assign_log(&self.space, kind, trx.id)?);
        }
        let log = slot.as_mut().ok_or_else(|| QuarryError::FatalState {
            detail: "undo log vanished after assignment".into(),
        })?;
        rseg.append(&self.space, log, rec)
    }

    /// Persist the XA identifier and move to PREPARED.
    ///
    /// A durability point: after it, only commit or rollback are legal.
    pub fn prepare(&self, trx: &mut Trx, xid: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        trx.require_state(TrxState::Active)?;
        if let Some(log) = trx.insert_undo.as_mut() {
            log.set_prepared(&self.space, xid)?;
        }
        if let Some(log) = trx.update_undo.as_mut() {
            log.set_prepared(&self.space, xid)?;
        }
        trx.xid = Some(xid.to_vec());
        trx.state = TrxState::Prepared;
        tracing::debug!(trx_id = %trx.id, "transaction prepared");
        self.emit(CommitEvent::Prepared { trx_id: trx.id });
        Ok(())
    }

    /// Commit `trx`.
    ///
    /// Ordering rule: the serialization number is assigned and the update
    /// log filed into history while `trx` still occupies the serializing
    /// set, so no transaction that could observe its effects receives a
    /// smaller number.
    pub fn commit(&self, trx: &mut Trx) -> Result<CommitEvent> {
        self.ensure_usable()?;
        if !matches!(trx.state, TrxState::Active | TrxState::Prepared) {
            return Err(QuarryError::InvalidTrxState {
                trx_id: trx.id,
                state: trx.state.name(),
                required: "ACTIVE or PREPARED",
            });
        }

        // Read-only fast path.
        if !trx.has_undo() {
            self.trx_table.lock().active.remove(&trx.id);
            trx.state = TrxState::NotStarted;
            let event = CommitEvent::Committed {
                trx_id: trx.id,
                trx_no: None,
            };
            self.emit(event.clone());
            return Ok(event);
        }

        let rseg = self.rseg(trx.rseg_id);
        trx.state = TrxState::CommittedInMemory;

        // Durability point: the update log enters the history list. The
        // serialization number is assigned under the segment's commit-order
        // mutex, as one unit with the history insertion.
        let trx_no = match trx.update_undo.take() {
            Some(log) => {
                match rseg.finish_log_ordered(&self.space, log, || self.alloc_serialization_no()) {
                    Ok((no, _)) => no,
                    Err(err) => {
                        return Err(self.poison(format!(
                            "commit of {} failed at the durability point: {err}",
                            trx.id
                        )));
                    }
                }
            }
            None => self.alloc_serialization_no(),
        };
        trx.no = Some(trx_no);
        // Past the durability point nothing may fail.
        if let Some(log) = trx.insert_undo.take() {
            if let Err(err) = rseg.finish_log(&self.space, log, None) {
                return Err(self.poison(format!(
                    "insert-undo cleanup of committed {} failed: {err}",
                    trx.id
                )));
            }
        }

        {
            let mut table = self.trx_table.lock();
            table.serializing.remove(&trx_no);
            table.active.remove(&trx.id);
        }
        trx.state = TrxState::NotStarted;
        tracing::debug!(trx_id = %trx.id, trx_no = %trx_no, "transaction committed");
        let event = CommitEvent::Committed {
            trx_id: trx.id,
            trx_no: Some(trx_no),
        };
        self.emit(event.clone());
        Ok(event)
    }

    /// Roll `trx` back, fully or to `savepoint`, running the row undo
    /// machine to completion.
    ///
    /// Once started the rollback always runs to its floor; there is no
    /// cancellation point that would leave a half-undone scope.
    pub fn rollback(&self, trx: &mut Trx, savepoint: Option<Savepoint>) -> Result<CommitEvent> {
        self.ensure_usable()?;
        if !matches!(trx.state, TrxState::Active | TrxState::Prepared) {
            return Err(QuarryError::InvalidTrxState {
                trx_id: trx.id,
                state: trx.state.name(),
                required: "ACTIVE or PREPARED",
            });
        }
        let limit = savepoint.map_or(UndoNo::ZERO, |s| s.undo_no);
        trx.roll_limit = limit;

        let mut node = RowUndoNode::new();
        loop {
            match crate::row_undo::row_undo_step(self, trx, &mut node) {
                Ok(StepOutcome::MoreWork) => {}
                Ok(StepOutcome::Finished) => break,
                Err(err) if err.is_resource_exhaustion() => {
                    // The reversal shares the original operation's
                    // atomicity domain; it must not fail.
                    return Err(self.poison(format!(
                        "rollback of {} ran out of space: {err}",
                        trx.id
                    )));
                }
                Err(err) => return Err(err),
            }
        }

        let partial = limit > UndoNo::ZERO;
        if partial {
            trx.undo_no = limit;
            trx.roll_limit = UndoNo::ZERO;
            tracing::debug!(trx_id = %trx.id, to = %limit, "partial rollback complete");
        } else {
            let rseg = self.rseg(trx.rseg_id);
            // Emptied logs never enter history; there is nothing to purge.
            if let Some(log) = trx.update_undo.take() {
                rseg.finish_log(&self.space, log, None)?;
            }
            if let Some(log) = trx.insert_undo.take() {
                rseg.finish_log(&self.space, log, None)?;
            }
            self.trx_table.lock().active.remove(&trx.id);
            trx.state = TrxState::NotStarted;
            trx.undo_no = UndoNo::ZERO;
            trx.roll_limit = UndoNo::ZERO;
            tracing::debug!(trx_id = %trx.id, "rollback complete");
        }
        let event = CommitEvent::RolledBack {
            trx_id: trx.id,
            to: limit,
        };
        self.emit(event.clone());
        Ok(event)
    }
}
