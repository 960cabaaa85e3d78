//! Row undo executor.
//!
//! A resumable state machine, one per in-progress rollback. Each step pops
//! the newest not-yet-undone record across the transaction's insert and
//! update logs (larger `undo_no` wins; an equal pair can only come from a
//! corrupted log and resolves to the update side, whose MODIFY path
//! revalidates roll pointers before acting) and reverses it. The machine
//! stops when `undo_no` falls below the rollback floor.
//!
//! MODIFY steps revalidate that the clustered record's roll pointer still
//! equals the one this record was installed under; a mismatch means another
//! actor already resolved the version and the step is a correct no-op.

use quarry_error::{QuarryError, Result};
use quarry_types::{RollPtr, Value};

use crate::index::ClusteredRec;
use crate::row_purge::physical_delete_sec;
use crate::sys::TransactionSystem;
use crate::trx::Trx;
use crate::undo_log::UndoKind;
use crate::undo_rec::UndoRec;

/// What a single call to [`row_undo_step`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The machine advanced; call again.
    MoreWork,
    /// Nothing left at or above the rollback floor.
    Finished,
}

#[derive(Debug)]
enum Phase {
    FetchNext,
    /// Reverse a fresh insert.
    Insert { rec: UndoRec, slot_ptr: RollPtr },
    /// Restore a pre-image or a delete-mark.
    Modify { rec: UndoRec, slot_ptr: RollPtr },
    Done,
}

/// Per-rollback execution state.
#[derive(Debug)]
pub struct RowUndoNode {
    phase: Phase,
    steps: u64,
}

impl RowUndoNode {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::FetchNext,
            steps: 0,
        }
    }

    /// Records reversed so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Default for RowUndoNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance a rollback by one state transition.
pub fn row_undo_step(
    sys: &TransactionSystem,
    trx: &mut Trx,
    node: &mut RowUndoNode,
) -> Result<StepOutcome> {
    match std::mem::replace(&mut node.phase, Phase::FetchNext) {
        Phase::FetchNext => fetch_next(sys, trx, node),
        Phase::Insert { rec, slot_ptr } => {
            undo_insert(sys, trx, &rec, slot_ptr)?;
            pop_record(sys, trx, UndoKind::Insert, &rec)?;
            node.steps += 1;
            Ok(StepOutcome::MoreWork)
        }
        Phase::Modify { rec, slot_ptr } => {
            undo_modify(sys, trx, &rec, slot_ptr)?;
            pop_record(sys, trx, UndoKind::Update, &rec)?;
            node.steps += 1;
            Ok(StepOutcome::MoreWork)
        }
        Phase::Done => {
            node.phase = Phase::Done;
            Ok(StepOutcome::Finished)
        }
    }
}

fn fetch_next(sys: &TransactionSystem, trx: &mut Trx, node: &mut RowUndoNode) -> Result<StepOutcome> {
    let ins_top = trx.insert_undo.as_ref().and_then(|log| log.top);
    let upd_top = trx.update_undo.as_ref().and_then(|log| log.top);
    let pick = match (ins_top, upd_top) {
        (None, None) => None,
        (Some(_), None) => Some(UndoKind::Insert),
        (None, Some(_)) => Some(UndoKind::Update),
        (Some(i), Some(u)) => {
            if i.undo_no > u.undo_no {
                Some(UndoKind::Insert)
            } else {
                Some(UndoKind::Update)
            }
        }
    };

    let Some(kind) = pick else {
        node.phase = Phase::Done;
        return Ok(StepOutcome::Finished);
    };
    let log = match kind {
        UndoKind::Insert => trx.insert_undo.as_ref(),
        UndoKind::Update => trx.update_undo.as_ref(),
    }
    .ok_or_else(|| QuarryError::FatalState {
        detail: "picked an absent undo log".into(),
    })?;
    let top = log.top.ok_or_else(|| QuarryError::FatalState {
        detail: "picked an empty undo log".into(),
    })?;
    if top.undo_no < trx.roll_limit {
        node.phase = Phase::Done;
        return Ok(StepOutcome::Finished);
    }

    let rec = log.record_at(&sys.space, top.page, top.offset)?;
    let slot_ptr = RollPtr::new(
        matches!(kind, UndoKind::Insert),
        trx.rseg_id,
        top.page,
        top.offset,
    );
    node.phase = match kind {
        UndoKind::Insert => Phase::Insert { rec, slot_ptr },
        UndoKind::Update => Phase::Modify { rec, slot_ptr },
    };
    Ok(StepOutcome::MoreWork)
}

/// Remove the record after its reversal has been applied.
fn pop_record(sys: &TransactionSystem, trx: &mut Trx, kind: UndoKind, rec: &UndoRec) -> Result<()> {
    let rseg = sys.rseg(trx.rseg_id);
    let log = match kind {
        UndoKind::Insert => trx.insert_undo.as_mut(),
        UndoKind::Update => trx.update_undo.as_mut(),
    }
    .ok_or_else(|| QuarryError::FatalState {
        detail: "undo log vanished mid-rollback".into(),
    })?;
    rseg.truncate(&sys.space, log, rec.undo_no)
}

fn undo_insert(
    sys: &TransactionSystem,
    trx: &Trx,
    rec: &UndoRec,
    slot_ptr: RollPtr,
) -> Result<()> {
    let table = match sys.tables.table(rec.table_id) {
        Ok(table) => table,
        Err(QuarryError::NoSuchTable { table }) => {
            tracing::warn!(trx_id = %trx.id, table, "undo target table gone, skipping");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let Some(current) = table.read_clustered(&rec.pk) else {
        tracing::warn!(trx_id = %trx.id, undo_no = %rec.undo_no, "insert already gone, skipping");
        return Ok(());
    };
    if current.hdr.roll_ptr != slot_ptr {
        tracing::warn!(trx_id = %trx.id, undo_no = %rec.undo_no, "roll pointer moved on, skipping insert undo");
        return Ok(());
    }
    // A fresh insert has no older version; its secondary entries are ours
    // alone and can be removed physically.
    for def in &table.schema.secondaries {
        let entry = def.entry_for(&current.row, &rec.pk);
        physical_delete_sec(
            sys,
            &table,
            def.id,
            &entry.key,
            &entry.pk,
        )?;
    }
    table.remove_clustered_if(&rec.pk, slot_ptr);
    Ok(())
}

fn undo_modify(
    sys: &TransactionSystem,
    trx: &Trx,
    rec: &UndoRec,
    slot_ptr: RollPtr,
) -> Result<()> {
    let table = match sys.tables.table(rec.table_id) {
        Ok(table) => table,
        Err(QuarryError::NoSuchTable { table }) => {
            tracing::warn!(trx_id = %trx.id, table, "undo target table gone, skipping");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let Some(current) = table.read_clustered(&rec.pk) else {
        tracing::warn!(trx_id = %trx.id, undo_no = %rec.undo_no, "record gone before modify undo, skipping");
        return Ok(());
    };
    if current.hdr.roll_ptr != slot_ptr {
        tracing::warn!(trx_id = %trx.id, undo_no = %rec.undo_no, "roll pointer moved on, skipping modify undo");
        return Ok(());
    }
    let info = rec.info.as_ref().ok_or_else(|| QuarryError::CorruptUndo {
        detail: "modify record without a previous-version image".into(),
    })?;

    let mut restored_row = current.row.clone();
    info.update.apply_to(&mut restored_row);
    let restored = ClusteredRec {
        hdr: crate::index::RecHdr {
            trx_id: info.trx_id,
            roll_ptr: info.roll_ptr,
            del_marked: rec.prev_del_marked(),
        },
        row: restored_row,
    };

    for def in &table.schema.secondaries {
        let current_entry = def.entry_for(&current.row, &rec.pk);
        let restored_entry = def.entry_for(&restored.row, &rec.pk);
        if current_entry.key != restored_entry.key {
            // The entry this transaction introduced is ours to remove.
            physical_delete_sec(sys, &table, def.id, &current_entry.key, &current_entry.pk)?;
        }
        restore_sec_mark(
            &table,
            def.id,
            restored_entry.key,
            restored_entry.pk,
            rec.prev_del_marked(),
        )?;
    }
    table.overwrite_clustered(rec.pk.clone(), restored);
    Ok(())
}

/// Put a secondary entry back into the delete-mark state the previous
/// version requires, re-inserting it if purge already removed it.
fn restore_sec_mark(
    table: &crate::index::Table,
    index: quarry_types::IndexId,
    key: Vec<Value>,
    pk: Vec<Value>,
    del_marked: bool,
) -> Result<()> {
    if !table.mark_sec(index, &key, &pk, del_marked) {
        table.insert_sec(index, key.clone(), pk.clone())?;
        table.mark_sec(index, &key, &pk, del_marked);
    }
    Ok(())
}
