//! Row purge executor.
//!
//! Applies one committed undo record's physical cleanup: removing the
//! clustered record at a delete-mark chain bottom, removing secondary
//! entries that no surviving version justifies, and freeing externally
//! stored columns referenced only by the purged pre-image.
//!
//! Every step revalidates the clustered roll pointer first; a mismatch
//! means a newer transaction has overwritten the row and this record's
//! cleanup belongs to that newer chain's own purge turn. Re-running purge
//! on a stale record is therefore a no-op.

use std::time::Duration;

use quarry_error::{QuarryError, Result};
use quarry_types::{IndexId, RollPtr, Value};

use crate::index::{DeleteOutcome, Table};
use crate::sys::TransactionSystem;
use crate::undo_rec::{UndoRec, UndoRecKind};
use crate::versions::{old_has_index_entry, version_at_slot};

/// What applying one record to the indexes accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// Physical cleanup ran.
    Applied,
    /// Roll pointer no longer matched (or the row is gone); nothing to do.
    Stale,
}

/// Apply one undo record's physical cleanup.
///
/// `slot_ptr` is the roll pointer under which the record was installed on
/// the clustered record, reconstructed by the purge coordinator from the
/// record's location.
pub fn row_purge_step(
    sys: &TransactionSystem,
    rec: &UndoRec,
    slot_ptr: RollPtr,
) -> Result<PurgeOutcome> {
    let table = match sys.tables.table(rec.table_id) {
        Ok(table) => table,
        Err(QuarryError::NoSuchTable { table }) => {
            tracing::debug!(table, "purge target table gone, skipping record");
            return Ok(PurgeOutcome::Stale);
        }
        Err(err) => return Err(err),
    };

    let outcome = match rec.kind {
        UndoRecKind::Insert => {
            // Insert logs are freed at commit and never reach purge.
            tracing::debug!(undo_no = %rec.undo_no, "insert record in purge stream, skipping");
            PurgeOutcome::Stale
        }
        UndoRecKind::DelMark => purge_del_mark(sys, &table, rec, slot_ptr)?,
        UndoRecKind::UpdExist | UndoRecKind::UpdDelMark => {
            purge_update(sys, &table, rec, slot_ptr)?
        }
    };
    if outcome == PurgeOutcome::Applied {
        for &ext in &rec.freed_externs {
            sys.free_extern(ext);
        }
    }
    Ok(outcome)
}

/// Chain bottom of a deleted row: remove the clustered record and the
/// secondary entries that only it justified.
fn purge_del_mark(
    sys: &TransactionSystem,
    table: &Table,
    rec: &UndoRec,
    slot_ptr: RollPtr,
) -> Result<PurgeOutcome> {
    let Some(current) = table.read_clustered(&rec.pk) else {
        return Ok(PurgeOutcome::Stale);
    };
    if current.hdr.roll_ptr != slot_ptr || !current.hdr.del_marked {
        return Ok(PurgeOutcome::Stale);
    }

    for def in &table.schema.secondaries {
        let entry = def.entry_for(&current.row, &rec.pk);
        // The walk is bounded at this record, so only a version some
        // collaborator re-created above it can keep the entry alive.
        if !old_has_index_entry(sys, def, &current, &entry, false, Some(slot_ptr))? {
            physical_delete_sec(sys, table, def.id, &entry.key, &entry.pk)?;
        }
    }
    table.remove_clustered_if(&rec.pk, slot_ptr);
    tracing::debug!(table = rec.table_id, undo_no = %rec.undo_no, "delete-marked row removed");
    Ok(PurgeOutcome::Applied)
}

/// Purge of an update record: the pre-image's secondary entries may now be
/// removable.
///
/// The record's pre-image applies to the version it overwrote, not to the
/// current row, so the chain is walked down to the version installed under
/// `slot_ptr` first; if the chain no longer contains that version, a newer
/// chain owns the cleanup and this step is a no-op.
fn purge_update(
    sys: &TransactionSystem,
    table: &Table,
    rec: &UndoRec,
    slot_ptr: RollPtr,
) -> Result<PurgeOutcome> {
    let Some(current) = table.read_clustered(&rec.pk) else {
        return Ok(PurgeOutcome::Stale);
    };
    let Some(at_slot) = version_at_slot(sys, &current, slot_ptr)? else {
        return Ok(PurgeOutcome::Stale);
    };
    let info = rec.info.as_ref().ok_or_else(|| QuarryError::CorruptUndo {
        detail: "update record without a previous-version image".into(),
    })?;

    // The row this update overwrote.
    let mut old_row = at_slot.row.clone();
    info.update.apply_to(&mut old_row);

    for def in &table.schema.secondaries {
        if !info.update.touches(&def.key_cols) {
            continue;
        }
        let old_entry = def.entry_for(&old_row, &rec.pk);
        let new_entry = def.entry_for(&at_slot.row, &rec.pk);
        if old_entry.key == new_entry.key {
            continue;
        }
        if !old_has_index_entry(sys, def, &current, &old_entry, true, Some(slot_ptr))? {
            physical_delete_sec(sys, table, def.id, &old_entry.key, &old_entry.pk)?;
        }
    }
    tracing::debug!(table = rec.table_id, undo_no = %rec.undo_no, "update pre-image purged");
    Ok(PurgeOutcome::Applied)
}

/// Physically delete one secondary entry: optimistic first, then the
/// pessimistic path with bounded retries and a short backoff.
pub(crate) fn physical_delete_sec(
    sys: &TransactionSystem,
    table: &Table,
    index: IndexId,
    key: &[Value],
    pk: &[Value],
) -> Result<DeleteOutcome> {
    match table.delete_sec_optimistic(index, key, pk) {
        DeleteOutcome::NeedsRestructure => {}
        out => return Ok(out),
    }
    let mut attempts = 0;
    loop {
        attempts += 1;
        match table.delete_sec_pessimistic(index, key, pk) {
            Ok(out) => return Ok(out),
            Err(err) if err.is_resource_exhaustion() => {
                if attempts >= sys.config.delete_retries {
                    tracing::warn!(index, attempts, "pessimistic delete exhausted its retries");
                    return Err(QuarryError::RetriesExhausted { attempts });
                }
                tracing::debug!(index, attempts, %err, "pessimistic delete retrying");
                std::thread::sleep(Duration::from_millis(sys.config.delete_backoff_ms));
            }
            Err(err) => return Err(err),
        }
    }
}
