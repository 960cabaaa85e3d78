//! Row version walker.
//!
//! Roll pointers chain each clustered record to the undo record describing
//! its previous version; walking the chain materializes older versions one
//! update vector at a time. The chain ends at a fresh-insert roll pointer,
//! which is never dereferenced.
//!
//! [`QuarryError::MissingHistory`] is a hard error on the consistent-read
//! path (returning newer data would break snapshot isolation) but degrades
//! to "no evidence" on the maintenance paths, which only ever use the chain
//! to keep something alive longer.

use std::cmp::Ordering;

use quarry_error::{QuarryError, Result};
use quarry_types::{cmp_binary_slices, cmp_collating_slices, IndexEntry, RowImage, TrxId, Value};

use crate::index::{ClusteredRec, IndexDef, Table};
use crate::sys::TransactionSystem;
use crate::undo_log::read_undo_rec;
use crate::view::ReadView;

/// One materialized version of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowVersion {
    pub trx_id: TrxId,
    /// Reference to the version before this one.
    pub roll_ptr: quarry_types::RollPtr,
    pub del_marked: bool,
    pub row: RowImage,
}

impl RowVersion {
    fn of(rec: &ClusteredRec) -> Self {
        Self {
            trx_id: rec.hdr.trx_id,
            roll_ptr: rec.hdr.roll_ptr,
            del_marked: rec.hdr.del_marked,
            row: rec.row.clone(),
        }
    }
}

/// Materialize the version preceding `version`, or `None` at the chain end.
fn prev_version(sys: &TransactionSystem, version: &RowVersion) -> Result<Option<RowVersion>> {
    if version.roll_ptr.is_insert() {
        return Ok(None);
    }
    let rec = read_undo_rec(&sys.space, version.roll_ptr)?;
    let info = rec.info.as_ref().ok_or_else(|| QuarryError::CorruptUndo {
        detail: "update-family record without a previous-version image".into(),
    })?;
    let mut row = version.row.clone();
    info.update.apply_to(&mut row);
    Ok(Some(RowVersion {
        trx_id: info.trx_id,
        roll_ptr: info.roll_ptr,
        del_marked: rec.prev_del_marked(),
        row,
    }))
}

/// Walk backward from `rec` until a version visible under `view` is found.
///
/// Returns `None` when the chain ends before visibility is reached (the row
/// did not exist in this snapshot). A purged link is a hard
/// [`QuarryError::MissingHistory`].
pub fn build_for_consistent_read(
    sys: &TransactionSystem,
    rec: &ClusteredRec,
    view: &ReadView,
) -> Result<Option<RowVersion>> {
    let mut version = RowVersion::of(rec);
    loop {
        if view.sees(version.trx_id) {
            return Ok(Some(version));
        }
        match prev_version(sys, &version)? {
            Some(prev) => version = prev,
            None => return Ok(None),
        }
    }
}

/// Read the row under `pk` as of `view`. Delete-marked visible versions
/// read as absent.
pub fn read_row(
    sys: &TransactionSystem,
    table: &Table,
    pk: &[Value],
    view: &ReadView,
) -> Result<Option<RowImage>> {
    let Some(rec) = table.read_clustered(pk) else {
        return Ok(None);
    };
    Ok(build_for_consistent_read(sys, &rec, view)?
        .filter(|v| !v.del_marked)
        .map(|v| v.row))
}

/// Collation-equal and binary-equal: collation order alone admits
/// equal-but-different keys, which must not count as the same entry.
fn entry_matches(a: &[Value], b: &[Value]) -> bool {
    cmp_collating_slices(a, b) == Ordering::Equal && cmp_binary_slices(a, b) == Ordering::Equal
}

/// Whether any observable version of `rec` still needs the secondary entry
/// `ientry`.
///
/// Used by purge to decide whether a delete-marked secondary entry can be
/// physically removed. `stop_at` bounds the walk at the record being
/// purged: the purge floor guarantees every version at or below it is
/// unobservable, so those versions cannot justify keeping the entry.
/// Degrades to `false` when the chain is already truncated, for the same
/// reason.
pub fn old_has_index_entry(
    sys: &TransactionSystem,
    def: &IndexDef,
    rec: &ClusteredRec,
    ientry: &IndexEntry,
    include_current: bool,
    stop_at: Option<quarry_types::RollPtr>,
) -> Result<bool> {
    let mut version = RowVersion::of(rec);
    if include_current && !version.del_marked {
        let key = def.entry_for(&version.row, &ientry.pk).key;
        if entry_matches(&key, &ientry.key) {
            return Ok(true);
        }
    }
    loop {
        if stop_at == Some(version.roll_ptr) {
            return Ok(false);
        }
        match prev_version(sys, &version) {
            Ok(Some(prev)) => version = prev,
            Ok(None) => return Ok(false),
            Err(err) if err.is_consistency_violation() => {
                tracing::warn!(%err, "chain truncated under index-entry check, treating as absent");
                return Ok(false);
            }
            Err(err) => return Err(err),
        }
        if !version.del_marked {
            let key = def.entry_for(&version.row, &ientry.pk).key;
            if entry_matches(&key, &ientry.key) {
                return Ok(true);
            }
        }
    }
}

/// Locate the version of `rec`'s chain that was installed under `slot_ptr`,
/// walking from the top. `None` when the chain no longer contains it or is
/// already truncated.
pub(crate) fn version_at_slot(
    sys: &TransactionSystem,
    rec: &ClusteredRec,
    slot_ptr: quarry_types::RollPtr,
) -> Result<Option<RowVersion>> {
    let mut version = RowVersion::of(rec);
    loop {
        if version.roll_ptr == slot_ptr {
            return Ok(Some(version));
        }
        match prev_version(sys, &version) {
            Ok(Some(prev)) => version = prev,
            Ok(None) => return Ok(None),
            Err(err) if err.is_consistency_violation() => {
                tracing::warn!(%err, "chain truncated while locating a purge target");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Decide whether an active transaction implicitly owns `sec entry state`.
///
/// The writer of the clustered record's current version holds an implicit
/// lock on a secondary entry iff some version it produced requires the
/// entry to be in a different state than it is now. The trx-table mutex is
/// not held during the chain walk; liveness is re-validated against the
/// active table afterward, since the writer may have committed meanwhile.
pub fn implicit_lock_holder(
    sys: &TransactionSystem,
    table: &Table,
    def: &IndexDef,
    ientry: &IndexEntry,
    entry_del_marked: bool,
) -> Result<Option<TrxId>> {
    let Some(rec) = table.read_clustered(&ientry.pk) else {
        return Ok(None);
    };
    let holder = rec.hdr.trx_id;
    if !sys.is_active(holder) {
        return Ok(None);
    }

    // Walk without the trx-table mutex; the walk may block on page reads.
    // The walk covers every version the holder produced plus the first
    // older version by another transaction: that boundary version is what
    // undoing the holder would restore, so its requirement on the entry
    // counts too.
    let mut version = RowVersion::of(&rec);
    let mut locks = false;
    loop {
        // This version needs the entry live iff it projects onto it and is
        // not delete-marked; it conflicts with the current entry state when
        // that need and the entry's delete-mark agree.
        let key = def.entry_for(&version.row, &ientry.pk).key;
        let needs_entry = !version.del_marked && entry_matches(&key, &ientry.key);
        if needs_entry == entry_del_marked {
            locks = true;
            break;
        }
        if version.trx_id != holder {
            // The boundary version agrees with the entry's current state,
            // so undoing the holder leaves the entry untouched.
            break;
        }
        match prev_version(sys, &version) {
            Ok(Some(prev)) => version = prev,
            Ok(None) => {
                // Chain ends at a version the holder itself installed, so
                // the holder inserted the row; it owns the entry iff the
                // birth version projects onto it.
                locks = needs_entry;
                break;
            }
            Err(err) if err.is_consistency_violation() => {
                tracing::warn!(%err, "chain truncated under implicit-lock check, treating as unlocked");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    }

    // Re-validate liveness: the holder may have committed during the walk.
    if locks && sys.is_active(holder) {
        Ok(Some(holder))
    } else {
        Ok(None)
    }
}
