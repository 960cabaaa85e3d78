//! Row write path.
//!
//! Every mutation writes its undo record before touching the indexes, so
//! the roll pointer stored on the clustered record always resolves to the
//! version it replaced. Deletes never remove a clustered record in place;
//! they delete-mark it and leave physical removal to purge. Inserting over
//! a delete-marked key reuses the record as an update, keeping the version
//! chain intact.

use quarry_error::{QuarryError, Result};
use quarry_types::{RowImage, TableId, UpdateVector, Value};

use crate::index::{ClusteredRec, RecHdr};
use crate::sys::TransactionSystem;
use crate::trx::{Trx, TrxState};
use crate::undo_log::UndoKind;
use crate::undo_rec::{PrevInfo, UndoRec, UndoRecKind};

/// One column assignment in an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnChange {
    pub col_no: u32,
    pub value: Value,
}

impl TransactionSystem {
    /// Insert `row` into `table_id` under `trx`.
    ///
    /// A delete-marked occupant of the same key is overwritten in place,
    /// recorded as an update of the delete-marked row so its history stays
    /// reachable.
    pub fn insert_row(&self, trx: &mut Trx, table_id: TableId, row: RowImage) -> Result<()> {
        self.ensure_usable()?;
        trx.require_state(TrxState::Active)?;
        let table = self.tables.table(table_id)?;
        let pk = table.pk_of(&row);

        match table.read_clustered(&pk) {
            None => {
                let rec = UndoRec::insert(trx.next_undo_no(), table_id, pk.clone());
                let roll_ptr = self.append_undo(trx, UndoKind::Insert, &rec)?;
                table.insert_clustered(
                    pk.clone(),
                    ClusteredRec {
                        hdr: RecHdr {
                            trx_id: trx.id,
                            roll_ptr,
                            del_marked: false,
                        },
                        row: row.clone(),
                    },
                )?;
                for def in &table.schema.secondaries {
                    let entry = def.entry_for(&row, &pk);
                    if table.sec_entry(def.id, &entry.key, &entry.pk).is_some() {
                        table.mark_sec(def.id, &entry.key, &entry.pk, false);
                    } else {
                        table.insert_sec(def.id, entry.key, entry.pk)?;
                    }
                }
                tracing::debug!(trx_id = %trx.id, table = table_id, "row inserted");
                Ok(())
            }
            Some(old) if old.hdr.del_marked => {
                let mut update = UpdateVector::default();
                for (col_no, old_val) in old.row.cols.iter().enumerate() {
                    let new_val = row.cols.get(col_no).unwrap_or(&Value::Null);
                    if old_val != new_val {
                        update.push(col_no as u32, old_val.clone(), None);
                    }
                }
                let rec = UndoRec::modify(
                    UndoRecKind::UpdDelMark,
                    trx.next_undo_no(),
                    table_id,
                    pk.clone(),
                    PrevInfo {
                        trx_id: old.hdr.trx_id,
                        roll_ptr: old.hdr.roll_ptr,
                        update,
                    },
                    vec![],
                );
                let roll_ptr = self.append_undo(trx, UndoKind::Update, &rec)?;
                table.overwrite_clustered(
                    pk.clone(),
                    ClusteredRec {
                        hdr: RecHdr {
                            trx_id: trx.id,
                            roll_ptr,
                            del_marked: false,
                        },
                        row: row.clone(),
                    },
                );
                for def in &table.schema.secondaries {
                    let entry = def.entry_for(&row, &pk);
                    if !table.mark_sec(def.id, &entry.key, &entry.pk, false) {
                        table.insert_sec(def.id, entry.key, entry.pk)?;
                    }
                }
                tracing::debug!(trx_id = %trx.id, table = table_id, "insert reused delete-marked row");
                Ok(())
            }
            Some(_) => Err(QuarryError::DuplicateKey { table: table_id }),
        }
    }

    /// Apply `changes` to the row under `pk`.
    ///
    /// Primary-key columns cannot change; a key change is a delete plus an
    /// insert at the client layer.
    pub fn update_row(
        &self,
        trx: &mut Trx,
        table_id: TableId,
        pk: &[Value],
        changes: &[ColumnChange],
    ) -> Result<()> {
        self.ensure_usable()?;
        trx.require_state(TrxState::Active)?;
        if changes.is_empty() {
            return Ok(());
        }
        let table = self.tables.table(table_id)?;
        if changes
            .iter()
            .any(|c| table.schema.pk_cols.contains(&c.col_no))
        {
            return Err(QuarryError::ImmutableKey { table: table_id });
        }
        let old = table
            .read_clustered(pk)
            .filter(|rec| !rec.hdr.del_marked)
            .ok_or(QuarryError::RowNotFound { table: table_id })?;

        let mut update = UpdateVector::default();
        for change in changes {
            let old_val = old
                .row
                .cols
                .get(change.col_no as usize)
                .cloned()
                .unwrap_or(Value::Null);
            if old_val != change.value {
                update.push(change.col_no, old_val, None);
            }
        }
        if update.is_empty() {
            return Ok(());
        }

        let rec = UndoRec::modify(
            UndoRecKind::UpdExist,
            trx.next_undo_no(),
            table_id,
            pk.to_vec(),
            PrevInfo {
                trx_id: old.hdr.trx_id,
                roll_ptr: old.hdr.roll_ptr,
                update: update.clone(),
            },
            vec![],
        );
        let roll_ptr = self.append_undo(trx, UndoKind::Update, &rec)?;

        let mut new_row = old.row.clone();
        for change in changes {
            while new_row.cols.len() <= change.col_no as usize {
                new_row.cols.push(Value::Null);
            }
            new_row.cols[change.col_no as usize] = change.value.clone();
        }
        table.overwrite_clustered(
            pk.to_vec(),
            ClusteredRec {
                hdr: RecHdr {
                    trx_id: trx.id,
                    roll_ptr,
                    del_marked: false,
                },
                row: new_row.clone(),
            },
        );

        // Delete-mark the stale secondary entries, insert the new ones.
        for def in &table.schema.secondaries {
            if !update.touches(&def.key_cols) {
                continue;
            }
            let old_entry = def.entry_for(&old.row, pk);
            let new_entry = def.entry_for(&new_row, pk);
            if old_entry.key == new_entry.key {
                continue;
            }
            table.mark_sec(def.id, &old_entry.key, &old_entry.pk, true);
            if !table.mark_sec(def.id, &new_entry.key, &new_entry.pk, false) {
                table.insert_sec(def.id, new_entry.key, new_entry.pk)?;
            }
        }
        tracing::debug!(trx_id = %trx.id, table = table_id, n_cols = changes.len(), "row updated");
        Ok(())
    }

    /// Delete the row under `pk`: delete-mark it and its secondary entries.
    pub fn delete_row(&self, trx: &mut Trx, table_id: TableId, pk: &[Value]) -> Result<()> {
        self.ensure_usable()?;
        trx.require_state(TrxState::Active)?;
        let table = self.tables.table(table_id)?;
        let old = table
            .read_clustered(pk)
            .filter(|rec| !rec.hdr.del_marked)
            .ok_or(QuarryError::RowNotFound { table: table_id })?;

        let rec = UndoRec::modify(
            UndoRecKind::DelMark,
            trx.next_undo_no(),
            table_id,
            pk.to_vec(),
            PrevInfo {
                trx_id: old.hdr.trx_id,
                roll_ptr: old.hdr.roll_ptr,
                update: UpdateVector::default(),
            },
            vec![],
        );
        let roll_ptr = self.append_undo(trx, UndoKind::Update, &rec)?;

        table.update_clustered(pk, |rec| {
            rec.hdr = RecHdr {
                trx_id: trx.id,
                roll_ptr,
                del_marked: true,
            };
        });
        for def in &table.schema.secondaries {
            let entry = def.entry_for(&old.row, pk);
            table.mark_sec(def.id, &entry.key, &entry.pk, true);
        }
        tracing::debug!(trx_id = %trx.id, table = table_id, "row delete-marked");
        Ok(())
    }
}
