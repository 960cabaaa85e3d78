//! Undo record codec.
//!
//! An undo record is a variable-length entry inside an undo log, keyed by an
//! ever-increasing `undo_no`. It carries enough to relocate the clustered
//! record (table id + primary key image) and, for update-family records, the
//! pre-image needed to materialize the previous version: the overwritten
//! transaction id, roll pointer, and changed-column values. Records are
//! immutable once written.

use quarry_error::{QuarryError, Result};
use quarry_types::encoding::{append_u64_le, read_u64_le, read_varint, write_varint};
use quarry_types::{RollPtr, TableId, TrxId, UndoNo, UpdateVector, Value};

/// Operation type of an undo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoRecKind {
    /// A fresh insert; undoing it removes the row.
    Insert,
    /// An update of a live record; undoing it restores the pre-image.
    UpdExist,
    /// An update that revived a delete-marked record (insert-by-modify);
    /// undoing it restores the values and re-sets the delete mark.
    UpdDelMark,
    /// A delete-mark; undoing it clears the mark.
    DelMark,
}

impl UndoRecKind {
    const fn tag(self) -> u8 {
        match self {
            Self::Insert => 1,
            Self::UpdExist => 2,
            Self::UpdDelMark => 3,
            Self::DelMark => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Insert),
            2 => Some(Self::UpdExist),
            3 => Some(Self::UpdDelMark),
            4 => Some(Self::DelMark),
            _ => None,
        }
    }

    /// Whether the record belongs to the update-undo log.
    #[must_use]
    pub const fn is_update_family(self) -> bool {
        !matches!(self, Self::Insert)
    }
}

/// Pre-image header carried by update-family records: the system columns the
/// operation overwrote on the clustered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevInfo {
    /// Transaction id the record carried before this operation.
    pub trx_id: TrxId,
    /// Roll pointer the record carried before this operation.
    pub roll_ptr: RollPtr,
    /// Old values of the changed columns.
    pub update: UpdateVector,
}

/// One undo record, parsed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRec {
    pub kind: UndoRecKind,
    pub undo_no: UndoNo,
    pub table_id: TableId,
    /// Primary-key image sufficient to relocate the clustered record.
    pub pk: Vec<Value>,
    /// Present on update-family records, absent on inserts.
    pub info: Option<PrevInfo>,
    /// Externally stored columns that become unreachable once this version
    /// is purged.
    pub freed_externs: Vec<u64>,
}

impl UndoRec {
    /// Build an insert record.
    #[must_use]
    pub fn insert(undo_no: UndoNo, table_id: TableId, pk: Vec<Value>) -> Self {
        Self {
            kind: UndoRecKind::Insert,
            undo_no,
            table_id,
            pk,
            info: None,
            freed_externs: Vec::new(),
        }
    }

    /// Build an update-family record.
    #[must_use]
    pub fn modify(
        kind: UndoRecKind,
        undo_no: UndoNo,
        table_id: TableId,
        pk: Vec<Value>,
        info: PrevInfo,
        freed_externs: Vec<u64>,
    ) -> Self {
        debug_assert!(kind.is_update_family());
        Self {
            kind,
            undo_no,
            table_id,
            pk,
            info: Some(info),
            freed_externs,
        }
    }

    /// Delete-mark state of the version *before* the recorded operation.
    #[must_use]
    pub const fn prev_del_marked(&self) -> bool {
        matches!(self.kind, UndoRecKind::UpdDelMark)
    }

    /// Encode into the payload form stored in an undo page.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.kind.tag());
        write_varint(&mut buf, self.undo_no.get());
        write_varint(&mut buf, self.table_id);
        write_varint(&mut buf, self.pk.len() as u64);
        for v in &self.pk {
            v.encode(&mut buf);
        }
        if let Some(info) = &self.info {
            append_u64_le(&mut buf, info.trx_id.get());
            append_u64_le(&mut buf, info.roll_ptr.raw());
            info.update.encode(&mut buf);
            write_varint(&mut buf, self.freed_externs.len() as u64);
            for &id in &self.freed_externs {
                write_varint(&mut buf, id);
            }
        }
        buf
    }

    /// Parse a payload produced by [`UndoRec::encode`].
    pub fn parse(buf: &[u8]) -> Result<Self> {
        Self::parse_inner(buf).ok_or_else(|| QuarryError::CorruptUndo {
            detail: format!("unparseable record of {} bytes", buf.len()),
        })
    }

    fn parse_inner(buf: &[u8]) -> Option<Self> {
        let kind = UndoRecKind::from_tag(*buf.first()?)?;
        let mut pos = 1;
        let (undo_no, used) = read_varint(buf, pos)?;
        pos += used;
        let (table_id, used) = read_varint(buf, pos)?;
        pos += used;
        let (n_pk, used) = read_varint(buf, pos)?;
        pos += used;
        let mut pk = Vec::with_capacity(usize::try_from(n_pk).ok()?);
        for _ in 0..n_pk {
            let (v, used) = Value::decode(buf, pos)?;
            pos += used;
            pk.push(v);
        }
        let (info, freed_externs) = if kind.is_update_family() {
            let trx_id = TrxId::new(read_u64_le(buf, pos)?)?;
            pos += 8;
            let roll_ptr = RollPtr::from_raw(read_u64_le(buf, pos)?).ok()?;
            pos += 8;
            let (update, used) = UpdateVector::decode(buf, pos)?;
            pos += used;
            let (n_ext, used) = read_varint(buf, pos)?;
            pos += used;
            let mut externs = Vec::with_capacity(usize::try_from(n_ext).ok()?);
            for _ in 0..n_ext {
                let (id, used) = read_varint(buf, pos)?;
                pos += used;
                externs.push(id);
            }
            (
                Some(PrevInfo {
                    trx_id,
                    roll_ptr,
                    update,
                }),
                externs,
            )
        } else {
            (None, Vec::new())
        };
        if pos != buf.len() {
            return None;
        }
        Some(Self {
            kind,
            undo_no: UndoNo::new(undo_no),
            table_id,
            pk,
            info,
            freed_externs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quarry_types::RsegId;

    fn sample_info() -> PrevInfo {
        let mut update = UpdateVector::new();
        update.push(1, Value::Text("old".into()), None);
        update.push(3, Value::Integer(-9), Some(17));
        PrevInfo {
            trx_id: TrxId::new(42).unwrap(),
            roll_ptr: RollPtr::new(false, RsegId::new(2).unwrap(), 11, 300),
            update,
        }
    }

    #[test]
    fn test_insert_round_trip() {
        let rec = UndoRec::insert(
            UndoNo::new(0),
            7,
            vec![Value::Integer(1), Value::Text("k".into())],
        );
        let parsed = UndoRec::parse(&rec.encode()).unwrap();
        assert_eq!(parsed, rec);
        assert!(parsed.info.is_none());
    }

    #[test]
    fn test_update_round_trip_carries_pre_image() {
        let rec = UndoRec::modify(
            UndoRecKind::UpdExist,
            UndoNo::new(5),
            9,
            vec![Value::Integer(33)],
            sample_info(),
            vec![17, 99],
        );
        let parsed = UndoRec::parse(&rec.encode()).unwrap();
        assert_eq!(parsed, rec);
        let info = parsed.info.unwrap();
        assert_eq!(info.trx_id.get(), 42);
        assert_eq!(info.roll_ptr.page(), 11);
    }

    #[test]
    fn test_prev_del_marked_only_for_upd_del_mark() {
        let mk = |kind| {
            UndoRec::modify(
                kind,
                UndoNo::new(1),
                1,
                vec![Value::Integer(1)],
                sample_info(),
                vec![],
            )
        };
        assert!(mk(UndoRecKind::UpdDelMark).prev_del_marked());
        assert!(!mk(UndoRecKind::UpdExist).prev_del_marked());
        assert!(!mk(UndoRecKind::DelMark).prev_del_marked());
    }

    #[test]
    fn test_parse_rejects_trailing_garbage() {
        let rec = UndoRec::insert(UndoNo::new(1), 2, vec![Value::Null]);
        let mut bytes = rec.encode();
        bytes.push(0);
        assert!(matches!(
            UndoRec::parse(&bytes),
            Err(QuarryError::CorruptUndo { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        assert!(UndoRec::parse(&[0x77, 0, 0, 0]).is_err());
        assert!(UndoRec::parse(&[]).is_err());
    }

    fn arb_pk() -> impl Strategy<Value = Vec<Value>> {
        proptest::collection::vec(
            prop_oneof![
                any::<i64>().prop_map(Value::Integer),
                ".{0,12}".prop_map(Value::Text),
            ],
            1..4,
        )
    }

    proptest! {
        #[test]
        fn prop_insert_codec_round_trip(no in 0u64..1 << 40, table in 1u64..1 << 40, pk in arb_pk()) {
            let rec = UndoRec::insert(UndoNo::new(no), table, pk);
            prop_assert_eq!(UndoRec::parse(&rec.encode()).unwrap(), rec);
        }

        #[test]
        fn prop_del_mark_codec_round_trip(
            no in 0u64..1 << 40,
            trx in 1u64..TrxId::MAX_RAW,
            pk in arb_pk(),
            externs in proptest::collection::vec(any::<u64>(), 0..4),
        ) {
            let rec = UndoRec::modify(
                UndoRecKind::DelMark,
                UndoNo::new(no),
                3,
                pk,
                PrevInfo {
                    trx_id: TrxId::new(trx).unwrap(),
                    roll_ptr: RollPtr::new(true, RsegId::new(0).unwrap(), 1, 16),
                    update: UpdateVector::new(),
                },
                externs,
            );
            prop_assert_eq!(UndoRec::parse(&rec.encode()).unwrap(), rec);
        }
    }
}
