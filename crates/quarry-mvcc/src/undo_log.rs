//! Per-transaction undo logs.
//!
//! An undo log is an append-only sequence of undo records living inside one
//! rollback segment. A transaction owns at most one insert-undo and one
//! update-undo log. Records are appended on the write path, popped newest
//! first during rollback, and consumed oldest first by purge.
//!
//! On-page form: the log's first page carries a segment header (kind, state,
//! transaction id and serialization number, delete-mark flag, XID when
//! prepared); record slots follow, each `[payload_len u16][prev_off u16]
//! [payload]`, chained across pages through the page-header next link.

use quarry_error::{QuarryError, Result};
use quarry_types::encoding::{put_u16_le, put_u64_le, read_u16_le, read_u64_le};
use quarry_types::{PageNo, RollPtr, RsegId, TrxId, TrxNo, UndoNo, PAGE_NO_NULL};

use crate::mtr::{
    page_free_offset, page_next, set_page_free_offset, set_page_next, Mtr, UndoTablespace,
    PAGE_HDR_END, PAGE_KIND_UNDO, PAGE_SIZE,
};
use crate::undo_rec::{UndoRec, UndoRecKind};

/// Undo log type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    /// Discarded at commit; needed only for recovery rollback.
    Insert,
    /// Preserved for MVCC; moved to the history list at commit.
    Update,
}

/// Undo log lifecycle state, persisted in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoState {
    Active,
    Cached,
    ToFree,
    ToPurge,
    Prepared,
}

impl UndoState {
    const fn tag(self) -> u8 {
        match self {
            Self::Active => 1,
            Self::Cached => 2,
            Self::ToFree => 3,
            Self::ToPurge => 4,
            Self::Prepared => 5,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Active),
            2 => Some(Self::Cached),
            3 => Some(Self::ToFree),
            4 => Some(Self::ToPurge),
            5 => Some(Self::Prepared),
            _ => None,
        }
    }
}

/// Page-size budget of one rollback segment, maintained by the caller.
#[derive(Debug, Clone, Copy)]
pub struct SegQuota {
    /// Pages currently owned by the segment's logs (plus its header page).
    pub curr_pages: u32,
    /// Hard cap; allocation beyond it fails soft.
    pub max_pages: u32,
}

/// Locator of the newest record in a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopRec {
    pub page: PageNo,
    pub offset: u16,
    pub undo_no: UndoNo,
}

// Segment header layout, relative to `PAGE_HDR_END`.
const SEG_OFF_KIND: usize = 0;
const SEG_OFF_STATE: usize = 1;
const SEG_OFF_DEL_MARKS: usize = 2;
const SEG_OFF_XID_LEN: usize = 3;
const SEG_OFF_TRX_ID: usize = 4;
const SEG_OFF_TRX_NO: usize = 12;
const SEG_OFF_XID: usize = 20;

/// Maximum persisted XID length.
pub const MAX_XID_LEN: usize = 64;

/// Total segment header size; records on a log header page start after it.
const SEG_HDR_SIZE: u16 = 96;

/// First record offset on a log header page.
pub const HDR_PAGE_FIRST_REC: u16 = PAGE_HDR_END + SEG_HDR_SIZE;

/// Record slot overhead: payload length + previous-record offset.
const REC_SLOT_HDR: u16 = 4;

/// The in-memory image of one undo log.
#[derive(Debug, Clone)]
pub struct UndoLog {
    /// Slot index within the owning rollback segment.
    pub slot: u16,
    pub kind: UndoKind,
    pub state: UndoState,
    pub trx_id: TrxId,
    /// Serialization number, set at commit for update logs.
    pub trx_no: Option<TrxNo>,
    /// Whether any record in the log is a delete-mark.
    pub del_marks: bool,
    /// XA identifier, persisted at prepare.
    pub xid: Option<Vec<u8>>,
    /// First page; carries the segment header.
    pub hdr_page: PageNo,
    /// All pages of the log, in list order (`hdr_page` first).
    pub pages: Vec<PageNo>,
    /// Newest record, if any.
    pub top: Option<TopRec>,
}

impl UndoLog {
    fn first_rec_offset(&self, page: PageNo) -> u16 {
        if page == self.hdr_page {
            HDR_PAGE_FIRST_REC
        } else {
            PAGE_HDR_END
        }
    }

    /// Create a fresh log inside `mtr`. The caller pairs this with the
    /// rollback segment's slot-array update in the same mtr, so creation is
    /// a single atomic event.
    pub fn create(
        mtr: &mut Mtr<'_>,
        slot: u16,
        kind: UndoKind,
        trx_id: TrxId,
    ) -> Result<Self> {
        let hdr_page = mtr.alloc_page(PAGE_KIND_UNDO)?;
        let log = Self {
            slot,
            kind,
            state: UndoState::Active,
            trx_id,
            trx_no: None,
            del_marks: false,
            xid: None,
            hdr_page,
            pages: vec![hdr_page],
            top: None,
        };
        {
            let bytes = mtr.page_mut(hdr_page)?;
            set_page_free_offset(bytes, HDR_PAGE_FIRST_REC);
            write_seg_header(bytes, &log);
        }
        Ok(log)
    }

    /// Reuse a cached log header for a new transaction.
    ///
    /// Resets the segment header and record area in one mtr, so recovery
    /// observes an atomic create-or-reuse event.
    pub fn reuse(&mut self, space: &UndoTablespace, trx_id: TrxId) -> Result<()> {
        debug_assert_eq!(self.pages.len(), 1);
        self.state = UndoState::Active;
        self.trx_id = trx_id;
        self.trx_no = None;
        self.del_marks = false;
        self.xid = None;
        self.top = None;
        let mut mtr = Mtr::new(space);
        {
            let bytes = mtr.page_mut(self.hdr_page)?;
            set_page_free_offset(bytes, HDR_PAGE_FIRST_REC);
            set_page_next(bytes, PAGE_NO_NULL);
            write_seg_header(bytes, self);
        }
        mtr.commit();
        Ok(())
    }

    /// Append a record, returning the roll pointer to store on the modified
    /// clustered record.
    ///
    /// Fails soft with [`QuarryError::RsegOutOfSpace`] when the segment's
    /// page quota is exhausted, leaving the log unchanged.
    pub fn add_record(
        &mut self,
        space: &UndoTablespace,
        quota: &mut SegQuota,
        rseg: RsegId,
        rec: &UndoRec,
    ) -> Result<RollPtr> {
        let payload = rec.encode();
        let need = REC_SLOT_HDR as usize + payload.len();
        if need > PAGE_SIZE - PAGE_HDR_END as usize {
            return Err(QuarryError::CorruptUndo {
                detail: format!("undo record of {need} bytes exceeds page capacity"),
            });
        }

        let mut mtr = Mtr::new(space);
        let last = *self.pages.last().ok_or_else(|| QuarryError::CorruptUndo {
            detail: "undo log with no pages".into(),
        })?;
        let free = page_free_offset(&mtr.page(last)?);
        let (target, target_off, grew) = if free as usize + need <= PAGE_SIZE {
            (last, free, false)
        } else {
            if quota.curr_pages + 1 > quota.max_pages {
                return Err(QuarryError::RsegOutOfSpace { rseg });
            }
            let fresh = mtr.alloc_page(PAGE_KIND_UNDO)?;
            set_page_next(mtr.page_mut(last)?, fresh);
            (fresh, PAGE_HDR_END, true)
        };

        let prev_off = match self.top {
            Some(top) if top.page == target => top.offset,
            _ => 0,
        };
        {
            let bytes = mtr.page_mut(target)?;
            let at = target_off as usize;
            put_u16_le(bytes, at, payload.len() as u16);
            put_u16_le(bytes, at + 2, prev_off);
            bytes[at + 4..at + 4 + payload.len()].copy_from_slice(&payload);
            set_page_free_offset(bytes, target_off + need as u16);
        }
        let marks_delete = matches!(rec.kind, UndoRecKind::DelMark | UndoRecKind::UpdDelMark);
        if marks_delete && !self.del_marks {
            self.del_marks = true;
            write_seg_header(mtr.page_mut(self.hdr_page)?, self);
        }
        mtr.commit();

        if grew {
            self.pages.push(target);
            quota.curr_pages += 1;
        }
        self.top = Some(TopRec {
            page: target,
            offset: target_off,
            undo_no: rec.undo_no,
        });
        Ok(RollPtr::new(
            matches!(self.kind, UndoKind::Insert),
            rseg,
            target,
            target_off,
        ))
    }

    /// Discard every record with `undo_no >= limit`, newest first.
    ///
    /// Pages emptied by the truncation are returned to the tablespace.
    pub fn truncate_end(
        &mut self,
        space: &UndoTablespace,
        quota: &mut SegQuota,
        limit: UndoNo,
    ) -> Result<()> {
        while let Some(top) = self.top {
            if top.undo_no < limit {
                break;
            }
            let mut mtr = Mtr::new(space);
            set_page_free_offset(mtr.page_mut(top.page)?, top.offset);
            let prev_off = read_u16_le(&mtr.page(top.page)?, top.offset as usize + 2)
                .ok_or_else(|| QuarryError::CorruptUndo {
                    detail: "truncated record slot".into(),
                })?;

            if prev_off != 0 {
                let rec = read_record_at(&mtr.page(top.page)?, prev_off)?;
                self.top = Some(TopRec {
                    page: top.page,
                    offset: prev_off,
                    undo_no: rec.undo_no,
                });
                mtr.commit();
                continue;
            }

            // First record of its page is gone; drop empty non-header pages.
            if top.page != self.hdr_page {
                mtr.free_page(top.page);
                self.pages.pop();
                quota.curr_pages -= 1;
                let new_last = *self.pages.last().ok_or_else(|| QuarryError::CorruptUndo {
                    detail: "undo log lost its header page".into(),
                })?;
                set_page_next(mtr.page_mut(new_last)?, PAGE_NO_NULL);
                let bytes = mtr.page(new_last)?;
                self.top = last_record_in_page(new_last, &bytes, self.first_rec_offset(new_last))?;
            } else {
                self.top = None;
            }
            mtr.commit();
        }
        Ok(())
    }

    /// Mark the log prepared and persist the XA identifier.
    pub fn set_prepared(&mut self, space: &UndoTablespace, xid: &[u8]) -> Result<()> {
        if xid.len() > MAX_XID_LEN {
            return Err(QuarryError::CorruptUndo {
                detail: format!("XID of {} bytes exceeds the {MAX_XID_LEN}-byte cap", xid.len()),
            });
        }
        self.state = UndoState::Prepared;
        self.xid = Some(xid.to_vec());
        let mut mtr = Mtr::new(space);
        write_seg_header(mtr.page_mut(self.hdr_page)?, self);
        mtr.commit();
        Ok(())
    }

    /// Compute and persist the post-commit state of the log.
    ///
    /// An emptied log (full rollback) is recycled whatever its kind. A
    /// committed insert log's information has no further use: recycled when
    /// single-page and lightly used, freed otherwise. A committed update
    /// log with records always goes to purge; its records are the version
    /// history readers and purge depend on.
    pub fn set_state_at_finish(
        &mut self,
        space: &UndoTablespace,
        trx_no: Option<TrxNo>,
        reuse_limit: u16,
    ) -> Result<UndoState> {
        let free = space
            .with_page(self.hdr_page, page_free_offset)
            .ok_or_else(|| QuarryError::CorruptPage {
                page: self.hdr_page,
                detail: "undo log header page vanished".into(),
            })?;
        let state = if self.top.is_none() && self.pages.len() == 1 {
            UndoState::Cached
        } else if matches!(self.kind, UndoKind::Update) {
            UndoState::ToPurge
        } else if self.pages.len() == 1 && free < reuse_limit {
            UndoState::Cached
        } else {
            UndoState::ToFree
        };
        self.state = state;
        self.trx_no = trx_no;
        let mut mtr = Mtr::new(space);
        write_seg_header(mtr.page_mut(self.hdr_page)?, self);
        mtr.commit();
        Ok(state)
    }

    /// Release every page of the log inside `mtr`. The caller clears the
    /// segment's slot entry in the same mtr.
    pub fn free_all_pages(&self, mtr: &mut Mtr<'_>) {
        for &page in &self.pages {
            mtr.free_page(page);
        }
    }

    /// Locator of the oldest record, if any.
    pub fn first_record(&self, space: &UndoTablespace) -> Result<Option<(PageNo, u16)>> {
        let first = self.first_rec_offset(self.hdr_page);
        let free = read_free(space, self.hdr_page)?;
        if free > first {
            return Ok(Some((self.hdr_page, first)));
        }
        // Header page may hold no records after a partial truncation.
        match self.pages.get(1) {
            Some(&page) => Ok(Some((page, PAGE_HDR_END))),
            None => Ok(None),
        }
    }

    /// Locator of the record following `(page, offset)` in oldest-first
    /// order.
    pub fn next_record(
        &self,
        space: &UndoTablespace,
        page: PageNo,
        offset: u16,
    ) -> Result<Option<(PageNo, u16)>> {
        let bytes = space
            .read_page(page)
            .ok_or(QuarryError::MissingHistory { roll_ptr: 0 })?;
        let len = read_u16_le(&bytes, offset as usize).ok_or_else(|| QuarryError::CorruptUndo {
            detail: "record slot out of page bounds".into(),
        })?;
        let next = offset + REC_SLOT_HDR + len;
        if next < page_free_offset(&bytes) {
            return Ok(Some((page, next)));
        }
        let link = page_next(&bytes);
        if link == PAGE_NO_NULL {
            return Ok(None);
        }
        let free = read_free(space, link)?;
        if free > PAGE_HDR_END {
            Ok(Some((link, PAGE_HDR_END)))
        } else {
            Ok(None)
        }
    }

    /// Parse the record at `(page, offset)`.
    pub fn record_at(&self, space: &UndoTablespace, page: PageNo, offset: u16) -> Result<UndoRec> {
        let bytes = space
            .read_page(page)
            .ok_or(QuarryError::MissingHistory { roll_ptr: 0 })?;
        read_record_at(&bytes, offset)
    }

    /// Rebuild a log image from its on-page form (recovery path).
    pub fn recover(space: &UndoTablespace, slot: u16, hdr_page: PageNo) -> Result<Self> {
        let bytes = space
            .read_page(hdr_page)
            .ok_or_else(|| QuarryError::CorruptPage {
                page: hdr_page,
                detail: "undo slot points at an unallocated page".into(),
            })?;
        let hdr = read_seg_header(hdr_page, &bytes)?;

        let mut pages = vec![hdr_page];
        let mut link = page_next(&bytes);
        while link != PAGE_NO_NULL {
            let next_bytes = space
                .read_page(link)
                .ok_or_else(|| QuarryError::CorruptPage {
                    page: link,
                    detail: "broken undo page list".into(),
                })?;
            pages.push(link);
            link = page_next(&next_bytes);
        }

        let mut log = Self {
            slot,
            kind: hdr.kind,
            state: hdr.state,
            trx_id: hdr.trx_id,
            trx_no: hdr.trx_no,
            del_marks: hdr.del_marks,
            xid: hdr.xid,
            hdr_page,
            pages,
            top: None,
        };
        let last = *log.pages.last().unwrap_or(&hdr_page);
        let last_bytes = space
            .read_page(last)
            .ok_or_else(|| QuarryError::CorruptPage {
                page: last,
                detail: "broken undo page list".into(),
            })?;
        log.top = last_record_in_page(last, &last_bytes, log.first_rec_offset(last))?;
        if log.top.is_none() && last != hdr_page {
            return Err(QuarryError::CorruptPage {
                page: last,
                detail: "empty continuation page in undo log".into(),
            });
        }
        Ok(log)
    }
}

/// Resolve a roll pointer to its undo record.
///
/// A pointer into a freed page or past the owning page's free offset means
/// the record has been purged: [`QuarryError::MissingHistory`].
pub fn read_undo_rec(space: &UndoTablespace, ptr: RollPtr) -> Result<UndoRec> {
    let missing = QuarryError::MissingHistory {
        roll_ptr: ptr.raw(),
    };
    let Some(bytes) = space.read_page(ptr.page()) else {
        return Err(missing);
    };
    if ptr.offset() >= page_free_offset(&bytes) {
        return Err(missing);
    }
    read_record_at(&bytes, ptr.offset())
}

fn read_free(space: &UndoTablespace, page: PageNo) -> Result<u16> {
    space
        .with_page(page, page_free_offset)
        .ok_or_else(|| QuarryError::CorruptPage {
            page,
            detail: "undo page vanished mid-walk".into(),
        })
}

fn read_record_at(bytes: &[u8], offset: u16) -> Result<UndoRec> {
    let at = offset as usize;
    let len = read_u16_le(bytes, at).ok_or_else(|| QuarryError::CorruptUndo {
        detail: "record slot out of page bounds".into(),
    })? as usize;
    let start = at + REC_SLOT_HDR as usize;
    let payload = bytes
        .get(start..start + len)
        .ok_or_else(|| QuarryError::CorruptUndo {
            detail: "record payload out of page bounds".into(),
        })?;
    UndoRec::parse(payload)
}

/// Newest record in a page, found by a forward scan from `first_off`.
fn last_record_in_page(page: PageNo, bytes: &[u8], first_off: u16) -> Result<Option<TopRec>> {
    let free = page_free_offset(bytes);
    let mut at = first_off;
    let mut last = None;
    while at < free {
        let rec = read_record_at(bytes, at)?;
        last = Some((at, rec.undo_no));
        let len = read_u16_le(bytes, at as usize).unwrap_or(0);
        at += REC_SLOT_HDR + len;
    }
    Ok(last.map(|(offset, undo_no)| TopRec {
        page,
        offset,
        undo_no,
    }))
}

struct SegHeader {
    kind: UndoKind,
    state: UndoState,
    del_marks: bool,
    trx_id: TrxId,
    trx_no: Option<TrxNo>,
    xid: Option<Vec<u8>>,
}

fn write_seg_header(bytes: &mut [u8], log: &UndoLog) {
    let base = PAGE_HDR_END as usize;
    bytes[base + SEG_OFF_KIND] = match log.kind {
        UndoKind::Insert => 1,
        UndoKind::Update => 2,
    };
    bytes[base + SEG_OFF_STATE] = log.state.tag();
    bytes[base + SEG_OFF_DEL_MARKS] = u8::from(log.del_marks);
    let xid = log.xid.as_deref().unwrap_or(&[]);
    bytes[base + SEG_OFF_XID_LEN] = xid.len() as u8;
    put_u64_le(bytes, base + SEG_OFF_TRX_ID, log.trx_id.get());
    put_u64_le(
        bytes,
        base + SEG_OFF_TRX_NO,
        log.trx_no.map_or(0, TrxNo::get),
    );
    bytes[base + SEG_OFF_XID..base + SEG_OFF_XID + MAX_XID_LEN].fill(0);
    bytes[base + SEG_OFF_XID..base + SEG_OFF_XID + xid.len()].copy_from_slice(xid);
}

fn read_seg_header(page: PageNo, bytes: &[u8]) -> Result<SegHeader> {
    let base = PAGE_HDR_END as usize;
    let corrupt = |detail: &str| QuarryError::CorruptPage {
        page,
        detail: detail.into(),
    };
    let kind = match bytes.get(base + SEG_OFF_KIND) {
        Some(1) => UndoKind::Insert,
        Some(2) => UndoKind::Update,
        _ => return Err(corrupt("bad undo log kind")),
    };
    let state = bytes
        .get(base + SEG_OFF_STATE)
        .copied()
        .and_then(UndoState::from_tag)
        .ok_or_else(|| corrupt("bad undo log state"))?;
    let del_marks = bytes.get(base + SEG_OFF_DEL_MARKS) == Some(&1);
    let xid_len = *bytes
        .get(base + SEG_OFF_XID_LEN)
        .ok_or_else(|| corrupt("short segment header"))? as usize;
    if xid_len > MAX_XID_LEN {
        return Err(corrupt("oversized XID"));
    }
    let trx_id = read_u64_le(bytes, base + SEG_OFF_TRX_ID)
        .and_then(TrxId::new)
        .ok_or_else(|| corrupt("bad trx id in segment header"))?;
    let trx_no_raw =
        read_u64_le(bytes, base + SEG_OFF_TRX_NO).ok_or_else(|| corrupt("short segment header"))?;
    let trx_no = (trx_no_raw != 0).then(|| TrxNo::new(trx_no_raw));
    let xid = if xid_len > 0 {
        Some(bytes[base + SEG_OFF_XID..base + SEG_OFF_XID + xid_len].to_vec())
    } else {
        None
    };
    Ok(SegHeader {
        kind,
        state,
        del_marks,
        trx_id,
        trx_no,
        xid,
    })
}
