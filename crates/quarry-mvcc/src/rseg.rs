//! Rollback segments.
//!
//! A rollback segment owns a fixed array of undo slots, a page quota shared
//! by all logs in the segment, small caches of recyclable log headers, and
//! the history list of committed update logs awaiting purge, ordered by
//! serialization number.
//!
//! Segment state is persisted in a header page (slot array plus sizing) so
//! that recovery can rebuild every log from the tablespace alone.

use std::collections::VecDeque;

use parking_lot::Mutex;
use quarry_error::{QuarryError, Result};
use quarry_types::encoding::{put_u16_le, put_u32_le, read_u16_le, read_u32_le};
use quarry_types::{PageNo, RollPtr, RsegId, TrxId, TrxNo, UndoNo, PAGE_NO_NULL};

use crate::mtr::{Mtr, UndoTablespace, PAGE_HDR_END, PAGE_KIND_RSEG_HDR};
use crate::undo_log::{SegQuota, UndoKind, UndoLog, UndoState};
use crate::undo_rec::UndoRec;

// Rseg header page layout, relative to `PAGE_HDR_END`.
const RSEG_OFF_ID: usize = 0;
const RSEG_OFF_MAX_PAGES: usize = 4;
const RSEG_OFF_N_SLOTS: usize = 8;
const RSEG_OFF_SLOTS: usize = 12;

/// Undo slots per rollback segment.
pub const N_UNDO_SLOTS: u16 = 64;

/// Free-offset threshold under which a finished single-page log is cached
/// for reuse instead of being freed or purged as a whole segment.
pub const LOG_REUSE_LIMIT: u16 = (crate::mtr::PAGE_SIZE / 4) as u16;

/// A committed update log waiting in the history list.
#[derive(Debug)]
pub struct HistoryEntry {
    pub trx_no: TrxNo,
    pub log: UndoLog,
}

#[derive(Debug)]
struct RsegInner {
    quota: SegQuota,
    /// Persisted slot array: header page of the log owning each slot.
    slots: Vec<Option<PageNo>>,
    cached_insert: VecDeque<UndoLog>,
    cached_update: VecDeque<UndoLog>,
    /// Committed update logs, oldest serialization number first.
    history: VecDeque<HistoryEntry>,
}

/// One rollback segment.
#[derive(Debug)]
pub struct Rseg {
    pub id: RsegId,
    pub hdr_page: PageNo,
    inner: Mutex<RsegInner>,
    /// Serializes commits on this segment: serialization-number assignment
    /// and the history insertion happen under it as one unit, keeping the
    /// history list sorted. Never taken while `inner` is held.
    commit_order: Mutex<()>,
}

impl Rseg {
    /// Allocate and persist a fresh segment.
    pub fn create(space: &UndoTablespace, id: RsegId, max_pages: u32) -> Result<Self> {
        let mut mtr = Mtr::new(space);
        let hdr_page = mtr.alloc_page(PAGE_KIND_RSEG_HDR)?;
        {
            let bytes = mtr.page_mut(hdr_page)?;
            let base = PAGE_HDR_END as usize;
            put_u32_le(bytes, base + RSEG_OFF_ID, u32::from(id.get()));
            put_u32_le(bytes, base + RSEG_OFF_MAX_PAGES, max_pages);
            put_u16_le(bytes, base + RSEG_OFF_N_SLOTS, N_UNDO_SLOTS);
            for slot in 0..N_UNDO_SLOTS {
                put_u32_le(
                    bytes,
                    base + RSEG_OFF_SLOTS + slot as usize * 4,
                    PAGE_NO_NULL,
                );
            }
        }
        mtr.commit();
        Ok(Self {
            id,
            hdr_page,
            inner: Mutex::new(RsegInner {
                quota: SegQuota {
                    curr_pages: 1,
                    max_pages,
                },
                slots: vec![None; N_UNDO_SLOTS as usize],
                cached_insert: VecDeque::new(),
                cached_update: VecDeque::new(),
                history: VecDeque::new(),
            }),
            commit_order: Mutex::new(()),
        })
    }

    /// Rebuild a segment from its header page.
    ///
    /// Logs found `Active` or `Prepared` are returned to the caller so the
    /// transaction system can resurrect their owners; everything else is
    /// filed into the cache or history list here.
    pub fn recover(space: &UndoTablespace, hdr_page: PageNo) -> Result<(Self, Vec<UndoLog>)> {
        let bytes = space
            .read_page(hdr_page)
            .ok_or_else(|| QuarryError::CorruptPage {
                page: hdr_page,
                detail: "rollback segment header vanished".into(),
            })?;
        let base = PAGE_HDR_END as usize;
        let corrupt = |detail: &str| QuarryError::CorruptPage {
            page: hdr_page,
            detail: detail.into(),
        };
        let raw_id =
            read_u32_le(&bytes, base + RSEG_OFF_ID).ok_or_else(|| corrupt("short rseg header"))?;
        let id = u8::try_from(raw_id)
            .ok()
            .and_then(RsegId::new)
            .ok_or_else(|| corrupt("rseg id out of range"))?;
        let max_pages = read_u32_le(&bytes, base + RSEG_OFF_MAX_PAGES)
            .ok_or_else(|| corrupt("short rseg header"))?;
        let n_slots = read_u16_le(&bytes, base + RSEG_OFF_N_SLOTS)
            .ok_or_else(|| corrupt("short rseg header"))?;
        if n_slots == 0 || n_slots > 1024 {
            return Err(corrupt("implausible slot count"));
        }

        let mut inner = RsegInner {
            quota: SegQuota {
                curr_pages: 1,
                max_pages,
            },
            slots: vec![None; n_slots as usize],
            cached_insert: VecDeque::new(),
            cached_update: VecDeque::new(),
            history: VecDeque::new(),
        };
        let mut live = Vec::new();
        let mut to_free = Vec::new();
        for slot in 0..n_slots {
            let page = read_u32_le(&bytes, base + RSEG_OFF_SLOTS + slot as usize * 4)
                .ok_or_else(|| corrupt("slot array out of page bounds"))?;
            if page == PAGE_NO_NULL {
                continue;
            }
            let log = UndoLog::recover(space, slot, page)?;
            inner.slots[slot as usize] = Some(page);
            inner.quota.curr_pages += log.pages.len() as u32;
            match log.state {
                UndoState::Cached => match log.kind {
                    UndoKind::Insert => inner.cached_insert.push_back(log),
                    UndoKind::Update => inner.cached_update.push_back(log),
                },
                UndoState::ToPurge => {
                    let trx_no = log.trx_no.ok_or_else(|| {
                        corrupt("purgeable log without a serialization number")
                    })?;
                    inner.history.push_back(HistoryEntry { trx_no, log });
                }
                UndoState::ToFree => to_free.push(log),
                UndoState::Active | UndoState::Prepared => live.push(log),
            }
        }
        inner
            .history
            .make_contiguous()
            .sort_by_key(|entry| entry.trx_no);

        let rseg = Self {
            id,
            hdr_page,
            inner: Mutex::new(inner),
            commit_order: Mutex::new(()),
        };
        // Commit completed but the insert-log cleanup did not; finish it now.
        for log in to_free {
            tracing::debug!(rseg = %rseg.id, slot = log.slot, "freeing leftover insert-undo log");
            rseg.free_log(space, &log)?;
        }
        Ok((rseg, live))
    }

    /// Hand out an undo log of `kind` for `trx_id`, reusing a cached header
    /// when one is available.
    ///
    /// Fails soft with [`QuarryError::UndoSlotsExhausted`] when every slot
    /// is taken and nothing is cached.
    pub fn assign_log(
        &self,
        space: &UndoTablespace,
        kind: UndoKind,
        trx_id: TrxId,
    ) -> Result<UndoLog> {
        let mut inner = self.inner.lock();
        let cache = match kind {
            UndoKind::Insert => &mut inner.cached_insert,
            UndoKind::Update => &mut inner.cached_update,
        };
        if let Some(mut log) = cache.pop_front() {
            log.reuse(space, trx_id)?;
            return Ok(log);
        }

        let slot = inner
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(QuarryError::UndoSlotsExhausted { rseg: self.id })?
            as u16;
        if inner.quota.curr_pages + 1 > inner.quota.max_pages {
            return Err(QuarryError::RsegOutOfSpace { rseg: self.id });
        }
        let mut mtr = Mtr::new(space);
        let log = UndoLog::create(&mut mtr, slot, kind, trx_id)?;
        write_slot(&mut mtr, self.hdr_page, slot, log.hdr_page)?;
        mtr.commit();
        inner.slots[slot as usize] = Some(log.hdr_page);
        inner.quota.curr_pages += 1;
        Ok(log)
    }

    /// Append a record to `log` under the segment's page quota.
    pub fn append(
        &self,
        space: &UndoTablespace,
        log: &mut UndoLog,
        rec: &UndoRec,
    ) -> Result<RollPtr> {
        let mut inner = self.inner.lock();
        let quota = &mut inner.quota;
        log.add_record(space, quota, self.id, rec)
    }

    /// Pop records with `undo_no >= limit` from `log` (rollback path).
    pub fn truncate(
        &self,
        space: &UndoTablespace,
        log: &mut UndoLog,
        limit: UndoNo,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let quota = &mut inner.quota;
        log.truncate_end(space, quota, limit)
    }

    /// Assign a serialization number and file `log` as one atomic unit
    /// with respect to this segment's commit order.
    ///
    /// `assign_no` runs under the segment's commit-order mutex, so two
    /// committers on the same segment cannot file history entries out of
    /// serialization-number order.
    pub fn finish_log_ordered(
        &self,
        space: &UndoTablespace,
        log: UndoLog,
        assign_no: impl FnOnce() -> TrxNo,
    ) -> Result<(TrxNo, UndoState)> {
        let _order = self.commit_order.lock();
        let trx_no = assign_no();
        let state = self.finish_log(space, log, Some(trx_no))?;
        Ok((trx_no, state))
    }

    /// File a finished log according to its post-commit state.
    ///
    /// `trx_no` is the owner's serialization number, `None` for rollbacks
    /// and for insert logs. Returns the state the log was left in. Commits
    /// go through [`Rseg::finish_log_ordered`] instead, which keeps the
    /// history list sorted under concurrency.
    pub fn finish_log(
        &self,
        space: &UndoTablespace,
        mut log: UndoLog,
        trx_no: Option<TrxNo>,
    ) -> Result<UndoState> {
        let state = log.set_state_at_finish(space, trx_no, LOG_REUSE_LIMIT)?;
        match state {
            UndoState::Cached => {
                let mut inner = self.inner.lock();
                match log.kind {
                    UndoKind::Insert => inner.cached_insert.push_back(log),
                    UndoKind::Update => inner.cached_update.push_back(log),
                }
            }
            UndoState::ToFree => self.free_log(space, &log)?,
            UndoState::ToPurge => {
                let trx_no = trx_no.ok_or_else(|| QuarryError::FatalState {
                    detail: "update log sent to purge without a serialization number".into(),
                })?;
                let mut inner = self.inner.lock();
                debug_assert!(inner
                    .history
                    .back()
                    .map_or(true, |last| last.trx_no <= trx_no));
                inner.history.push_back(HistoryEntry { trx_no, log });
            }
            UndoState::Active | UndoState::Prepared => {
                return Err(QuarryError::FatalState {
                    detail: "finished log left in a live state".into(),
                })
            }
        }
        Ok(state)
    }

    /// Free a log's pages and release its slot, atomically.
    pub fn free_log(&self, space: &UndoTablespace, log: &UndoLog) -> Result<()> {
        let mut mtr = Mtr::new(space);
        log.free_all_pages(&mut mtr);
        write_slot(&mut mtr, self.hdr_page, log.slot, PAGE_NO_NULL)?;
        mtr.commit();
        let mut inner = self.inner.lock();
        inner.slots[log.slot as usize] = None;
        inner.quota.curr_pages -= log.pages.len() as u32;
        Ok(())
    }

    /// Serialization number of the oldest history entry.
    pub fn oldest_history_no(&self) -> Option<TrxNo> {
        self.inner.lock().history.front().map(|e| e.trx_no)
    }

    /// Detach the oldest history entry if its serialization number is below
    /// `floor`. The caller owns the entry until it hands it back through
    /// [`Rseg::release_history`].
    pub fn take_oldest_history(&self, floor: TrxNo) -> Option<HistoryEntry> {
        let mut inner = self.inner.lock();
        if inner.history.front().is_some_and(|e| e.trx_no < floor) {
            inner.history.pop_front()
        } else {
            None
        }
    }

    /// Free the segment pages of a fully consumed history entry.
    pub fn release_history(&self, space: &UndoTablespace, entry: HistoryEntry) -> Result<()> {
        self.free_log(space, &entry.log)
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Serialization number of the newest history entry (recovery
    /// watermark).
    pub fn newest_history_no(&self) -> Option<TrxNo> {
        self.inner.lock().history.back().map(|e| e.trx_no)
    }

    /// Largest transaction id recorded by any log still owned by this
    /// segment (recovery watermark).
    pub fn max_recorded_trx_id(&self) -> Option<TrxId> {
        let inner = self.inner.lock();
        inner
            .history
            .iter()
            .map(|e| e.log.trx_id)
            .chain(inner.cached_insert.iter().map(|l| l.trx_id))
            .chain(inner.cached_update.iter().map(|l| l.trx_id))
            .max()
    }

    /// Pages currently owned by the segment, header included.
    pub fn curr_pages(&self) -> u32 {
        self.inner.lock().quota.curr_pages
    }
}

fn write_slot(mtr: &mut Mtr<'_>, hdr_page: PageNo, slot: u16, page: PageNo) -> Result<()> {
    let bytes = mtr.page_mut(hdr_page)?;
    put_u32_le(
        bytes,
        PAGE_HDR_END as usize + RSEG_OFF_SLOTS + slot as usize * 4,
        page,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_types::Value;

    fn trx(n: u64) -> TrxId {
        TrxId::new(n).unwrap()
    }

    fn rseg(space: &UndoTablespace) -> Rseg {
        Rseg::create(space, RsegId::new(3).unwrap(), 128).unwrap()
    }

    fn ins_rec(no: u64) -> UndoRec {
        UndoRec::insert(UndoNo::new(no), 9, vec![Value::Integer(no as i64)])
    }

    #[test]
    fn test_assign_append_and_cache_roundtrip() {
        let space = UndoTablespace::new(256);
        let rs = rseg(&space);
        let mut log = rs.assign_log(&space, UndoKind::Insert, trx(1)).unwrap();
        let first_hdr = log.hdr_page;
        rs.append(&space, &mut log, &ins_rec(0)).unwrap();
        assert_eq!(rs.finish_log(&space, log, None).unwrap(), UndoState::Cached);

        // The cached header is handed back on the next assignment.
        let log = rs.assign_log(&space, UndoKind::Insert, trx(2)).unwrap();
        assert_eq!(log.hdr_page, first_hdr);
        assert_eq!(log.trx_id, trx(2));
        assert!(log.top.is_none());
    }

    #[test]
    fn test_slots_exhaust_soft() {
        let space = UndoTablespace::new(4096);
        let rs = rseg(&space);
        let mut held = Vec::new();
        for i in 0..N_UNDO_SLOTS {
            held.push(
                rs.assign_log(&space, UndoKind::Update, trx(u64::from(i) + 1))
                    .unwrap(),
            );
        }
        let err = rs
            .assign_log(&space, UndoKind::Update, trx(999))
            .unwrap_err();
        assert!(matches!(err, QuarryError::UndoSlotsExhausted { .. }));
    }

    #[test]
    fn test_history_ordered_and_released() {
        let space = UndoTablespace::new(256);
        let rs = rseg(&space);
        for no in [5u64, 7, 9] {
            let mut log = rs.assign_log(&space, UndoKind::Update, trx(no)).unwrap();
            // Grow past the reuse limit so finish files it into history.
            while log.pages.len() < 2 {
                let rec = UndoRec::insert(UndoNo::ZERO, 9, vec![Value::Blob(vec![0u8; 900])]);
                rs.append(&space, &mut log, &rec).unwrap();
            }
            rs.finish_log(&space, log, Some(TrxNo::new(no))).unwrap();
        }
        assert_eq!(rs.history_len(), 3);
        assert_eq!(rs.oldest_history_no(), Some(TrxNo::new(5)));

        // Nothing below the floor stays put.
        assert!(rs.take_oldest_history(TrxNo::new(5)).is_none());
        let entry = rs.take_oldest_history(TrxNo::new(8)).unwrap();
        assert_eq!(entry.trx_no, TrxNo::new(5));
        let pages_before = rs.curr_pages();
        rs.release_history(&space, entry).unwrap();
        assert!(rs.curr_pages() < pages_before);
        assert_eq!(rs.oldest_history_no(), Some(TrxNo::new(7)));
    }

    #[test]
    fn test_recover_restores_caches_history_and_live_logs() {
        let space = UndoTablespace::new(256);
        let hdr_page;
        {
            let rs = rseg(&space);
            hdr_page = rs.hdr_page;

            // A cached insert log.
            let mut log = rs.assign_log(&space, UndoKind::Insert, trx(1)).unwrap();
            rs.append(&space, &mut log, &ins_rec(0)).unwrap();
            rs.finish_log(&space, log, None).unwrap();

            // A purgeable update log.
            let mut log = rs.assign_log(&space, UndoKind::Update, trx(2)).unwrap();
            while log.pages.len() < 2 {
                let rec = UndoRec::insert(UndoNo::ZERO, 9, vec![Value::Blob(vec![0u8; 900])]);
                rs.append(&space, &mut log, &rec).unwrap();
            }
            rs.finish_log(&space, log, Some(TrxNo::new(11))).unwrap();

            // A still-active log.
            let mut log = rs.assign_log(&space, UndoKind::Update, trx(3)).unwrap();
            rs.append(&space, &mut log, &ins_rec(1)).unwrap();
        }

        let restarted = UndoTablespace::from_snapshot(256, space.snapshot());
        let (rs, live) = Rseg::recover(&restarted, hdr_page).unwrap();
        assert_eq!(rs.id, RsegId::new(3).unwrap());
        assert_eq!(rs.history_len(), 1);
        assert_eq!(rs.oldest_history_no(), Some(TrxNo::new(11)));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].trx_id, trx(3));
        assert_eq!(live[0].state, UndoState::Active);

        // The cached header is reusable after restart.
        let log = rs.assign_log(&restarted, UndoKind::Insert, trx(4)).unwrap();
        assert_eq!(log.kind, UndoKind::Insert);
    }
}
