//! Purge coordinator.
//!
//! Consumes committed update-undo history strictly in commit order across
//! every rollback segment: a binary heap keyed by the oldest history
//! entry's serialization number picks the next segment in O(log R). A batch
//! stops at its page budget or at the purge view's floor, whichever comes
//! first; stopping early is the normal termination path, not an error.
//!
//! Record consumption and segment truncation are decoupled: a consumed
//! history entry is queued, and the queued segments are physically freed on
//! a fixed cadence of segment visits, bounding mutex contention.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use parking_lot::{Mutex, RwLock};
use quarry_error::Result;
use quarry_types::{PageNo, RollPtr, RsegId, TrxNo};

use crate::rseg::HistoryEntry;
use crate::row_purge::row_purge_step;
use crate::sys::{MvccConfig, TransactionSystem};
use crate::view::ReadView;

/// Decides when history pressure warrants running a purge batch.
///
/// The pressure model: below the low watermark purge stays idle; above it
/// the batch budget grows with the backlog so purge can catch up without
/// monopolizing a quiet system.
#[derive(Debug, Clone)]
pub struct PurgeScheduler {
    low_watermark: usize,
    batch_pages: u32,
}

impl PurgeScheduler {
    #[must_use]
    pub fn new(config: &MvccConfig) -> Self {
        Self {
            low_watermark: config.purge_low_watermark,
            batch_pages: config.purge_batch_pages,
        }
    }

    /// Whether the backlog justifies a batch right now.
    #[must_use]
    pub fn should_run(&self, history_len: usize) -> bool {
        history_len >= self.low_watermark
    }

    /// Page budget for the next batch, scaled up under backlog pressure.
    #[must_use]
    pub fn budget(&self, history_len: usize) -> u32 {
        if self.low_watermark > 0 && history_len >= self.low_watermark * 4 {
            self.batch_pages * 4
        } else {
            self.batch_pages
        }
    }
}

/// A partially consumed history entry carried across batch boundaries.
#[derive(Debug)]
struct PurgeCursor {
    rseg_id: RsegId,
    entry: HistoryEntry,
    /// Next record to hand to the row purge executor.
    next: Option<(PageNo, u16)>,
}

#[derive(Debug)]
struct PurgeState {
    cursor: Option<PurgeCursor>,
    /// Fully consumed entries awaiting segment truncation.
    consumed: Vec<(RsegId, HistoryEntry)>,
    /// Segment visits since startup; drives the truncation cadence.
    visits: u64,
}

/// Purge-side state of the transaction system.
#[derive(Debug)]
pub struct PurgeSys {
    /// The purge view: the oldest snapshot any reader still depends on.
    /// Shared by chain walkers, exclusive only while a batch advances it.
    view: RwLock<ReadView>,
    state: Mutex<PurgeState>,
}

impl PurgeSys {
    pub(crate) fn new(initial: ReadView) -> Self {
        Self {
            view: RwLock::new(initial),
            state: Mutex::new(PurgeState {
                cursor: None,
                consumed: Vec::new(),
                visits: 0,
            }),
        }
    }

    pub(crate) fn floor(&self) -> TrxNo {
        self.view.read().low_limit_no()
    }
}

impl TransactionSystem {
    /// History entries awaiting purge, across every rollback segment.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.rsegs.iter().map(|r| r.history_len()).sum()
    }

    /// The serialization-number floor below which versions are unobservable.
    #[must_use]
    pub fn purge_floor(&self) -> TrxNo {
        self.purge.floor()
    }

    /// Run one purge batch bounded by `page_budget` undo pages.
    ///
    /// Returns the number of pages handled. Zero means the floor or an
    /// empty history stopped the batch immediately.
    pub fn purge_run_batch(&self, page_budget: u32) -> Result<u32> {
        self.ensure_usable()?;

        // Advance the purge view to the oldest still-open reader snapshot,
        // or to a fresh one when no reader holds a view.
        let advanced = self
            .oldest_open_view()
            .unwrap_or_else(|| self.snapshot_view(None));
        let floor = advanced.low_limit_no();
        *self.purge.view.write() = advanced;
        tracing::debug!(floor = %floor, history = self.history_len(), "purge batch starting");

        let mut state = self.purge.state.lock();
        let mut pages_handled = 0u32;
        let mut last_page: Option<PageNo> = None;

        // Heap over each segment's oldest history entry.
        let mut heap: BinaryHeap<Reverse<(TrxNo, usize)>> = self
            .rsegs
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.oldest_history_no().map(|no| Reverse((no, i))))
            .collect();

        loop {
            // Resume a carried-over cursor before touching the heap.
            let mut cursor = match state.cursor.take() {
                Some(cursor) => cursor,
                None => {
                    let Some(&Reverse((no, idx))) = heap.peek() else {
                        break;
                    };
                    if no >= floor {
                        break;
                    }
                    heap.pop();
                    let rseg = &self.rsegs[idx];
                    let Some(entry) = rseg.take_oldest_history(floor) else {
                        continue;
                    };
                    if let Some(next_no) = rseg.oldest_history_no() {
                        heap.push(Reverse((next_no, idx)));
                    }
                    let next = entry.log.first_record(&self.space)?;
                    PurgeCursor {
                        rseg_id: rseg.id,
                        entry,
                        next,
                    }
                }
            };

            // Consume the log record by record, page-budgeted.
            while let Some((page, offset)) = cursor.next {
                if last_page != Some(page) {
                    if pages_handled >= page_budget {
                        break;
                    }
                    pages_handled += 1;
                    last_page = Some(page);
                }
                let rec = cursor.entry.log.record_at(&self.space, page, offset)?;
                let slot_ptr = RollPtr::new(false, cursor.rseg_id, page, offset);
                row_purge_step(self, &rec, slot_ptr)?;
                cursor.next = cursor.entry.log.next_record(&self.space, page, offset)?;
            }
            let exhausted = cursor.next.is_none();
            if !exhausted {
                // Budget ran out mid-log; resume here next batch.
                state.cursor = Some(cursor);
                break;
            }

            state.consumed.push((cursor.rseg_id, cursor.entry));
            state.visits += 1;
            if state.visits % u64::from(self.config.truncate_cadence) == 0 {
                self.truncate_consumed(&mut state.consumed)?;
            }
            if pages_handled >= page_budget {
                break;
            }
        }

        // End-of-batch truncation keeps the backlog from outliving quiet
        // periods; mid-batch freeing still follows the cadence.
        self.truncate_consumed(&mut state.consumed)?;
        tracing::debug!(pages = pages_handled, "purge batch done");
        Ok(pages_handled)
    }

    /// Physically free the segments of fully consumed history entries.
    fn truncate_consumed(&self, consumed: &mut Vec<(RsegId, HistoryEntry)>) -> Result<()> {
        for (rseg_id, entry) in consumed.drain(..) {
            let rseg = self.rseg(rseg_id);
            tracing::debug!(rseg = %rseg_id, trx_no = %entry.trx_no, "freeing purged undo segment");
            rseg.release_history(&self.space, entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(low: usize, pages: u32) -> MvccConfig {
        MvccConfig {
            purge_low_watermark: low,
            purge_batch_pages: pages,
            ..MvccConfig::default()
        }
    }

    #[test]
    fn test_scheduler_idle_below_watermark() {
        let sched = PurgeScheduler::new(&config(8, 16));
        assert!(!sched.should_run(0));
        assert!(!sched.should_run(7));
        assert!(sched.should_run(8));
    }

    #[test]
    fn test_scheduler_scales_budget_under_pressure() {
        let sched = PurgeScheduler::new(&config(8, 16));
        assert_eq!(sched.budget(8), 16);
        assert_eq!(sched.budget(31), 16);
        assert_eq!(sched.budget(32), 64);
    }
}
