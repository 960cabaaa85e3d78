//! The transaction system context.
//!
//! One explicitly constructed object replaces the classic trx-sys and
//! purge-sys singletons: rollback segments, the transaction table, the id
//! and serialization-number counters, the view registry, the purge side,
//! and the table store all hang off a [`TransactionSystem`] built at
//! startup and injected into every caller.
//!
//! The trx-table mutex guards only short, non-blocking critical sections;
//! anything that can touch pages releases it first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quarry_error::{QuarryError, Result};
use quarry_types::{RsegId, TrxId, TrxNo, UndoNo};

use crate::index::TableStore;
use crate::mtr::{page_kind, UndoTablespace, PAGE_KIND_RSEG_HDR};
use crate::purge::PurgeSys;
use crate::rseg::Rseg;
use crate::trx::{CommitEvent, Trx, TrxState};
use crate::undo_log::{UndoKind, UndoLog, UndoState};
use crate::view::ReadView;

/// Engine configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct MvccConfig {
    /// Rollback segments to create.
    pub n_rsegs: u8,
    /// Page cap per rollback segment.
    pub rseg_max_pages: u32,
    /// Page cap for the whole undo tablespace.
    pub space_max_pages: u32,
    /// Default page budget of one purge batch.
    pub purge_batch_pages: u32,
    /// History length below which purge stays idle.
    pub purge_low_watermark: usize,
    /// Segment visits between history truncation attempts.
    pub truncate_cadence: u32,
    /// Pessimistic-delete retry bound.
    pub delete_retries: u32,
    /// Sleep between pessimistic-delete retries.
    pub delete_backoff_ms: u64,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            n_rsegs: 4,
            rseg_max_pages: 1024,
            space_max_pages: 8192,
            purge_batch_pages: 32,
            purge_low_watermark: 8,
            truncate_cadence: 4,
            delete_retries: 3,
            delete_backoff_ms: 5,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TrxTable {
    /// Next serialization number to assign.
    pub(crate) next_no: u64,
    /// Ids of transactions currently ACTIVE or PREPARED.
    pub(crate) active: BTreeSet<TrxId>,
    /// Serialization numbers assigned but not yet past the durability
    /// point; the purge floor may not pass them.
    pub(crate) serializing: BTreeSet<TrxNo>,
}

/// What startup recovery found and did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Transactions found PREPARED, resurrected and awaiting a decision.
    pub prepared: Vec<TrxId>,
    /// Transactions found ACTIVE and rolled back.
    pub rolled_back: Vec<TrxId>,
    /// History entries reloaded into the purge backlog.
    pub history_entries: usize,
}

/// The process-wide transaction system.
#[derive(Debug)]
pub struct TransactionSystem {
    pub(crate) config: MvccConfig,
    pub(crate) space: UndoTablespace,
    pub(crate) tables: TableStore,
    pub(crate) rsegs: Vec<Arc<Rseg>>,
    pub(crate) purge: PurgeSys,
    pub(crate) trx_table: Mutex<TrxTable>,
    next_id: AtomicU64,
    next_rseg: AtomicUsize,
    views: Mutex<Vec<Weak<ReadView>>>,
    listeners: Mutex<Vec<mpsc::Sender<CommitEvent>>>,
    /// Externally stored column registry: live overflow blob ids.
    externs: Mutex<BTreeSet<u64>>,
    next_extern: AtomicU64,
    /// Recovered PREPARED transactions awaiting commit/rollback.
    recovered: Mutex<Vec<Trx>>,
    poisoned: AtomicBool,
}

impl TransactionSystem {
    /// Build a fresh system: empty tablespace, `n_rsegs` rollback segments.
    pub fn new(config: MvccConfig) -> Result<Self> {
        if config.n_rsegs == 0 {
            return Err(QuarryError::Config {
                detail: "at least one rollback segment is required".into(),
            });
        }
        let space = UndoTablespace::new(config.space_max_pages);
        let mut rsegs = Vec::with_capacity(config.n_rsegs as usize);
        for i in 0..config.n_rsegs {
            let id = RsegId::new(i).ok_or_else(|| QuarryError::FatalState {
                detail: format!("configured rollback segment id {i} out of domain"),
            })?;
            rsegs.push(Arc::new(Rseg::create(&space, id, config.rseg_max_pages)?));
        }
        tracing::debug!(n_rsegs = rsegs.len(), "transaction system initialized");
        Ok(Self {
            purge: PurgeSys::new(ReadView::new(TrxId::MIN, Vec::new(), TrxNo::new(1), None)),
            config,
            space,
            tables: TableStore::new(),
            rsegs,
            trx_table: Mutex::new(TrxTable {
                next_no: 1,
                active: BTreeSet::new(),
                serializing: BTreeSet::new(),
            }),
            next_id: AtomicU64::new(1),
            next_rseg: AtomicUsize::new(0),
            views: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            externs: Mutex::new(BTreeSet::new()),
            next_extern: AtomicU64::new(1),
            recovered: Mutex::new(Vec::new()),
            poisoned: AtomicBool::new(false),
        })
    }

    /// Rebuild a system from a persisted undo tablespace.
    ///
    /// Rollback segments are rediscovered by page kind; transactions left
    /// ACTIVE at the crash are rolled back here, PREPARED ones are
    /// resurrected and left for [`TransactionSystem::recovered_prepared`].
    pub fn recover(config: MvccConfig, space: UndoTablespace) -> Result<(Self, RecoveryReport)> {
        let mut hdr_pages: Vec<_> = space
            .snapshot()
            .into_iter()
            .filter(|(page, bytes)| {
                page_kind(*page, bytes).map_or(false, |k| k == PAGE_KIND_RSEG_HDR)
            })
            .map(|(page, _)| page)
            .collect();
        hdr_pages.sort_unstable();
        if hdr_pages.is_empty() {
            return Err(QuarryError::CorruptUndo {
                detail: "tablespace holds no rollback segment header page".into(),
            });
        }

        let mut rsegs = Vec::with_capacity(hdr_pages.len());
        let mut live_logs: Vec<(RsegId, UndoLog)> = Vec::new();
        let mut max_id: u64 = 0;
        let mut max_no: u64 = 0;
        for hdr_page in hdr_pages {
            let (rseg, live) = Rseg::recover(&space, hdr_page)?;
            if let Some(id) = rseg.max_recorded_trx_id() {
                max_id = max_id.max(id.get());
            }
            if let Some(no) = rseg.newest_history_no() {
                max_no = max_no.max(no.get());
            }
            for log in live {
                max_id = max_id.max(log.trx_id.get());
                live_logs.push((rseg.id, log));
            }
            rsegs.push(Arc::new(rseg));
        }

        // Group live logs by owner: one transaction holds at most one log
        // of each kind.
        let mut owners: BTreeMap<TrxId, (RsegId, Option<UndoLog>, Option<UndoLog>)> =
            BTreeMap::new();
        for (rseg_id, log) in live_logs {
            let slot = owners.entry(log.trx_id).or_insert((rseg_id, None, None));
            match log.kind {
                UndoKind::Insert => slot.1 = Some(log),
                UndoKind::Update => slot.2 = Some(log),
            }
        }

        let sys = Self {
            purge: PurgeSys::new(ReadView::new(TrxId::MIN, Vec::new(), TrxNo::new(1), None)),
            config,
            space,
            tables: TableStore::new(),
            rsegs,
            trx_table: Mutex::new(TrxTable {
                next_no: max_no + 1,
                active: BTreeSet::new(),
                serializing: BTreeSet::new(),
            }),
            next_id: AtomicU64::new(max_id + 1),
            next_rseg: AtomicUsize::new(0),
            views: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            externs: Mutex::new(BTreeSet::new()),
            next_extern: AtomicU64::new(1),
            recovered: Mutex::new(Vec::new()),
            poisoned: AtomicBool::new(false),
        };

        let mut report = RecoveryReport {
            history_entries: sys.history_len(),
            ..RecoveryReport::default()
        };
        for (trx_id, (rseg_id, insert_undo, update_undo)) in owners {
            let prepared = [&insert_undo, &update_undo]
                .into_iter()
                .flatten()
                .any(|log| log.state == UndoState::Prepared);
            let xid = [&insert_undo, &update_undo]
                .into_iter()
                .flatten()
                .find_map(|log| log.xid.clone());
            let undo_no = [&insert_undo, &update_undo]
                .into_iter()
                .flatten()
                .filter_map(|log| log.top)
                .map(|top| top.undo_no.next())
                .max()
                .unwrap_or(UndoNo::ZERO);
            let mut trx = Trx {
                id: trx_id,
                state: if prepared {
                    TrxState::Prepared
                } else {
                    TrxState::Active
                },
                no: None,
                rseg_id,
                undo_no,
                roll_limit: UndoNo::ZERO,
                insert_undo,
                update_undo,
                xid,
            };
            sys.trx_table.lock().active.insert(trx_id);
            if prepared {
                tracing::debug!(trx_id = %trx_id, "resurrected prepared transaction");
                report.prepared.push(trx_id);
                sys.recovered.lock().push(trx);
            } else {
                tracing::debug!(trx_id = %trx_id, "rolling back interrupted transaction");
                sys.rollback(&mut trx, None)?;
                report.rolled_back.push(trx_id);
            }
        }
        tracing::debug!(
            prepared = report.prepared.len(),
            rolled_back = report.rolled_back.len(),
            history = report.history_entries,
            "recovery complete"
        );
        Ok((sys, report))
    }

    /// The table store the executors operate on.
    #[must_use]
    pub fn table_store(&self) -> &TableStore {
        &self.tables
    }

    /// Immutable view of the undo tablespace, e.g. for snapshots.
    #[must_use]
    pub fn tablespace(&self) -> &UndoTablespace {
        &self.space
    }

    /// Take ownership of the PREPARED transactions found by recovery. The
    /// embedding layer decides commit or rollback for each.
    pub fn recovered_prepared(&self) -> Vec<Trx> {
        std::mem::take(&mut *self.recovered.lock())
    }

    // --- id and segment assignment ---

    pub(crate) fn alloc_trx_id(&self) -> Result<TrxId> {
        let mut current = self.next_id.load(Ordering::Relaxed);
        loop {
            let id = TrxId::new(current).ok_or(QuarryError::TrxIdExhausted)?;
            match self.next_id.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(id),
                Err(seen) => current = seen,
            }
        }
    }

    /// Mint the next serialization number and park it in the serializing
    /// set, where it pins the purge floor until the commit is durable.
    pub(crate) fn alloc_serialization_no(&self) -> TrxNo {
        let mut table = self.trx_table.lock();
        let no = TrxNo::new(table.next_no);
        table.next_no += 1;
        table.serializing.insert(no);
        no
    }

    pub(crate) fn pick_rseg(&self) -> RsegId {
        let n = self.next_rseg.fetch_add(1, Ordering::Relaxed);
        self.rsegs[n % self.rsegs.len()].id
    }

    pub(crate) fn rseg(&self, id: RsegId) -> &Arc<Rseg> {
        // Segment ids are only ever minted from this vec.
        self.rsegs
            .iter()
            .find(|r| r.id == id)
            .unwrap_or(&self.rsegs[0])
    }

    /// Whether `id` is currently ACTIVE or PREPARED.
    #[must_use]
    pub fn is_active(&self, id: TrxId) -> bool {
        self.trx_table.lock().active.contains(&id)
    }

    // --- views ---

    pub(crate) fn snapshot_view(&self, creator: Option<TrxId>) -> ReadView {
        let table = self.trx_table.lock();
        let low_limit_id =
            TrxId::new(self.next_id.load(Ordering::Acquire)).unwrap_or(TrxId::MAX);
        let active: Vec<TrxId> = table
            .active
            .iter()
            .copied()
            .filter(|id| Some(*id) != creator)
            .collect();
        let low_limit_no = table
            .serializing
            .first()
            .copied()
            .unwrap_or(TrxNo::new(table.next_no));
        ReadView::new(low_limit_id, active, low_limit_no, creator)
    }

    /// Open a registered read view. The purge floor cannot pass it while
    /// the returned handle is alive.
    pub fn open_view(&self, creator: Option<&Trx>) -> Arc<ReadView> {
        let view = Arc::new(self.snapshot_view(creator.map(|t| t.id)));
        self.views.lock().push(Arc::downgrade(&view));
        view
    }

    /// The oldest view still held by a reader, if any.
    pub(crate) fn oldest_open_view(&self) -> Option<ReadView> {
        let mut views = self.views.lock();
        views.retain(|w| w.strong_count() > 0);
        views
            .iter()
            .filter_map(Weak::upgrade)
            .min_by_key(|v| v.low_limit_no())
            .map(|v| (*v).clone())
    }

    // --- commit events ---

    /// Subscribe to lifecycle events. Dropped receivers are pruned lazily.
    pub fn subscribe(&self) -> mpsc::Receiver<CommitEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: CommitEvent) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    // --- externally stored columns ---

    /// Register an overflow blob, returning its id.
    pub fn register_extern(&self) -> u64 {
        let id = self.next_extern.fetch_add(1, Ordering::Relaxed);
        self.externs.lock().insert(id);
        id
    }

    /// Whether an overflow blob is still live.
    #[must_use]
    pub fn extern_exists(&self, id: u64) -> bool {
        self.externs.lock().contains(&id)
    }

    pub(crate) fn free_extern(&self, id: u64) {
        if self.externs.lock().remove(&id) {
            tracing::debug!(extern_id = id, "freed externally stored column");
        }
    }

    // --- poisoning ---

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(QuarryError::FatalState {
                detail: "transaction system is poisoned by an earlier post-durability failure"
                    .into(),
            });
        }
        Ok(())
    }

    /// Record an unrecoverable post-durability failure. Every subsequent
    /// operation fails until the process restarts.
    pub(crate) fn poison(&self, detail: String) -> QuarryError {
        self.poisoned.store(true, Ordering::Release);
        tracing::error!(%detail, "transaction system poisoned");
        QuarryError::FatalState { detail }
    }

    /// Whether a post-durability failure has occurred.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}
