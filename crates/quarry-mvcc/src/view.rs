//! Consistent read views.
//!
//! A read view is an immutable snapshot of the transaction system taken at
//! statement or transaction start: the set of transactions that were active,
//! plus the id watermarks bounding them. A row version is visible when its
//! writer had already committed at snapshot time.

use quarry_types::{TrxId, TrxNo};

/// Snapshot of transaction visibility at a point in time.
#[derive(Debug, Clone)]
pub struct ReadView {
    /// Smallest id not yet assigned at open; `id >= low_limit_id` is
    /// invisible regardless of the active set.
    low_limit_id: TrxId,
    /// Every `id < up_limit_id` was committed at open and is visible.
    up_limit_id: TrxId,
    /// Transactions active at open, ascending.
    active: Vec<TrxId>,
    /// Purge watermark: every committed transaction with a serialization
    /// number below this had its commit fully serialized at open.
    low_limit_no: TrxNo,
    /// The transaction the view was opened for, if any. Its own writes are
    /// always visible to it.
    creator: Option<TrxId>,
}

impl ReadView {
    /// Build a view from the transaction system's state at open.
    ///
    /// `active` must be sorted ascending and must not contain `creator`.
    #[must_use]
    pub fn new(
        low_limit_id: TrxId,
        active: Vec<TrxId>,
        low_limit_no: TrxNo,
        creator: Option<TrxId>,
    ) -> Self {
        debug_assert!(active.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(creator.map_or(true, |c| !active.contains(&c)));
        let up_limit_id = active.first().copied().unwrap_or(low_limit_id);
        Self {
            low_limit_id,
            up_limit_id,
            active,
            low_limit_no,
            creator,
        }
    }

    /// Whether a row version written by `trx_id` is visible to this view.
    #[must_use]
    pub fn sees(&self, trx_id: TrxId) -> bool {
        if self.creator == Some(trx_id) {
            return true;
        }
        if trx_id < self.up_limit_id {
            return true;
        }
        if trx_id >= self.low_limit_id {
            return false;
        }
        self.active.binary_search(&trx_id).is_err()
    }

    /// Purge floor carried by this view: undo history with a serialization
    /// number below it can never be needed by this snapshot.
    #[must_use]
    pub fn low_limit_no(&self) -> TrxNo {
        self.low_limit_no
    }

    #[must_use]
    pub fn creator(&self) -> Option<TrxId> {
        self.creator
    }

    /// Number of transactions active at open.
    #[must_use]
    pub fn n_active(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TrxId {
        TrxId::new(n).unwrap()
    }

    fn view(low: u64, active: &[u64], creator: Option<u64>) -> ReadView {
        ReadView::new(
            id(low),
            active.iter().map(|&n| id(n)).collect(),
            TrxNo::new(1),
            creator.map(id),
        )
    }

    #[test]
    fn test_committed_before_open_is_visible() {
        let v = view(10, &[5, 7], None);
        assert!(v.sees(id(3)));
        assert!(v.sees(id(4)));
        assert!(v.sees(id(6)));
    }

    #[test]
    fn test_active_at_open_is_invisible() {
        let v = view(10, &[5, 7], None);
        assert!(!v.sees(id(5)));
        assert!(!v.sees(id(7)));
    }

    #[test]
    fn test_started_after_open_is_invisible() {
        let v = view(10, &[5, 7], None);
        assert!(!v.sees(id(10)));
        assert!(!v.sees(id(42)));
    }

    #[test]
    fn test_own_writes_always_visible() {
        let v = view(10, &[5], Some(8));
        assert!(v.sees(id(8)));
        // A later id than the creator, still invisible.
        assert!(!v.sees(id(11)));
    }

    #[test]
    fn test_empty_active_set_sees_everything_below_limit() {
        let v = view(10, &[], None);
        assert!(v.sees(id(9)));
        assert!(!v.sees(id(10)));
    }
}
