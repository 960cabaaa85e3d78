//! The undo tablespace and the mini-transaction (mtr) over it.
//!
//! Undo pages are the one persisted structure this subsystem owns. Every
//! modification of them goes through an [`Mtr`]: a scoped unit that buffers
//! whole-page shadow copies and installs them atomically on commit. A
//! dropped, uncommitted mtr leaves the tablespace untouched (pages it
//! reserved are returned to the free list), which gives the all-or-nothing
//! guarantee the rest of the engine is built on.

use std::collections::HashMap;

use parking_lot::Mutex;

use quarry_error::{QuarryError, Result};
use quarry_types::encoding::{put_u16_le, put_u32_le, read_u16_le, read_u32_le};
use quarry_types::{PageNo, PAGE_NO_NULL};

/// Size of one undo page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Magic stamped into the first two bytes of every page.
pub const PAGE_MAGIC: u16 = 0x5142;

/// Page kinds.
pub const PAGE_KIND_SPACE_HDR: u8 = 0;
pub const PAGE_KIND_RSEG_HDR: u8 = 1;
pub const PAGE_KIND_UNDO: u8 = 2;

/// Page header layout.
const OFF_MAGIC: usize = 0;
const OFF_KIND: usize = 2;
const OFF_FREE: usize = 4;
const OFF_NEXT: usize = 6;

/// First usable byte after the common page header.
pub const PAGE_HDR_END: u16 = 16;

// ---------------------------------------------------------------------------
// Page accessors
// ---------------------------------------------------------------------------

/// Initialize `bytes` as an empty page of `kind`.
pub fn init_page(bytes: &mut [u8], kind: u8) {
    bytes.fill(0);
    put_u16_le(bytes, OFF_MAGIC, PAGE_MAGIC);
    bytes[OFF_KIND] = kind;
    put_u16_le(bytes, OFF_FREE, PAGE_HDR_END);
    put_u32_le(bytes, OFF_NEXT, PAGE_NO_NULL);
}

/// The page kind byte, or an error if the magic does not match.
pub fn page_kind(page: PageNo, bytes: &[u8]) -> Result<u8> {
    if read_u16_le(bytes, OFF_MAGIC) != Some(PAGE_MAGIC) {
        return Err(QuarryError::CorruptPage {
            page,
            detail: "bad magic".into(),
        });
    }
    Ok(bytes[OFF_KIND])
}

/// First free byte offset within the page.
#[must_use]
pub fn page_free_offset(bytes: &[u8]) -> u16 {
    read_u16_le(bytes, OFF_FREE).unwrap_or(PAGE_HDR_END)
}

/// Set the first free byte offset.
pub fn set_page_free_offset(bytes: &mut [u8], free: u16) {
    put_u16_le(bytes, OFF_FREE, free);
}

/// Next page in the owning undo log's page list.
#[must_use]
pub fn page_next(bytes: &[u8]) -> PageNo {
    read_u32_le(bytes, OFF_NEXT).unwrap_or(PAGE_NO_NULL)
}

/// Link the page to `next`.
pub fn set_page_next(bytes: &mut [u8], next: PageNo) {
    put_u32_le(bytes, OFF_NEXT, next);
}

// ---------------------------------------------------------------------------
// UndoTablespace
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SpaceInner {
    pages: HashMap<PageNo, Vec<u8>>,
    free_list: Vec<PageNo>,
    next_page: PageNo,
    max_pages: u32,
    allocated: u32,
}

/// The undo tablespace: a flat, page-addressed store.
///
/// All mutation is funneled through [`Mtr`]; direct access is read-only.
#[derive(Debug)]
pub struct UndoTablespace {
    inner: Mutex<SpaceInner>,
}

impl UndoTablespace {
    /// Create an empty tablespace capped at `max_pages`.
    #[must_use]
    pub fn new(max_pages: u32) -> Self {
        Self {
            inner: Mutex::new(SpaceInner {
                pages: HashMap::new(),
                free_list: Vec::new(),
                next_page: 0,
                max_pages,
                allocated: 0,
            }),
        }
    }

    /// Read a whole page, or `None` if it is unallocated or freed.
    #[must_use]
    pub fn read_page(&self, page: PageNo) -> Option<Vec<u8>> {
        self.inner.lock().pages.get(&page).cloned()
    }

    /// Run `f` over the raw bytes of `page` without copying.
    pub fn with_page<R>(&self, page: PageNo, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.pages.get(&page).map(|bytes| f(bytes))
    }

    /// Number of pages currently live.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Snapshot every live page (used by recovery tests to model a restart).
    #[must_use]
    pub fn snapshot(&self) -> Vec<(PageNo, Vec<u8>)> {
        let inner = self.inner.lock();
        let mut out: Vec<_> = inner
            .pages
            .iter()
            .map(|(&no, bytes)| (no, bytes.clone()))
            .collect();
        out.sort_by_key(|(no, _)| *no);
        out
    }

    /// Rebuild a tablespace from a page snapshot.
    #[must_use]
    pub fn from_snapshot(max_pages: u32, pages: Vec<(PageNo, Vec<u8>)>) -> Self {
        let next_page = pages.iter().map(|(no, _)| no + 1).max().unwrap_or(0);
        let allocated = pages.len() as u32;
        Self {
            inner: Mutex::new(SpaceInner {
                pages: pages.into_iter().collect(),
                free_list: Vec::new(),
                next_page,
                max_pages,
                allocated,
            }),
        }
    }

    fn reserve(&self) -> Result<PageNo> {
        let mut inner = self.inner.lock();
        if let Some(no) = inner.free_list.pop() {
            return Ok(no);
        }
        if inner.allocated >= inner.max_pages {
            return Err(QuarryError::TablespaceFull);
        }
        let no = inner.next_page;
        inner.next_page += 1;
        inner.allocated += 1;
        Ok(no)
    }

    fn unreserve(&self, no: PageNo) {
        self.inner.lock().free_list.push(no);
    }
}

// ---------------------------------------------------------------------------
// Mtr
// ---------------------------------------------------------------------------

/// A mini-transaction: buffered page modifications applied atomically.
///
/// Reads through the mtr observe its own pending writes. Dropping an
/// uncommitted mtr discards every buffered change and releases reserved
/// pages.
pub struct Mtr<'a> {
    space: &'a UndoTablespace,
    writes: HashMap<PageNo, Vec<u8>>,
    reserved: Vec<PageNo>,
    freed: Vec<PageNo>,
    committed: bool,
}

impl<'a> Mtr<'a> {
    /// Start a new mini-transaction over `space`.
    #[must_use]
    pub fn new(space: &'a UndoTablespace) -> Self {
        Self {
            space,
            writes: HashMap::new(),
            reserved: Vec::new(),
            freed: Vec::new(),
            committed: false,
        }
    }

    /// Mutable access to `page`, faulting it into the write set.
    pub fn page_mut(&mut self, page: PageNo) -> Result<&mut Vec<u8>> {
        if !self.writes.contains_key(&page) {
            let bytes = self
                .space
                .read_page(page)
                .ok_or_else(|| QuarryError::CorruptPage {
                    page,
                    detail: "mtr touched an unallocated page".into(),
                })?;
            self.writes.insert(page, bytes);
        }
        Ok(self.writes.get_mut(&page).ok_or(QuarryError::CorruptPage {
            page,
            detail: "write set lost a page".into(),
        })?)
    }

    /// Read `page`, observing pending writes first.
    pub fn page(&self, page: PageNo) -> Result<Vec<u8>> {
        if let Some(bytes) = self.writes.get(&page) {
            return Ok(bytes.clone());
        }
        self.space
            .read_page(page)
            .ok_or_else(|| QuarryError::CorruptPage {
                page,
                detail: "mtr read an unallocated page".into(),
            })
    }

    /// Allocate a fresh page of `kind` within this mtr.
    ///
    /// The page becomes visible to readers only at commit. Fails soft with
    /// [`QuarryError::TablespaceFull`] when the space cap is reached.
    pub fn alloc_page(&mut self, kind: u8) -> Result<PageNo> {
        let no = self.space.reserve()?;
        self.reserved.push(no);
        let mut bytes = vec![0u8; PAGE_SIZE];
        init_page(&mut bytes, kind);
        self.writes.insert(no, bytes);
        Ok(no)
    }

    /// Mark `page` for release at commit.
    pub fn free_page(&mut self, page: PageNo) {
        self.writes.remove(&page);
        self.freed.push(page);
    }

    /// Atomically install every buffered change.
    pub fn commit(mut self) {
        let mut inner = self.space.inner.lock();
        for (no, bytes) in self.writes.drain() {
            inner.pages.insert(no, bytes);
        }
        for no in self.freed.drain(..) {
            inner.pages.remove(&no);
            inner.free_list.push(no);
        }
        self.reserved.clear();
        self.committed = true;
    }
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        if !self.committed {
            for &no in &self.reserved {
                self.space.unreserve(no);
            }
        }
    }
}
