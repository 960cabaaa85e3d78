//! MVCC identifiers: transactions, undo numbers, rollback segments, pages,
//! and the packed roll pointer.
//!
//! Identifier newtypes are `#[repr(transparent)]` wrappers with explicit
//! domain checks; out-of-domain construction is an error, never a wrap.

use std::fmt;
use std::num::NonZeroU64;

use crate::encoding::{append_u64_le, read_u64_le};

/// Monotonically increasing transaction identifier.
///
/// Domain: `1..=(2^48 - 1)`. The id is assigned at transaction start and
/// stamped onto every clustered record the transaction modifies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TrxId(NonZeroU64);

impl TrxId {
    /// Maximum raw value representable by a real transaction id.
    pub const MAX_RAW: u64 = (1_u64 << 48) - 1;

    /// The smallest valid transaction id.
    pub const MIN: Self = match Self::new(1) {
        Some(id) => id,
        None => unreachable!(),
    };

    /// The largest valid transaction id.
    pub const MAX: Self = match Self::new(Self::MAX_RAW) {
        Some(id) => id,
        None => unreachable!(),
    };

    /// Construct a `TrxId` if `raw` is in-domain.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Return the next transaction id if it stays in-domain.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        Self::new(self.get().wrapping_add(1))
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx#{}", self.get())
    }
}

impl TryFrom<u64> for TrxId {
    type Error = InvalidTrxId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTrxId { raw: value })
    }
}

/// Error returned when attempting to construct an out-of-domain `TrxId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTrxId {
    raw: u64,
}

impl fmt::Display for InvalidTrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid TrxId {} (must satisfy 1 <= id <= {})",
            self.raw,
            TrxId::MAX_RAW
        )
    }
}

impl std::error::Error for InvalidTrxId {}

/// Transaction serialization number, assigned at commit.
///
/// Orders committed transactions in every rollback segment's history list
/// and defines the purge floor of a read view.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct TrxNo(u64);

impl TrxNo {
    /// Construct from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrxNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no#{}", self.0)
    }
}

/// Per-transaction undo record sequence number.
///
/// Strictly increasing across a transaction's combined insert-undo and
/// update-undo logs; the savepoint mechanism is a threshold on this value.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct UndoNo(u64);

impl UndoNo {
    /// The first undo number of every transaction.
    pub const ZERO: Self = Self(0);

    /// Construct from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The next undo number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for UndoNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undo#{}", self.0)
    }
}

/// Rollback segment identifier.
///
/// Domain: `0..=127` (seven bits inside the packed roll pointer).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RsegId(u8);

impl RsegId {
    /// Maximum raw value (roll pointers carry seven bits).
    pub const MAX_RAW: u8 = 127;

    /// Construct an `RsegId` if `raw` is in-domain.
    #[inline]
    #[must_use]
    pub const fn new(raw: u8) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        Some(Self(raw))
    }

    /// Get the raw u8 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for RsegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rseg#{}", self.0)
    }
}

/// Page number inside the undo tablespace.
pub type PageNo = u32;

/// Sentinel "no page" value used in page links and slot arrays.
pub const PAGE_NO_NULL: PageNo = u32::MAX;

/// Tablespace identifier. The undo tablespace is space 0 in this engine.
pub type SpaceId = u32;

/// Table identifier.
pub type TableId = u64;

/// Secondary index identifier.
pub type IndexId = u64;

// ---------------------------------------------------------------------------
// RollPtr
// ---------------------------------------------------------------------------

/// Packed reference from a clustered record to the undo record that produced
/// its previous version.
///
/// Layout (56 significant bits of a u64):
///
/// ```text
/// bit  55     : insert flag (the referenced record is an insert-undo record;
///               the version chain ends here)
/// bits 48..55 : rollback segment id (7 bits)
/// bits 16..48 : page number within the undo tablespace (32 bits)
/// bits  0..16 : byte offset of the record within the page (16 bits)
/// ```
///
/// Roll pointers chain backward in time; together with the undo records they
/// reference they form the version chain of a row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RollPtr(u64);

impl RollPtr {
    const INSERT_BIT: u64 = 1 << 55;

    /// Pack a roll pointer from its components.
    #[inline]
    #[must_use]
    pub const fn new(is_insert: bool, rseg: RsegId, page: PageNo, offset: u16) -> Self {
        let mut raw = (offset as u64) | ((page as u64) << 16) | ((rseg.get() as u64) << 48);
        if is_insert {
            raw |= Self::INSERT_BIT;
        }
        Self(raw)
    }

    /// Reconstruct from a raw u64, validating the reserved high bits.
    #[inline]
    pub const fn from_raw(raw: u64) -> Result<Self, InvalidRollPtr> {
        if raw >> 56 != 0 {
            return Err(InvalidRollPtr { raw });
        }
        Ok(Self(raw))
    }

    /// The raw packed value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether the referenced undo record is an insert-undo record, i.e. the
    /// version chain ends at this pointer.
    #[inline]
    #[must_use]
    pub const fn is_insert(self) -> bool {
        self.0 & Self::INSERT_BIT != 0
    }

    /// Rollback segment component.
    #[inline]
    #[must_use]
    pub const fn rseg(self) -> RsegId {
        // Seven bits by construction; always in-domain.
        match RsegId::new(((self.0 >> 48) & 0x7f) as u8) {
            Some(id) => id,
            None => unreachable!(),
        }
    }

    /// Page number component.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PageNo {
        ((self.0 >> 16) & 0xffff_ffff) as PageNo
    }

    /// In-page byte offset component.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Append the packed value to an encode buffer.
    #[inline]
    pub fn encode(self, buf: &mut Vec<u8>) {
        append_u64_le(buf, self.0);
    }

    /// Decode a packed value at `at`.
    #[must_use]
    pub fn decode(buf: &[u8], at: usize) -> Option<Self> {
        Self::from_raw(read_u64_le(buf, at)?).ok()
    }
}

impl fmt::Display for RollPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "roll_ptr{{{}:{}, page {}, off {}}}",
            if self.is_insert() { "ins" } else { "upd" },
            self.rseg(),
            self.page(),
            self.offset()
        )
    }
}

/// Error returned when a raw u64 has bits outside the roll pointer domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRollPtr {
    raw: u64,
}

impl fmt::Display for InvalidRollPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid RollPtr {:#x} (reserved high bits set)", self.raw)
    }
}

impl std::error::Error for InvalidRollPtr {}
