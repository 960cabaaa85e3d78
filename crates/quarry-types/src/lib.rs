//! Foundation types for the QuarryDB MVCC engine.
//!
//! This crate defines the cross-cutting identifiers and small value types
//! shared by every other crate: transaction and undo-log identities, the
//! packed roll pointer, column values with the two comparison orders the
//! version walker needs, and the little-endian encoding helpers used by all
//! on-page structures.

pub mod encoding;
pub mod ids;
pub mod row;
pub mod value;

pub use ids::{
    IndexId, InvalidRollPtr, InvalidTrxId, PageNo, RollPtr, RsegId, SpaceId, TableId, TrxId,
    TrxNo, UndoNo, PAGE_NO_NULL,
};
pub use row::{IndexEntry, RowImage, UpdateVector, UpdatedField};
pub use value::{cmp_binary_slices, cmp_collating_slices, Value};
