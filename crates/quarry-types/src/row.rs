//! Row images, update vectors, and secondary index entries.

use std::fmt;

use smallvec::SmallVec;

use crate::encoding::{read_varint, write_varint};
use crate::value::Value;

/// A materialized row image: the full column list of one clustered record
/// version. The primary key is a projection of this, chosen by the table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RowImage {
    /// All column values, in column order.
    pub cols: Vec<Value>,
}

impl RowImage {
    /// Build from a column vector.
    #[must_use]
    pub fn new(cols: Vec<Value>) -> Self {
        Self { cols }
    }

    /// Project the columns at `positions` (e.g. a primary key definition).
    ///
    /// Missing positions project as NULL; the caller validates arity.
    #[must_use]
    pub fn project(&self, positions: &[u32]) -> Vec<Value> {
        positions
            .iter()
            .map(|&p| self.cols.get(p as usize).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// One changed column inside an update's pre-image.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpdatedField {
    /// Column ordinal in the clustered record.
    pub col_no: u32,
    /// The value the column held before the update.
    pub old: Value,
    /// Externally stored blob the old value referenced, if any.
    pub old_extern: Option<u64>,
}

/// The pre-image of an update: the changed columns' old values.
///
/// Applying an update vector to the current row of a clustered record yields
/// the previous version of that row; this is the core step of both rollback
/// and consistent-read version rebuilding.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpdateVector {
    /// Changed fields, ascending by `col_no`.
    pub fields: SmallVec<[UpdatedField; 4]>,
}

impl UpdateVector {
    /// An empty update vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one changed column.
    pub fn push(&mut self, col_no: u32, old: Value, old_extern: Option<u64>) {
        self.fields.push(UpdatedField {
            col_no,
            old,
            old_extern,
        });
    }

    /// Whether any column changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether any of `positions` is among the changed columns.
    #[must_use]
    pub fn touches(&self, positions: &[u32]) -> bool {
        self.fields
            .iter()
            .any(|f| positions.contains(&f.col_no))
    }

    /// Apply the pre-image to `row` in place, producing the previous version.
    pub fn apply_to(&self, row: &mut RowImage) {
        for field in &self.fields {
            if let Some(slot) = row.cols.get_mut(field.col_no as usize) {
                *slot = field.old.clone();
            }
        }
    }

    /// Append the encoded form: a count, then per field the column ordinal,
    /// the old value, and an optional extern reference.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.fields.len() as u64);
        for field in &self.fields {
            write_varint(buf, u64::from(field.col_no));
            field.old.encode(buf);
            match field.old_extern {
                None => buf.push(0),
                Some(id) => {
                    buf.push(1);
                    write_varint(buf, id);
                }
            }
        }
    }

    /// Decode at `at`, returning the vector and the bytes consumed.
    #[must_use]
    pub fn decode(buf: &[u8], at: usize) -> Option<(Self, usize)> {
        let mut pos = at;
        let (count, used) = read_varint(buf, pos)?;
        pos += used;
        let mut fields = SmallVec::new();
        for _ in 0..count {
            let (col_no, used) = read_varint(buf, pos)?;
            pos += used;
            let (old, used) = Value::decode(buf, pos)?;
            pos += used;
            let old_extern = match *buf.get(pos)? {
                0 => {
                    pos += 1;
                    None
                }
                1 => {
                    pos += 1;
                    let (id, used) = read_varint(buf, pos)?;
                    pos += used;
                    Some(id)
                }
                _ => return None,
            };
            fields.push(UpdatedField {
                col_no: u32::try_from(col_no).ok()?,
                old,
                old_extern,
            });
        }
        Some((Self { fields }, pos - at))
    }
}

/// A secondary index entry: the index key plus the primary key of the row
/// it points at. Entries are shared references into the version chain, not
/// per-version copies.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexEntry {
    /// Index key values, in index column order.
    pub key: Vec<Value>,
    /// Primary key of the referenced clustered record.
    pub pk: Vec<Value>,
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry(key [")?;
        for (i, v) in self.key.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "])")
    }
}
