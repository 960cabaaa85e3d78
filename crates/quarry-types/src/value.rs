//! Column values.
//!
//! The engine stores three storage classes plus NULL. Two comparison orders
//! are defined: the collating order used by secondary indexes (text compares
//! case-insensitively over ASCII) and the binary order used to rule out
//! collation-equal-but-binary-different false positives during purge safety
//! checks.

use std::cmp::Ordering;
use std::fmt;

use crate::encoding::{read_varint, write_varint};

/// A dynamically-typed column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A UTF-8 text string.
    Text(String),
    /// A binary large object.
    Blob(Vec<u8>),
}

/// Rank used to order values of different storage classes:
/// NULL < INTEGER < TEXT < BLOB.
const fn class_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Integer(_) => 1,
        Value::Text(_) => 2,
        Value::Blob(_) => 3,
    }
}

impl Value {
    /// Collating comparison: the order secondary index entries sort in.
    ///
    /// Text compares by ASCII-case-folded bytes, so `"abc"` and `"ABC"` are
    /// ordering-equal without being binary-equal.
    #[must_use]
    pub fn cmp_collating(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
            (Self::Blob(a), Self::Blob(b)) => a.cmp(b),
            _ => class_rank(self).cmp(&class_rank(other)),
        }
    }

    /// Binary comparison: byte-exact order, no collation folding.
    #[must_use]
    pub fn cmp_binary(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Self::Blob(a), Self::Blob(b)) => a.cmp(b),
            _ => class_rank(self).cmp(&class_rank(other)),
        }
    }

    /// Append the tagged encoding of this value.
    ///
    /// Layout: one tag byte, then a class-specific payload (integers are
    /// zigzag varints, text/blob are length-prefixed bytes).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Null => buf.push(0),
            Self::Integer(i) => {
                buf.push(1);
                write_varint(buf, zigzag(*i));
            }
            Self::Text(s) => {
                buf.push(2);
                write_varint(buf, s.len() as u64);
                buf.extend_from_slice(s.as_bytes());
            }
            Self::Blob(b) => {
                buf.push(3);
                write_varint(buf, b.len() as u64);
                buf.extend_from_slice(b);
            }
        }
    }

    /// Decode a tagged value at `at`, returning it and the bytes consumed.
    ///
    /// Returns `None` on truncated input, an unknown tag, or invalid UTF-8
    /// in a text payload.
    #[must_use]
    pub fn decode(buf: &[u8], at: usize) -> Option<(Self, usize)> {
        let tag = *buf.get(at)?;
        match tag {
            0 => Some((Self::Null, 1)),
            1 => {
                let (raw, used) = read_varint(buf, at + 1)?;
                Some((Self::Integer(unzigzag(raw)), 1 + used))
            }
            2 | 3 => {
                let (len, used) = read_varint(buf, at + 1)?;
                let len = usize::try_from(len).ok()?;
                let start = at + 1 + used;
                let bytes = buf.get(start..start + len)?;
                let value = if tag == 2 {
                    Self::Text(String::from_utf8(bytes.to_vec()).ok()?)
                } else {
                    Self::Blob(bytes.to_vec())
                };
                Some((value, 1 + used + len))
            }
            _ => None,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_binary(other)
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Blob(b) => write!(f, "blob[{}]", b.len()),
        }
    }
}

#[inline]
const fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
const fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Compare two value slices in collating order, shorter slice first on ties.
#[must_use]
pub fn cmp_collating_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        match lhs.cmp_collating(rhs) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Compare two value slices in binary order, shorter slice first on ties.
#[must_use]
pub fn cmp_binary_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        match lhs.cmp_binary(rhs) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_collation_folds_ascii_case() {
        let a = Value::Text("Quarry".into());
        let b = Value::Text("qUARRY".into());
        assert_eq!(a.cmp_collating(&b), Ordering::Equal);
        assert_ne!(a.cmp_binary(&b), Ordering::Equal);
    }

    #[test]
    fn test_class_ordering() {
        let vals = [
            Value::Null,
            Value::Integer(5),
            Value::Text("a".into()),
            Value::Blob(vec![0]),
        ];
        for w in vals.windows(2) {
            assert_eq!(w[0].cmp_collating(&w[1]), Ordering::Less);
            assert_eq!(w[0].cmp_binary(&w[1]), Ordering::Less);
        }
    }

    #[test]
    fn test_slice_compare_prefix_is_less() {
        let short = [Value::Integer(1)];
        let long = [Value::Integer(1), Value::Integer(2)];
        assert_eq!(cmp_collating_slices(&short, &long), Ordering::Less);
        assert_eq!(cmp_binary_slices(&long, &short), Ordering::Greater);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(Value::decode(&[9], 0).is_none());
    }

    #[test]
    fn test_decode_rejects_truncated_text() {
        let mut buf = Vec::new();
        Value::Text("hello".into()).encode(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(Value::decode(&buf, 0).is_none());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::Integer),
            ".{0,24}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..48).prop_map(Value::Blob),
        ]
    }

    proptest! {
        #[test]
        fn prop_value_round_trip(v in arb_value(), at in 0usize..4) {
            let mut buf = vec![0xeeu8; at];
            v.encode(&mut buf);
            let (decoded, used) = Value::decode(&buf, at).expect("decode");
            prop_assert_eq!(&decoded, &v);
            prop_assert_eq!(used, buf.len() - at);
        }

        #[test]
        fn prop_zigzag_round_trip(v in any::<i64>()) {
            prop_assert_eq!(unzigzag(zigzag(v)), v);
        }
    }
}
