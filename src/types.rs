//! Core type aliases and value types for Sharc
//!
//! This module defines the foundational types used throughout the engine:
//! page and rowid aliases, the owned dynamic [`Value`], the borrowed
//! [`ColumnValue`] produced by the record decoder, and the storage-order
//! comparison shared by index cursors, sorting and the set-operation
//! kernels.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number type (1-based, u32 on disk)
pub type Pgno = u32;

/// Row ID type (64-bit signed)
pub type RowId = i64;

// ============================================================================
// Column Types
// ============================================================================

/// Runtime type of a column value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

/// Sort direction for an ORDER BY term or an index column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    /// Apply this direction to an ascending comparison result.
    pub fn apply(self, ord: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

// ============================================================================
// Owned Value
// ============================================================================

/// Dynamic owned value
///
/// Rows handed to execution kernels and to callers are sequences of these.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Runtime type of this value
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Integer(_) => ColumnType::Integer,
            Value::Real(_) => ColumnType::Real,
            Value::Text(_) => ColumnType::Text,
            Value::Blob(_) => ColumnType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => {
                // Whole reals keep a decimal point so they read as reals
                let s = r.to_string();
                if !s.contains('.') && !s.contains('e') && !s.contains('E') {
                    write!(f, "{}.0", s)
                } else {
                    write!(f, "{}", s)
                }
            }
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
        }
    }
}

// ============================================================================
// Borrowed Value
// ============================================================================

/// A decoded column as a view over record payload bytes
///
/// Text and blob bodies are spans into page (or scratch) memory and stay
/// valid only until the owning cursor is advanced. Copying to owned storage
/// is explicit via [`ColumnValue::to_value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnValue<'a> {
    Null,
    Integer(i64),
    Real(f64),
    Text(&'a [u8]),
    Blob(&'a [u8]),
}

impl<'a> ColumnValue<'a> {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Copy this view into an owned [`Value`].
    pub fn to_value(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Integer(i) => Value::Integer(*i),
            ColumnValue::Real(f) => Value::Real(*f),
            ColumnValue::Text(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
            ColumnValue::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

// ============================================================================
// Storage Order
// ============================================================================

/// Type-rank for storage-order comparison: NULL < numeric < text < blob.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Integer(_) | Value::Real(_) => 1,
        Value::Text(_) => 2,
        Value::Blob(_) => 3,
    }
}

/// Compare two values in storage order.
///
/// NULLs sort first and compare equal to each other; integers and reals
/// compare numerically across the two representations; text and blob
/// compare bytewise (BINARY collation).
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Real(x), Value::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Integer(x), Value::Real(y)) => {
            (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (Value::Real(x), Value::Integer(y)) => {
            x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal)
        }
        (Value::Text(x), Value::Text(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Compare a decoded column view against an owned value in storage order.
pub fn cmp_column_value(c: &ColumnValue<'_>, v: &Value) -> Ordering {
    let rank_c = match c {
        ColumnValue::Null => 0,
        ColumnValue::Integer(_) | ColumnValue::Real(_) => 1,
        ColumnValue::Text(_) => 2,
        ColumnValue::Blob(_) => 3,
    };
    let rank_v = type_rank(v);
    if rank_c != rank_v {
        return rank_c.cmp(&rank_v);
    }
    match (c, v) {
        (ColumnValue::Null, Value::Null) => Ordering::Equal,
        (ColumnValue::Integer(x), Value::Integer(y)) => x.cmp(y),
        (ColumnValue::Integer(x), Value::Real(y)) => {
            (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (ColumnValue::Real(x), Value::Integer(y)) => {
            x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal)
        }
        (ColumnValue::Real(x), Value::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (ColumnValue::Text(x), Value::Text(y)) => (*x).cmp(y.as_bytes()),
        (ColumnValue::Blob(x), Value::Blob(y)) => (*x).cmp(y.as_slice()),
        _ => Ordering::Equal,
    }
}

/// Compare two decoded column views in storage order.
pub fn cmp_columns(a: &ColumnValue<'_>, b: &ColumnValue<'_>) -> Ordering {
    fn rank(c: &ColumnValue<'_>) -> u8 {
        match c {
            ColumnValue::Null => 0,
            ColumnValue::Integer(_) | ColumnValue::Real(_) => 1,
            ColumnValue::Text(_) => 2,
            ColumnValue::Blob(_) => 3,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (ColumnValue::Null, ColumnValue::Null) => Ordering::Equal,
        (ColumnValue::Integer(x), ColumnValue::Integer(y)) => x.cmp(y),
        (ColumnValue::Integer(x), ColumnValue::Real(y)) => {
            (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (ColumnValue::Real(x), ColumnValue::Integer(y)) => {
            x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal)
        }
        (ColumnValue::Real(x), ColumnValue::Real(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (ColumnValue::Text(x), ColumnValue::Text(y)) => x.cmp(y),
        (ColumnValue::Blob(x), ColumnValue::Blob(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Compare two rows lexicographically over the column tuple.
pub fn cmp_rows(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = cmp_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

// ============================================================================
// Hashable Key
// ============================================================================

/// A value wrapper that is hashable and treats NULL as equal to NULL
///
/// Used for group-by keys and set-operation row identity. Whole-valued
/// reals are canonicalized to integers so that `1` and `1.0` key together,
/// matching comparison semantics.
#[derive(Debug, Clone)]
pub struct ValueKey(Value);

impl ValueKey {
    pub fn new(v: Value) -> Self {
        match v {
            Value::Real(r)
                if r.fract() == 0.0 && r >= i64::MIN as f64 && r <= i64::MAX as f64 =>
            {
                ValueKey(Value::Integer(r as i64))
            }
            other => ValueKey(other),
        }
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Null => 0u8.hash(state),
            Value::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Value::Real(r) => {
                2u8.hash(state);
                r.to_bits().hash(state);
            }
            Value::Text(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Blob(b) => {
                4u8.hash(state);
                b.hash(state);
            }
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancel token, checked at leaf transitions and kernel row
/// boundaries. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Hashable multi-column row key (NULLs equal, first-occurrence identity).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey(Vec<ValueKey>);

impl RowKey {
    pub fn new(row: &[Value]) -> Self {
        RowKey(row.iter().map(|v| ValueKey::new(v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_order_ranks() {
        assert_eq!(
            cmp_values(&Value::Null, &Value::Integer(-5)),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Value::Integer(7), &Value::Text("a".into())),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Value::Text("z".into()), &Value::Blob(vec![0])),
            Ordering::Less
        );
    }

    #[test]
    fn test_mixed_numeric_comparison() {
        assert_eq!(
            cmp_values(&Value::Integer(2), &Value::Real(2.0)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(&Value::Real(1.5), &Value::Integer(2)),
            Ordering::Less
        );
    }

    #[test]
    fn test_value_key_null_equals_null() {
        assert_eq!(ValueKey::new(Value::Null), ValueKey::new(Value::Null));
    }

    #[test]
    fn test_value_key_canonicalizes_whole_reals() {
        assert_eq!(
            ValueKey::new(Value::Real(3.0)),
            ValueKey::new(Value::Integer(3))
        );
        assert_ne!(
            ValueKey::new(Value::Real(3.5)),
            ValueKey::new(Value::Integer(3))
        );
    }

    #[test]
    fn test_row_key_tuple_identity() {
        let a = vec![Value::Integer(1), Value::Null];
        let b = vec![Value::Integer(1), Value::Null];
        let c = vec![Value::Integer(1), Value::Integer(0)];
        assert_eq!(RowKey::new(&a), RowKey::new(&b));
        assert_ne!(RowKey::new(&a), RowKey::new(&c));
    }

    #[test]
    fn test_real_display_keeps_decimal_point() {
        assert_eq!(Value::Real(1.0).to_string(), "1.0");
        assert_eq!(Value::Real(1.5).to_string(), "1.5");
    }
}
