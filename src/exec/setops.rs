//! Set operations
//!
//! UNION / UNION ALL / INTERSECT / EXCEPT over two row lists of identical
//! arity. Row identity treats NULL column values as equal; multi-column
//! comparison is the full column tuple. Deduplicated outputs preserve
//! first-occurrence order of the left side.

use std::collections::HashSet;

use crate::intent::CompoundOp;
use crate::types::{RowKey, Value};

/// Apply `op` to two row lists.
pub fn apply(op: CompoundOp, left: Vec<Vec<Value>>, right: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    match op {
        CompoundOp::UnionAll => {
            let mut out = left;
            out.extend(right);
            out
        }
        CompoundOp::Union => {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for row in left.into_iter().chain(right) {
                if seen.insert(RowKey::new(&row)) {
                    out.push(row);
                }
            }
            out
        }
        CompoundOp::Intersect => {
            let right_keys: HashSet<RowKey> =
                right.iter().map(|r| RowKey::new(r)).collect();
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for row in left {
                let key = RowKey::new(&row);
                if right_keys.contains(&key) && seen.insert(key) {
                    out.push(row);
                }
            }
            out
        }
        CompoundOp::Except => {
            let right_keys: HashSet<RowKey> =
                right.iter().map(|r| RowKey::new(r)).collect();
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for row in left {
                let key = RowKey::new(&row);
                if !right_keys.contains(&key) && seen.insert(key) {
                    out.push(row);
                }
            }
            out
        }
    }
}
