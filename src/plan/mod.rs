//! Predicate analysis and access planning
//!
//! [`sargable`] extracts index-usable conditions from a predicate intent,
//! [`selector`] turns them into an access plan for one table, and
//! [`cache`] memoizes compiled queries.

pub mod cache;
pub mod sargable;
pub mod selector;

use crate::types::Value;

/// Type class of an index seek key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Integer,
    Real,
    Text,
}

impl KeyType {
    pub fn of(value: &Value) -> Option<KeyType> {
        match value {
            Value::Integer(_) => Some(KeyType::Integer),
            Value::Real(_) => Some(KeyType::Real),
            Value::Text(_) => Some(KeyType::Text),
            _ => None,
        }
    }
}

/// How a plan leg positions its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOp {
    /// Exact key; scan while equal.
    Eq,
    /// First entry ≥ the seek key.
    Ge,
    /// First entry > the seek key.
    Gt,
    /// No lower bound; scan from the first entry.
    First,
}

/// Chosen access strategy for one table reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FullScan,
    SingleIndex,
    RowIdIntersection,
}

/// One index leg of a plan.
#[derive(Debug, Clone)]
pub struct PlanLeg {
    pub index_name: String,
    /// Leading index column the seek consumes.
    pub consumed_column: String,
    pub seek_op: SeekOp,
    pub seek_key: Option<Value>,
    pub upper_bound: Option<Value>,
    pub upper_inclusive: bool,
    pub key_type: KeyType,
    /// Conditions on later columns of the same index, checked against the
    /// decoded entry before the row fetch.
    pub residual_constraints: Vec<sargable::SargableCondition>,
}

/// The access plan for one table reference. The residual predicate is the
/// full filter intent, re-evaluated per row by the executor.
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub strategy: Strategy,
    pub primary: Option<PlanLeg>,
    pub secondary: Option<PlanLeg>,
}

impl TablePlan {
    pub fn full_scan() -> TablePlan {
        TablePlan {
            strategy: Strategy::FullScan,
            primary: None,
            secondary: None,
        }
    }

    /// Render the plan for EXPLAIN-style diagnostics.
    pub fn describe(&self, table: &str) -> String {
        match self.strategy {
            Strategy::FullScan => format!("SCAN {}", table),
            Strategy::SingleIndex => {
                let leg = self.primary.as_ref().expect("single-index plan has a leg");
                format!(
                    "SEARCH {} USING INDEX {} ({}{})",
                    table,
                    leg.index_name,
                    leg.consumed_column,
                    if leg.residual_constraints.is_empty() {
                        String::new()
                    } else {
                        format!(" +{} residual", leg.residual_constraints.len())
                    }
                )
            }
            Strategy::RowIdIntersection => {
                let a = self.primary.as_ref().expect("intersection has two legs");
                let b = self.secondary.as_ref().expect("intersection has two legs");
                format!(
                    "SEARCH {} USING ROWID INTERSECTION ({}, {})",
                    table, a.index_name, b.index_name
                )
            }
        }
    }
}
