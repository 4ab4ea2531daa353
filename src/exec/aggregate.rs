//! Streaming aggregation
//!
//! Rows are delivered one at a time via [`Aggregator::accumulate`];
//! [`Aggregator::finalize`] produces the grouped output. NULL inputs are
//! skipped by every aggregate except `COUNT(*)`; NULL group keys compare
//! equal to one another. Output order is the first-occurrence order of
//! each group, deterministic for a given input order.

use std::collections::HashMap;

use crate::error::Result;
use crate::intent::AggregateFunc;
use crate::types::{cmp_values, RowKey, Value};

// ============================================================================
// Configuration
// ============================================================================

/// One aggregate over a source column (`arg` is None for `COUNT(*)`).
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub func: AggregateFunc,
    pub arg: Option<usize>,
}

/// One output column: either a grouping column of the source or the
/// result of an aggregate.
#[derive(Debug, Clone, Copy)]
pub enum OutputCol {
    Group(usize),
    Agg(usize),
}

// ============================================================================
// Accumulators
// ============================================================================

#[derive(Debug, Clone)]
enum Acc {
    Count(i64),
    /// Integer until the first real input promotes the accumulator.
    SumInt { sum: i64, seen: bool },
    SumReal { sum: f64, seen: bool },
    Avg { sum: f64, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Acc {
    fn new(func: AggregateFunc) -> Acc {
        match func {
            AggregateFunc::CountStar | AggregateFunc::Count => Acc::Count(0),
            AggregateFunc::Sum => Acc::SumInt { sum: 0, seen: false },
            AggregateFunc::Avg => Acc::Avg { sum: 0.0, count: 0 },
            AggregateFunc::Min => Acc::Min(None),
            AggregateFunc::Max => Acc::Max(None),
        }
    }

    fn feed(&mut self, value: Option<&Value>) {
        match self {
            Acc::Count(n) => match value {
                // COUNT(*) counts every row; COUNT(col) skips NULL.
                None => *n += 1,
                Some(v) if !v.is_null() => *n += 1,
                Some(_) => {}
            },
            Acc::SumInt { sum, seen } => match value {
                Some(Value::Integer(i)) => {
                    *sum += i;
                    *seen = true;
                }
                Some(Value::Real(r)) => {
                    *self = Acc::SumReal {
                        sum: *sum as f64 + r,
                        seen: true,
                    };
                }
                _ => {}
            },
            Acc::SumReal { sum, seen } => match value {
                Some(Value::Integer(i)) => {
                    *sum += *i as f64;
                    *seen = true;
                }
                Some(Value::Real(r)) => {
                    *sum += r;
                    *seen = true;
                }
                _ => {}
            },
            Acc::Avg { sum, count } => match value {
                Some(Value::Integer(i)) => {
                    *sum += *i as f64;
                    *count += 1;
                }
                Some(Value::Real(r)) => {
                    *sum += r;
                    *count += 1;
                }
                _ => {}
            },
            Acc::Min(best) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && best
                            .as_ref()
                            .map(|b| cmp_values(v, b) == std::cmp::Ordering::Less)
                            .unwrap_or(true)
                    {
                        *best = Some(v.clone());
                    }
                }
            }
            Acc::Max(best) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && best
                            .as_ref()
                            .map(|b| cmp_values(v, b) == std::cmp::Ordering::Greater)
                            .unwrap_or(true)
                    {
                        *best = Some(v.clone());
                    }
                }
            }
        }
    }

    fn result(&self) -> Value {
        match self {
            Acc::Count(n) => Value::Integer(*n),
            Acc::SumInt { sum, seen } => {
                if *seen {
                    Value::Integer(*sum)
                } else {
                    Value::Null
                }
            }
            Acc::SumReal { sum, seen } => {
                if *seen {
                    Value::Real(*sum)
                } else {
                    Value::Null
                }
            }
            Acc::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Real(sum / *count as f64)
                }
            }
            Acc::Min(best) | Acc::Max(best) => best.clone().unwrap_or(Value::Null),
        }
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Streaming grouped aggregation kernel.
pub struct Aggregator {
    group_by: Vec<usize>,
    aggregates: Vec<AggregateSpec>,
    outputs: Vec<OutputCol>,
    output_columns: Vec<String>,
    groups: HashMap<RowKey, usize>,
    /// Per-group key values and accumulator states, in arrival order.
    states: Vec<(Vec<Value>, Vec<Acc>)>,
}

impl Aggregator {
    pub fn new(
        group_by: Vec<usize>,
        aggregates: Vec<AggregateSpec>,
        outputs: Vec<OutputCol>,
        output_columns: Vec<String>,
    ) -> Aggregator {
        let mut agg = Aggregator {
            group_by,
            aggregates,
            outputs,
            output_columns,
            groups: HashMap::new(),
            states: Vec::new(),
        };
        // A global aggregate has exactly one group, present even for an
        // empty input.
        if agg.group_by.is_empty() {
            agg.states.push((Vec::new(), agg.fresh_accs()));
        }
        agg
    }

    fn fresh_accs(&self) -> Vec<Acc> {
        self.aggregates.iter().map(|a| Acc::new(a.func)).collect()
    }

    /// Deliver one source row.
    pub fn accumulate(&mut self, row: &[Value]) -> Result<()> {
        let state_idx = if self.group_by.is_empty() {
            0
        } else {
            let key_values: Vec<Value> =
                self.group_by.iter().map(|&i| row[i].clone()).collect();
            let key = RowKey::new(&key_values);
            match self.groups.get(&key) {
                Some(&idx) => idx,
                None => {
                    let idx = self.states.len();
                    self.states.push((key_values, self.fresh_accs()));
                    self.groups.insert(key, idx);
                    idx
                }
            }
        };
        let accs = &mut self.states[state_idx].1;
        for (acc, spec) in accs.iter_mut().zip(self.aggregates.iter()) {
            acc.feed(spec.arg.map(|i| &row[i]));
        }
        Ok(())
    }

    /// Produce the grouped rows and their column names.
    pub fn finalize(self) -> (Vec<Vec<Value>>, Vec<String>) {
        let mut rows = Vec::with_capacity(self.states.len());
        for (key_values, accs) in &self.states {
            let row: Vec<Value> = self
                .outputs
                .iter()
                .map(|out| match out {
                    OutputCol::Group(i) => {
                        let pos = self
                            .group_by
                            .iter()
                            .position(|g| g == i)
                            .expect("output references a grouping column");
                        key_values[pos].clone()
                    }
                    OutputCol::Agg(i) => accs[*i].result(),
                })
                .collect();
            rows.push(row);
        }
        (rows, self.output_columns)
    }
}
