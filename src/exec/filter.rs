//! Residual predicate evaluation
//!
//! Three-valued logic over decoded rows. A NULL operand makes any
//! comparison other than the null tests Unknown, and a top-level Unknown
//! rejects the row. Type mismatches are Unknown by default and an error
//! in strict mode.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::intent::{Operand, PredicateIntent, PredicateNode, PredicateOp};
use crate::types::{cmp_values, Value};

// ============================================================================
// Truth
// ============================================================================

/// Three-valued logic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    fn from_bool(b: bool) -> Truth {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

// ============================================================================
// Row Schema
// ============================================================================

/// Column layout of rows flowing through an operator, used to resolve
/// (possibly qualified) column names against the current projection.
#[derive(Debug, Clone, Default)]
pub struct RowSchema {
    columns: Vec<ColumnRef>,
}

#[derive(Debug, Clone)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl RowSchema {
    pub fn new(columns: Vec<ColumnRef>) -> RowSchema {
        RowSchema { columns }
    }

    /// Schema of one table's columns under an optional alias.
    pub fn for_table(label: &str, column_names: &[String]) -> RowSchema {
        RowSchema {
            columns: column_names
                .iter()
                .map(|name| ColumnRef {
                    qualifier: Some(label.to_string()),
                    name: name.clone(),
                })
                .collect(),
        }
    }

    /// Unqualified schema, e.g. aggregate output columns.
    pub fn unqualified(column_names: &[String]) -> RowSchema {
        RowSchema {
            columns: column_names
                .iter()
                .map(|name| ColumnRef {
                    qualifier: None,
                    name: name.clone(),
                })
                .collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnRef] {
        &self.columns
    }

    /// Concatenate two schemas (merged join output).
    pub fn merged(&self, other: &RowSchema) -> RowSchema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        RowSchema { columns }
    }

    /// Resolve a column reference to its position.
    pub fn resolve(&self, name: &str) -> Result<usize> {
        let (qualifier, bare) = match name.split_once('.') {
            Some((q, n)) => (Some(q), n),
            None => (None, name),
        };
        let mut found: Option<usize> = None;
        for (i, col) in self.columns.iter().enumerate() {
            if !col.name.eq_ignore_ascii_case(bare) {
                continue;
            }
            if let Some(q) = qualifier {
                let matches = col
                    .qualifier
                    .as_deref()
                    .map(|cq| cq.eq_ignore_ascii_case(q))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            if found.is_some() {
                return Err(Error::AmbiguousColumn(name.to_string()));
            }
            found = Some(i);
        }
        found.ok_or_else(|| Error::UnknownColumn(name.to_string()))
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Evaluate an intent against a row. Top-level Unknown rejects.
pub fn matches_row(
    intent: &PredicateIntent,
    row: &[Value],
    schema: &RowSchema,
    params: &HashMap<String, Value>,
    strict: bool,
) -> Result<bool> {
    Ok(evaluate(intent, row, schema, params, strict)? == Truth::True)
}

/// Evaluate an intent to its three-valued result.
pub fn evaluate(
    intent: &PredicateIntent,
    row: &[Value],
    schema: &RowSchema,
    params: &HashMap<String, Value>,
    strict: bool,
) -> Result<Truth> {
    eval_node(intent, intent.root, row, schema, params, strict)
}

fn eval_node(
    intent: &PredicateIntent,
    idx: usize,
    row: &[Value],
    schema: &RowSchema,
    params: &HashMap<String, Value>,
    strict: bool,
) -> Result<Truth> {
    let node = &intent.nodes[idx];
    match node.op {
        PredicateOp::And => {
            let l = child(intent, node.left, row, schema, params, strict)?;
            if l == Truth::False {
                return Ok(Truth::False);
            }
            let r = child(intent, node.right, row, schema, params, strict)?;
            Ok(l.and(r))
        }
        PredicateOp::Or => {
            let l = child(intent, node.left, row, schema, params, strict)?;
            if l == Truth::True {
                return Ok(Truth::True);
            }
            let r = child(intent, node.right, row, schema, params, strict)?;
            Ok(l.or(r))
        }
        PredicateOp::Not => Ok(child(intent, node.left, row, schema, params, strict)?.not()),
        _ => eval_leaf(node, row, schema, params, strict),
    }
}

fn child(
    intent: &PredicateIntent,
    link: Option<usize>,
    row: &[Value],
    schema: &RowSchema,
    params: &HashMap<String, Value>,
    strict: bool,
) -> Result<Truth> {
    let idx = link.ok_or(Error::Misuse("connective node without a child"))?;
    eval_node(intent, idx, row, schema, params, strict)
}

fn eval_leaf(
    node: &PredicateNode,
    row: &[Value],
    schema: &RowSchema,
    params: &HashMap<String, Value>,
    strict: bool,
) -> Result<Truth> {
    let column = node
        .column
        .as_deref()
        .ok_or(Error::Misuse("comparison node without a column"))?;
    let cell = &row[schema.resolve(column)?];

    match node.op {
        PredicateOp::IsNull => return Ok(Truth::from_bool(cell.is_null())),
        PredicateOp::IsNotNull => return Ok(Truth::from_bool(!cell.is_null())),
        _ => {}
    }
    if cell.is_null() {
        return Ok(Truth::Unknown);
    }

    let operand = node
        .value
        .as_ref()
        .ok_or(Error::Misuse("comparison node without a value"))?;

    match node.op {
        PredicateOp::Eq | PredicateOp::Neq | PredicateOp::Lt | PredicateOp::Lte
        | PredicateOp::Gt | PredicateOp::Gte => {
            let value = operand_value(operand, params)?;
            let Some(ord) = compare(cell, &value, strict)? else {
                return Ok(Truth::Unknown);
            };
            Ok(Truth::from_bool(match node.op {
                PredicateOp::Eq => ord == Ordering::Equal,
                PredicateOp::Neq => ord != Ordering::Equal,
                PredicateOp::Lt => ord == Ordering::Less,
                PredicateOp::Lte => ord != Ordering::Greater,
                PredicateOp::Gt => ord == Ordering::Greater,
                PredicateOp::Gte => ord != Ordering::Less,
                _ => unreachable!(),
            }))
        }
        PredicateOp::Between => {
            let low = operand_value(operand, params)?;
            let high_op = node
                .high_value
                .as_ref()
                .ok_or(Error::Misuse("between without a high bound"))?;
            let high = operand_value(high_op, params)?;
            let Some(lo) = compare(cell, &low, strict)? else {
                return Ok(Truth::Unknown);
            };
            let Some(hi) = compare(cell, &high, strict)? else {
                return Ok(Truth::Unknown);
            };
            Ok(Truth::from_bool(lo != Ordering::Less && hi != Ordering::Greater))
        }
        PredicateOp::In => match operand {
            Operand::Int64Set(set) => match cell {
                Value::Integer(i) => Ok(Truth::from_bool(set.contains(i))),
                Value::Real(r) if r.fract() == 0.0 => {
                    Ok(Truth::from_bool(set.contains(&(*r as i64))))
                }
                _ => mismatch(strict, "IN over an integer set"),
            },
            Operand::TextSet(set) => match cell {
                Value::Text(s) => Ok(Truth::from_bool(set.iter().any(|t| t == s))),
                _ => mismatch(strict, "IN over a text set"),
            },
            _ => Err(Error::Misuse("IN without a set operand")),
        },
        PredicateOp::Like | PredicateOp::StartsWith | PredicateOp::EndsWith
        | PredicateOp::Contains => {
            let pattern = match operand_value(operand, params)? {
                Value::Text(s) => s,
                _ => return mismatch(strict, "text pattern"),
            };
            let Value::Text(subject) = cell else {
                return mismatch(strict, "text pattern over non-text");
            };
            let subject = subject.to_ascii_lowercase();
            let needle = pattern.to_ascii_lowercase();
            Ok(Truth::from_bool(match node.op {
                PredicateOp::Like => like_match(&needle, &subject),
                PredicateOp::StartsWith => subject.starts_with(&needle),
                PredicateOp::EndsWith => subject.ends_with(&needle),
                PredicateOp::Contains => subject.contains(&needle),
                _ => unreachable!(),
            }))
        }
        _ => Err(Error::Misuse("connective reached leaf evaluation")),
    }
}

fn mismatch(strict: bool, what: &str) -> Result<Truth> {
    if strict {
        Err(Error::TypeError(what.to_string()))
    } else {
        Ok(Truth::Unknown)
    }
}

fn operand_value(operand: &Operand, params: &HashMap<String, Value>) -> Result<Value> {
    match operand {
        Operand::Parameter(name) => params
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ParameterNotBound(name.clone())),
        other => other
            .as_value()
            .ok_or(Error::Misuse("set operand outside IN")),
    }
}

/// Compare comparable values; None on a type-class mismatch.
fn compare(cell: &Value, value: &Value, strict: bool) -> Result<Option<Ordering>> {
    let comparable = matches!(
        (cell, value),
        (Value::Integer(_) | Value::Real(_), Value::Integer(_) | Value::Real(_))
            | (Value::Text(_), Value::Text(_))
            | (Value::Blob(_), Value::Blob(_))
    );
    if !comparable {
        if value.is_null() {
            return Ok(None);
        }
        if strict {
            return Err(Error::TypeError(format!(
                "cannot compare {:?} with {:?}",
                cell.column_type(),
                value.column_type()
            )));
        }
        return Ok(None);
    }
    Ok(Some(cmp_values(cell, value)))
}

/// Glob-style LIKE with `%` (any run) and `_` (single char), over
/// already-lowercased inputs.
fn like_match(pattern: &str, subject: &str) -> bool {
    fn rec(p: &[u8], s: &[u8]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some(b'%') => {
                for skip in 0..=s.len() {
                    if rec(&p[1..], &s[skip..]) {
                        return true;
                    }
                }
                false
            }
            Some(b'_') => !s.is_empty() && rec(&p[1..], &s[1..]),
            Some(&c) => s.first() == Some(&c) && rec(&p[1..], &s[1..]),
        }
    }
    rec(pattern.as_bytes(), subject.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::PredicateBuilder;

    fn schema() -> RowSchema {
        RowSchema::unqualified(&["name".to_string(), "age".to_string()])
    }

    fn no_params() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[test]
    fn test_comparison_and_null_rejection() {
        let mut b = PredicateBuilder::new();
        let root = b.compare(PredicateOp::Gt, "age", Operand::Int64(28));
        let intent = b.build(root);
        let schema = schema();

        let row = vec![Value::Text("Alice".into()), Value::Integer(30)];
        assert!(matches_row(&intent, &row, &schema, &no_params(), false).unwrap());

        let row = vec![Value::Text("Nil".into()), Value::Null];
        assert_eq!(
            evaluate(&intent, &row, &schema, &no_params(), false).unwrap(),
            Truth::Unknown
        );
        assert!(!matches_row(&intent, &row, &schema, &no_params(), false).unwrap());
    }

    #[test]
    fn test_three_valued_connectives() {
        // age > 28 OR name IS NULL, with age NULL and name set:
        // Unknown OR False = Unknown.
        let mut b = PredicateBuilder::new();
        let gt = b.compare(PredicateOp::Gt, "age", Operand::Int64(28));
        let null = b.is_null("name");
        let root = b.or(gt, null);
        let intent = b.build(root);
        let row = vec![Value::Text("Ann".into()), Value::Null];
        assert_eq!(
            evaluate(&intent, &row, &schema(), &no_params(), false).unwrap(),
            Truth::Unknown
        );

        // NOT Unknown = Unknown.
        let mut b = PredicateBuilder::new();
        let gt = b.compare(PredicateOp::Gt, "age", Operand::Int64(28));
        let root = b.not(gt);
        let intent = b.build(root);
        assert_eq!(
            evaluate(&intent, &row, &schema(), &no_params(), false).unwrap(),
            Truth::Unknown
        );
    }

    #[test]
    fn test_type_mismatch_unknown_vs_strict() {
        let mut b = PredicateBuilder::new();
        let root = b.compare(PredicateOp::Eq, "age", Operand::Text("thirty".into()));
        let intent = b.build(root);
        let row = vec![Value::Text("Ann".into()), Value::Integer(30)];
        assert_eq!(
            evaluate(&intent, &row, &schema(), &no_params(), false).unwrap(),
            Truth::Unknown
        );
        assert!(matches!(
            evaluate(&intent, &row, &schema(), &no_params(), true),
            Err(Error::TypeError(_))
        ));
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like_match("al%", "alice"));
        assert!(like_match("%ce", "alice"));
        assert!(like_match("a_ice", "alice"));
        assert!(like_match("%li%", "alice"));
        assert!(!like_match("al", "alice"));
        assert!(!like_match("a_ice", "ace"));
    }

    #[test]
    fn test_in_sets() {
        let mut b = PredicateBuilder::new();
        let root = b.compare(PredicateOp::In, "age", Operand::Int64Set(vec![25, 30]));
        let intent = b.build(root);
        let row = vec![Value::Text("Ann".into()), Value::Integer(30)];
        assert!(matches_row(&intent, &row, &schema(), &no_params(), false).unwrap());
        let row = vec![Value::Text("Ann".into()), Value::Integer(31)];
        assert!(!matches_row(&intent, &row, &schema(), &no_params(), false).unwrap());
    }

    #[test]
    fn test_qualified_resolution_and_ambiguity() {
        let schema = RowSchema::new(vec![
            ColumnRef {
                qualifier: Some("u".into()),
                name: "id".into(),
            },
            ColumnRef {
                qualifier: Some("o".into()),
                name: "id".into(),
            },
        ]);
        assert_eq!(schema.resolve("u.id").unwrap(), 0);
        assert_eq!(schema.resolve("o.id").unwrap(), 1);
        assert!(matches!(schema.resolve("id"), Err(Error::AmbiguousColumn(_))));
        assert!(matches!(schema.resolve("x"), Err(Error::UnknownColumn(_))));
    }

    #[test]
    fn test_missing_parameter_errors() {
        let mut b = PredicateBuilder::new();
        let root = b.compare(PredicateOp::Eq, "age", Operand::Parameter("p".into()));
        let intent = b.build(root);
        let row = vec![Value::Text("Ann".into()), Value::Integer(30)];
        assert!(matches!(
            matches_row(&intent, &row, &schema(), &no_params(), false),
            Err(Error::ParameterNotBound(_))
        ));
    }
}
