//! Sargable-condition extraction
//!
//! Walks a predicate intent from the root, descending only through AND
//! nodes. OR and NOT make a branch unusable for index seeks, so the whole
//! subtree under either contributes nothing and is left to residual
//! filtering, as are operators outside the comparison set.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::intent::{Operand, PredicateIntent, PredicateOp};
use crate::plan::KeyType;
use crate::types::Value;

/// One index-usable condition on a bare column.
#[derive(Debug, Clone)]
pub struct SargableCondition {
    pub column: String,
    pub op: PredicateOp,
    pub key_type: KeyType,
    pub value: Value,
    /// Upper bound for `Between`.
    pub high: Option<Value>,
}

/// Extract sargable conditions for one table.
///
/// `alias` strips a matching qualifier from column names; a column that
/// stays qualified after stripping belongs to another table and is
/// skipped. `columns`, when given, restricts extraction to that list.
pub fn analyze(
    intent: &PredicateIntent,
    alias: Option<&str>,
    columns: Option<&[String]>,
    params: &HashMap<String, Value>,
) -> Result<Vec<SargableCondition>> {
    let mut out = Vec::new();
    let mut pending = vec![intent.root];
    while let Some(idx) = pending.pop() {
        let node = &intent.nodes[idx];
        match node.op {
            PredicateOp::And => {
                if let Some(l) = node.left {
                    pending.push(l);
                }
                if let Some(r) = node.right {
                    pending.push(r);
                }
            }
            PredicateOp::Or | PredicateOp::Not => {
                // Entire subtree handled by residual filtering.
            }
            PredicateOp::Eq
            | PredicateOp::Neq
            | PredicateOp::Lt
            | PredicateOp::Lte
            | PredicateOp::Gt
            | PredicateOp::Gte
            | PredicateOp::Between => {
                if let Some(cond) = extract(node, alias, columns, params)? {
                    out.push(cond);
                }
            }
            _ => {
                // In, Like and the null tests stay residual.
            }
        }
    }
    Ok(out)
}

fn extract(
    node: &crate::intent::PredicateNode,
    alias: Option<&str>,
    columns: Option<&[String]>,
    params: &HashMap<String, Value>,
) -> Result<Option<SargableCondition>> {
    let Some(raw_column) = node.column.as_deref() else {
        return Ok(None);
    };
    let column = match strip_alias(raw_column, alias) {
        Some(c) => c,
        None => return Ok(None),
    };
    if let Some(allowed) = columns {
        if !allowed.iter().any(|c| c.eq_ignore_ascii_case(column)) {
            return Ok(None);
        }
    }
    let Some(operand) = node.value.as_ref() else {
        return Ok(None);
    };
    let Some(value) = resolve(operand, params)? else {
        return Ok(None);
    };
    let mut high = None;
    if node.op == PredicateOp::Between {
        let Some(high_op) = node.high_value.as_ref() else {
            return Ok(None);
        };
        high = resolve(high_op, params)?;
        if high.is_none() {
            return Ok(None);
        }
    }
    // Mixed integer/real bounds promote to a real key.
    let low_type = KeyType::of(&value);
    let high_type = high.as_ref().and_then(KeyType::of);
    let key_type = match (low_type, high_type) {
        (Some(t), None) => t,
        (Some(a), Some(b)) if a == b => a,
        (Some(KeyType::Integer), Some(KeyType::Real))
        | (Some(KeyType::Real), Some(KeyType::Integer)) => KeyType::Real,
        _ => return Ok(None),
    };
    Ok(Some(SargableCondition {
        column: column.to_string(),
        op: node.op,
        key_type,
        value,
        high,
    }))
}

/// Strip a matching `alias.` prefix. Returns None when the column is
/// qualified with some other table's name.
fn strip_alias<'a>(column: &'a str, alias: Option<&str>) -> Option<&'a str> {
    match column.split_once('.') {
        None => Some(column),
        Some((qualifier, rest)) => match alias {
            Some(a) if qualifier.eq_ignore_ascii_case(a) => Some(rest),
            _ => None,
        },
    }
}

fn resolve(operand: &Operand, params: &HashMap<String, Value>) -> Result<Option<Value>> {
    match operand {
        Operand::Parameter(name) => {
            let value = params
                .get(name)
                .ok_or_else(|| Error::ParameterNotBound(name.clone()))?;
            Ok(KeyType::of(value).map(|_| value.clone()))
        }
        other => Ok(other.as_value().filter(|v| KeyType::of(v).is_some())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::PredicateBuilder;

    fn no_params() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[test]
    fn test_and_descends_both_branches() {
        let mut b = PredicateBuilder::new();
        let x = b.between("x", Operand::Float64(2.0), Operand::Float64(6.0));
        let y = b.between("y", Operand::Float64(1.0), Operand::Float64(3.0));
        let root = b.and(x, y);
        let intent = b.build(root);
        let mut conds = analyze(&intent, None, None, &no_params()).unwrap();
        conds.sort_by(|a, b| a.column.cmp(&b.column));
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0].column, "x");
        assert_eq!(conds[0].key_type, KeyType::Real);
        assert_eq!(conds[1].high, Some(Value::Real(3.0)));
    }

    #[test]
    fn test_or_subtree_contributes_nothing() {
        let mut b = PredicateBuilder::new();
        let a = b.compare(PredicateOp::Eq, "a", Operand::Int64(1));
        let x = b.compare(PredicateOp::Eq, "x", Operand::Int64(2));
        let y = b.compare(PredicateOp::Eq, "y", Operand::Int64(3));
        let or = b.or(x, y);
        let root = b.and(a, or);
        let intent = b.build(root);
        let conds = analyze(&intent, None, None, &no_params()).unwrap();
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].column, "a");
    }

    #[test]
    fn test_alias_stripping() {
        let mut b = PredicateBuilder::new();
        let ours = b.compare(PredicateOp::Gt, "u.age", Operand::Int64(21));
        let theirs = b.compare(PredicateOp::Eq, "o.kind", Operand::Text("x".into()));
        let root = b.and(ours, theirs);
        let intent = b.build(root);
        let conds = analyze(&intent, Some("u"), None, &no_params()).unwrap();
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].column, "age");
    }

    #[test]
    fn test_parameter_resolution() {
        let mut b = PredicateBuilder::new();
        let root = b.compare(PredicateOp::Gte, "age", Operand::Parameter("min".into()));
        let intent = b.build(root);

        assert!(matches!(
            analyze(&intent, None, None, &no_params()),
            Err(Error::ParameterNotBound(_))
        ));

        let mut params = HashMap::new();
        params.insert("min".to_string(), Value::Integer(18));
        let conds = analyze(&intent, None, None, &params).unwrap();
        assert_eq!(conds[0].value, Value::Integer(18));
        assert_eq!(conds[0].key_type, KeyType::Integer);
    }

    #[test]
    fn test_like_and_null_tests_are_not_sargable() {
        let mut b = PredicateBuilder::new();
        let like = b.compare(PredicateOp::StartsWith, "name", Operand::Text("A".into()));
        let null = b.is_null("age");
        let root = b.and(like, null);
        let intent = b.build(root);
        assert!(analyze(&intent, None, None, &no_params()).unwrap().is_empty());
    }
}
