//! Rule-based index selection
//!
//! Chooses between a full scan, a single-index seek, and a two-index
//! rowid intersection. Preference among single-index candidates:
//! equality over range, unique over non-unique, a fully-constrained
//! column set over a partial one, then fewer index columns, with ties
//! broken by index name. An index whose leading column is unconstrained
//! is never chosen.

use std::cmp::Ordering;

use itertools::Itertools;
use log::debug;

use crate::intent::PredicateOp;
use crate::plan::sargable::SargableCondition;
use crate::plan::{KeyType, PlanLeg, SeekOp, Strategy, TablePlan};
use crate::schema::Index;
use crate::types::cmp_values;

/// Select an access plan for one table from its sargable conditions.
pub fn select_plan(conditions: &[SargableCondition], indexes: &[&Index]) -> TablePlan {
    let mut candidates: Vec<Candidate> = indexes
        .iter()
        .filter_map(|idx| Candidate::build(idx, conditions))
        .collect();
    if candidates.is_empty() {
        return TablePlan::full_scan();
    }
    candidates.sort_by(Candidate::preference);

    // A candidate covering every conditioned column wins outright.
    if let Some(best) = candidates.iter().find(|c| c.covers_all) {
        debug!("plan: single index {} (full cover)", best.leg.index_name);
        return TablePlan {
            strategy: Strategy::SingleIndex,
            primary: Some(best.leg.clone()),
            secondary: None,
        };
    }

    // No single index covers the predicate: intersect two single-column
    // indexes over different columns when available.
    let pair = candidates
        .iter()
        .filter(|c| c.single_column)
        .unique_by(|c| c.leg.consumed_column.to_ascii_lowercase())
        .take(2)
        .collect::<Vec<_>>();
    if pair.len() == 2 {
        debug!(
            "plan: rowid intersection of {} and {}",
            pair[0].leg.index_name, pair[1].leg.index_name
        );
        return TablePlan {
            strategy: Strategy::RowIdIntersection,
            primary: Some(pair[0].leg.clone()),
            secondary: Some(pair[1].leg.clone()),
        };
    }

    let best = &candidates[0];
    debug!("plan: single index {} (partial cover)", best.leg.index_name);
    TablePlan {
        strategy: Strategy::SingleIndex,
        primary: Some(best.leg.clone()),
        secondary: None,
    }
}

// ============================================================================
// Candidates
// ============================================================================

struct Candidate {
    leg: PlanLeg,
    has_eq: bool,
    is_unique: bool,
    covers_all: bool,
    single_column: bool,
    column_count: usize,
}

impl Candidate {
    fn build(index: &Index, conditions: &[SargableCondition]) -> Option<Candidate> {
        let leading = index.columns.first()?;
        let leading_conds: Vec<&SargableCondition> = conditions
            .iter()
            .filter(|c| {
                c.column.eq_ignore_ascii_case(&leading.name) && c.op != PredicateOp::Neq
            })
            .collect();
        if leading_conds.is_empty() {
            return None;
        }
        // A descending leading column inverts range direction; only
        // equality seeks stay straightforward, so ranges fall back.
        if leading.descending && !leading_conds.iter().any(|c| c.op == PredicateOp::Eq) {
            return None;
        }

        let (seek_op, seek_key, upper_bound, upper_inclusive, key_type) =
            fold_bounds(&leading_conds)?;

        // Conditions on the index's later columns become per-entry
        // residual constraints; anything else stays with the row filter.
        let later_columns: Vec<&str> = index.columns[1..]
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let residual_constraints: Vec<SargableCondition> = conditions
            .iter()
            .filter(|c| {
                later_columns
                    .iter()
                    .any(|l| l.eq_ignore_ascii_case(&c.column))
            })
            .cloned()
            .collect();

        let covered: Vec<&str> = index.columns.iter().map(|c| c.name.as_str()).collect();
        let covers_all = conditions.iter().all(|c| {
            covered.iter().any(|l| l.eq_ignore_ascii_case(&c.column))
        });

        Some(Candidate {
            has_eq: seek_op == SeekOp::Eq,
            is_unique: index.is_unique,
            covers_all,
            single_column: index.columns.len() == 1,
            column_count: index.columns.len(),
            leg: PlanLeg {
                index_name: index.name.clone(),
                consumed_column: leading.name.clone(),
                seek_op,
                seek_key,
                upper_bound,
                upper_inclusive,
                key_type,
                residual_constraints,
            },
        })
    }

    /// Deterministic preference order; earlier sorts first.
    fn preference(a: &Candidate, b: &Candidate) -> Ordering {
        (!a.has_eq, !a.is_unique, !a.covers_all, a.column_count, &a.leg.index_name).cmp(&(
            !b.has_eq,
            !b.is_unique,
            !b.covers_all,
            b.column_count,
            &b.leg.index_name,
        ))
    }
}

type Bounds = (
    SeekOp,
    Option<crate::types::Value>,
    Option<crate::types::Value>,
    bool,
    KeyType,
);

/// Fold the leading-column conditions into seek bounds, keeping the
/// tightest lower and upper bound seen.
fn fold_bounds(conds: &[&SargableCondition]) -> Option<Bounds> {
    // Equality dominates every range bound.
    if let Some(eq) = conds.iter().find(|c| c.op == PredicateOp::Eq) {
        return Some((
            SeekOp::Eq,
            Some(eq.value.clone()),
            Some(eq.value.clone()),
            true,
            eq.key_type,
        ));
    }

    let mut seek_op = SeekOp::First;
    let mut seek_key: Option<crate::types::Value> = None;
    let mut upper: Option<crate::types::Value> = None;
    let mut upper_inclusive = false;
    let mut key_type: Option<KeyType> = None;

    for cond in conds {
        let promote = |current: Option<KeyType>| match (current, cond.key_type) {
            (None, t) => Some(t),
            (Some(a), b) if a == b => Some(a),
            (Some(KeyType::Integer), KeyType::Real)
            | (Some(KeyType::Real), KeyType::Integer) => Some(KeyType::Real),
            (Some(a), _) => Some(a),
        };
        match cond.op {
            PredicateOp::Gt | PredicateOp::Gte => {
                let tighter = match &seek_key {
                    None => true,
                    Some(existing) => cmp_values(&cond.value, existing) == Ordering::Greater,
                };
                if tighter {
                    seek_key = Some(cond.value.clone());
                    seek_op = if cond.op == PredicateOp::Gt {
                        SeekOp::Gt
                    } else {
                        SeekOp::Ge
                    };
                }
                key_type = promote(key_type);
            }
            PredicateOp::Lt | PredicateOp::Lte => {
                let tighter = match &upper {
                    None => true,
                    Some(existing) => cmp_values(&cond.value, existing) == Ordering::Less,
                };
                if tighter {
                    upper = Some(cond.value.clone());
                    upper_inclusive = cond.op == PredicateOp::Lte;
                }
                key_type = promote(key_type);
            }
            PredicateOp::Between => {
                let low_tighter = match &seek_key {
                    None => true,
                    Some(existing) => cmp_values(&cond.value, existing) == Ordering::Greater,
                };
                if low_tighter {
                    seek_key = Some(cond.value.clone());
                    seek_op = SeekOp::Ge;
                }
                let high = cond.high.clone().expect("between carries a high bound");
                let high_tighter = match &upper {
                    None => true,
                    Some(existing) => cmp_values(&high, existing) == Ordering::Less,
                };
                if high_tighter {
                    upper = Some(high);
                    upper_inclusive = true;
                }
                key_type = promote(key_type);
            }
            _ => {}
        }
    }

    if seek_key.is_none() && upper.is_none() {
        return None;
    }
    Some((seek_op, seek_key, upper, upper_inclusive, key_type?))
}
