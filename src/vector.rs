//! Vector search collaborator seam
//!
//! The engine does not build HNSW graphs; it consumes any index exposing
//! [`VectorIndex::search`] and post-filters candidates against a residual
//! predicate, stopping as soon as `k` inliers are found.

use std::collections::HashMap;

use crate::error::Result;
use crate::exec::filter::{matches_row, RowSchema};
use crate::intent::PredicateIntent;
use crate::types::{RowId, Value};

/// A similarity index over row vectors.
pub trait VectorIndex {
    /// Nearest neighbors of `query`, ascending by distance. `filter`,
    /// when given, restricts candidates by rowid before ranking.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(RowId) -> bool>,
    ) -> Vec<(RowId, f64)>;
}

/// A ranked candidate that passed residual filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub rowid: RowId,
    pub distance: f64,
}

/// Search with residual post-filtering.
///
/// `fetch` maps a rowid to its decoded row for predicate evaluation; the
/// search widens geometrically until `k` inliers pass or the index stops
/// returning new candidates.
pub fn search_filtered<F>(
    index: &dyn VectorIndex,
    query: &[f32],
    k: usize,
    residual: Option<&PredicateIntent>,
    schema: &RowSchema,
    params: &HashMap<String, Value>,
    strict: bool,
    mut fetch: F,
) -> Result<Vec<VectorMatch>>
where
    F: FnMut(RowId) -> Result<Vec<Value>>,
{
    let Some(residual) = residual else {
        return Ok(index
            .search(query, k, None)
            .into_iter()
            .map(|(rowid, distance)| VectorMatch { rowid, distance })
            .collect());
    };

    let mut out = Vec::with_capacity(k);
    let mut fan_out = k.max(1);
    loop {
        let candidates = index.search(query, fan_out, None);
        let exhausted = candidates.len() < fan_out;
        out.clear();
        for (rowid, distance) in candidates {
            let row = fetch(rowid)?;
            if matches_row(residual, &row, schema, params, strict)? {
                out.push(VectorMatch { rowid, distance });
                if out.len() == k {
                    return Ok(out);
                }
            }
        }
        if exhausted {
            return Ok(out);
        }
        fan_out *= 2;
    }
}
