//! Plan execution against one table
//!
//! [`PlannedScan`] is the streaming row source behind every table
//! reference: a full table scan, a single-index seek with per-entry
//! residual constraints, or the rowid intersection of two index legs.
//! Residual predicate evaluation happens here, so every emitted row
//! already satisfies the query's filter.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::exec::filter::{matches_row, RowSchema};
use crate::intent::{PredicateIntent, PredicateOp};
use crate::plan::sargable::SargableCondition;
use crate::plan::{PlanLeg, SeekOp, Strategy, TablePlan};
use crate::schema::{Index, Table};
use crate::storage::btree::{compare_index_key, BtCursor};
use crate::storage::record::decode_record;
use crate::storage::source::PageSource;
use crate::types::{cmp_column_value, CancelToken, ColumnValue, RowId, SortOrder, Value};

// ============================================================================
// Row Decoding
// ============================================================================

/// Decode the current table-cursor payload into a full-width row,
/// substituting the rowid for an `INTEGER PRIMARY KEY` alias column.
pub fn decode_table_row(table: &Table, payload: &[u8], rowid: RowId) -> Result<Vec<Value>> {
    let values = decode_record(payload)?;
    if values.len() != table.columns.len() {
        return Err(Error::SchemaMismatch {
            table: table.name.clone(),
            declared: table.columns.len(),
            found: values.len(),
        });
    }
    let alias = table.rowid_alias();
    Ok(values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if alias == Some(i) {
                Value::Integer(rowid)
            } else {
                v.to_value()
            }
        })
        .collect())
}

// ============================================================================
// Index Leg
// ============================================================================

/// One index leg: a positioned cursor plus its bounds and per-entry
/// residual constraints.
struct IndexLegScan {
    cursor: BtCursor,
    index: Index,
    orders: Vec<SortOrder>,
    leg: PlanLeg,
    primed: bool,
}

impl IndexLegScan {
    fn new(src: Arc<dyn PageSource>, usable: u32, index: Index, leg: PlanLeg, cancel: Option<CancelToken>) -> IndexLegScan {
        let mut cursor = BtCursor::new(src, index.root_page, usable);
        if let Some(tok) = cancel {
            cursor = cursor.with_cancel(tok);
        }
        let orders = index.sort_orders();
        IndexLegScan {
            cursor,
            index,
            orders,
            leg,
            primed: false,
        }
    }

    /// Next in-bounds entry passing the leg's residual constraints;
    /// yields the trailing rowid.
    fn next_rowid(&mut self) -> Result<Option<RowId>> {
        loop {
            let valid = if !self.primed {
                self.primed = true;
                match (&self.leg.seek_op, &self.leg.seek_key) {
                    (SeekOp::First, _) | (_, None) => self.cursor.first()?,
                    (op, Some(key)) => {
                        let allow_equal = !matches!(op, SeekOp::Gt);
                        self.cursor
                            .index_seek(&[key.clone()], &self.orders, allow_equal)?;
                        self.cursor.is_valid()
                    }
                }
            } else {
                self.cursor.move_next()?
            };
            if !valid {
                return Ok(None);
            }

            let payload = self.cursor.payload()?;
            if let Some(upper) = &self.leg.upper_bound {
                let ord = compare_index_key(payload, std::slice::from_ref(upper), &self.orders)?;
                let past = match ord {
                    Ordering::Greater => true,
                    Ordering::Equal => !self.leg.upper_inclusive,
                    Ordering::Less => false,
                };
                if past {
                    return Ok(None);
                }
            }

            let entry = decode_record(payload)?;
            if self.entry_passes(&entry)? {
                let rowid = self.cursor.rowid()?;
                return Ok(Some(rowid));
            }
        }
    }

    /// Check the leg's residual constraints against the decoded entry,
    /// before any row fetch.
    fn entry_passes(&self, entry: &[ColumnValue<'_>]) -> Result<bool> {
        for cond in &self.leg.residual_constraints {
            let Some(pos) = self
                .index
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(&cond.column))
            else {
                continue;
            };
            let Some(cell) = entry.get(pos) else {
                return Ok(false);
            };
            if cell.is_null() || !constraint_holds(cell, cond) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn constraint_holds(cell: &ColumnValue<'_>, cond: &SargableCondition) -> bool {
    let ord = cmp_column_value(cell, &cond.value);
    match cond.op {
        PredicateOp::Eq => ord == Ordering::Equal,
        PredicateOp::Neq => ord != Ordering::Equal,
        PredicateOp::Lt => ord == Ordering::Less,
        PredicateOp::Lte => ord != Ordering::Greater,
        PredicateOp::Gt => ord == Ordering::Greater,
        PredicateOp::Gte => ord != Ordering::Less,
        PredicateOp::Between => {
            let Some(high) = &cond.high else {
                return false;
            };
            ord != Ordering::Less && cmp_column_value(cell, high) != Ordering::Greater
        }
        _ => false,
    }
}

// ============================================================================
// Planned Scan
// ============================================================================

enum ScanMode {
    /// Full table scan.
    Table,
    /// Single-index seek driving rowid fetches.
    Index(Box<IndexLegScan>),
    /// Pre-intersected rowid list, ascending.
    Rowids { list: Vec<RowId>, pos: usize },
}

/// Streaming, filtered row source for one table reference.
pub struct PlannedScan {
    table: Table,
    schema: RowSchema,
    residual: Option<PredicateIntent>,
    params: HashMap<String, Value>,
    strict: bool,
    table_cursor: BtCursor,
    mode: ScanMode,
    cancel: Option<CancelToken>,
    done: bool,
}

impl PlannedScan {
    /// Open a scan. `legs` must carry the resolved [`Index`] for each
    /// plan leg, in plan order.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        src: Arc<dyn PageSource>,
        usable: u32,
        table: Table,
        label: &str,
        plan: TablePlan,
        legs: Vec<Index>,
        residual: Option<PredicateIntent>,
        params: HashMap<String, Value>,
        strict: bool,
        cancel: Option<CancelToken>,
    ) -> Result<PlannedScan> {
        let mut table_cursor = BtCursor::new(Arc::clone(&src), table.root_page, usable);
        if let Some(tok) = &cancel {
            table_cursor = table_cursor.with_cancel(tok.clone());
        }
        let schema = RowSchema::for_table(label, &table.column_names());

        let mode = match plan.strategy {
            Strategy::FullScan => ScanMode::Table,
            Strategy::SingleIndex => {
                let leg = plan.primary.ok_or(Error::Misuse("single-index plan without a leg"))?;
                let index = legs
                    .into_iter()
                    .next()
                    .ok_or(Error::Misuse("plan leg without its index"))?;
                ScanMode::Index(Box::new(IndexLegScan::new(
                    Arc::clone(&src),
                    usable,
                    index,
                    leg,
                    cancel.clone(),
                )))
            }
            Strategy::RowIdIntersection => {
                let primary = plan
                    .primary
                    .ok_or(Error::Misuse("intersection plan without its first leg"))?;
                let secondary = plan
                    .secondary
                    .ok_or(Error::Misuse("intersection plan without its second leg"))?;
                let mut legs = legs.into_iter();
                let first_index = legs.next().ok_or(Error::Misuse("missing first index"))?;
                let second_index = legs.next().ok_or(Error::Misuse("missing second index"))?;

                let mut first = IndexLegScan::new(
                    Arc::clone(&src),
                    usable,
                    first_index,
                    primary,
                    cancel.clone(),
                );
                let mut seen = HashSet::new();
                while let Some(rowid) = first.next_rowid()? {
                    seen.insert(rowid);
                }
                let mut second = IndexLegScan::new(
                    Arc::clone(&src),
                    usable,
                    second_index,
                    secondary,
                    cancel.clone(),
                );
                let mut list = Vec::new();
                let mut emitted = HashSet::new();
                while let Some(rowid) = second.next_rowid()? {
                    if seen.contains(&rowid) && emitted.insert(rowid) {
                        list.push(rowid);
                    }
                }
                list.sort_unstable();
                ScanMode::Rowids { list, pos: 0 }
            }
        };

        Ok(PlannedScan {
            table,
            schema,
            residual,
            params,
            strict,
            table_cursor,
            mode,
            cancel,
            done: false,
        })
    }

    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    /// Fetch the table row for `rowid`; plans only produce rowids that
    /// exist in the table B-tree.
    fn fetch(&mut self, rowid: RowId) -> Result<Vec<Value>> {
        if !self.table_cursor.table_seek(rowid)? {
            return Err(Error::CorruptBTree {
                pgno: self.table.root_page,
                reason: "index rowid missing from table",
            });
        }
        decode_table_row(&self.table, self.table_cursor.payload()?, rowid)
    }

    fn step(&mut self) -> Result<Option<Vec<Value>>> {
        loop {
            if let Some(tok) = &self.cancel {
                if tok.is_canceled() {
                    return Err(Error::Canceled);
                }
            }
            // Resolve the next rowid to fetch first; the table cursor is
            // borrowed separately for the fetch itself.
            let fetch_rowid: Option<RowId> = match &mut self.mode {
                ScanMode::Table => None,
                ScanMode::Index(leg) => match leg.next_rowid()? {
                    None => return Ok(None),
                    Some(rowid) => Some(rowid),
                },
                ScanMode::Rowids { list, pos } => {
                    if *pos >= list.len() {
                        return Ok(None);
                    }
                    let rowid = list[*pos];
                    *pos += 1;
                    Some(rowid)
                }
            };
            let row = match fetch_rowid {
                Some(rowid) => self.fetch(rowid)?,
                None => {
                    if !self.table_cursor.move_next()? {
                        return Ok(None);
                    }
                    let rowid = self.table_cursor.rowid()?;
                    decode_table_row(&self.table, self.table_cursor.payload()?, rowid)?
                }
            };
            match &self.residual {
                None => return Ok(Some(row)),
                Some(intent) => {
                    if matches_row(intent, &row, &self.schema, &self.params, self.strict)? {
                        return Ok(Some(row));
                    }
                }
            }
        }
    }
}

impl Iterator for PlannedScan {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
