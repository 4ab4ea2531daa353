//! Query orchestration
//!
//! Ties a compiled intent to storage: resolves table and view names
//! against the catalog, asks the selector for an access plan per table,
//! opens cursors through the page source, and feeds decoded rows through
//! the join, aggregation, ordering and set-operation kernels. Results are
//! handed to the caller as a lazy row sequence.

pub mod aggregate;
pub mod filter;
pub mod join;
pub mod scan;
pub mod setops;
pub mod topn;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::intent::{
    AggregateFunc, CompiledIntent, JoinKind, SelectItem, TableRef,
};
use crate::plan::{selector, sargable, Strategy, TablePlan};
use crate::schema::{Catalog, Index, Table};
use crate::storage::source::PageSource;
use crate::types::{CancelToken, Value};
use crate::view::{resolve_view, ViewRegistry};

use aggregate::{AggregateSpec, Aggregator, OutputCol};
use filter::{matches_row, RowSchema};
use join::JoinEmit;
use scan::PlannedScan;
use topn::{RowComparator, TopN};

// ============================================================================
// Rows
// ============================================================================

type RowStream = Box<dyn Iterator<Item = Result<Vec<Value>>>>;

/// A lazy result-row sequence with its output column names.
pub struct Rows {
    columns: Vec<String>,
    iter: RowStream,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl Rows {
    pub fn new(columns: Vec<String>, iter: RowStream) -> Rows {
        Rows { columns, iter }
    }

    pub fn from_vec(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Rows {
        Rows {
            columns,
            iter: Box::new(rows.into_iter().map(Ok)),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Drain into a materialized list.
    pub fn collect_rows(self) -> Result<Vec<Vec<Value>>> {
        self.iter.collect()
    }
}

impl Iterator for Rows {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// One query execution context over an open database snapshot.
pub struct QueryEngine<'a> {
    pub src: Arc<dyn PageSource>,
    pub usable: u32,
    pub strict: bool,
    pub catalog: &'a Catalog,
    pub views: &'a ViewRegistry,
}

impl QueryEngine<'_> {
    /// Execute a compiled intent.
    pub fn execute(
        &self,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
        cancel: Option<CancelToken>,
    ) -> Result<Rows> {
        self.execute_at_depth(intent, params, &cancel, 0)
    }

    /// Describe the access plan chosen for the intent's FROM table.
    pub fn describe(
        &self,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
    ) -> Result<String> {
        if resolve_view(self.views, self.catalog, &intent.from.name, 0)?.is_some() {
            return Ok(format!("VIEW {}", intent.from.name));
        }
        let table = self.lookup_table(&intent.from.name)?;
        let (plan, _) = self.plan_for(&table, &intent.from, intent, params)?;
        Ok(plan.describe(&table.name))
    }

    fn lookup_table(&self, name: &str) -> Result<Table> {
        self.catalog
            .table(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    fn execute_at_depth(
        &self,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
        cancel: &Option<CancelToken>,
        depth: usize,
    ) -> Result<Rows> {
        if intent.compound.is_empty() {
            return self.select_rows(intent, params, cancel, depth, true);
        }

        // Compound: run each side bare, fold through the set kernels,
        // then apply the trailing ORDER BY / LIMIT over the result.
        let mut head = intent.clone();
        head.order_by.clear();
        head.limit = None;
        head.offset = None;
        head.compound.clear();
        let head_rows = self.select_rows(&head, params, cancel, depth, true)?;
        let columns = head_rows.columns().to_vec();
        let width = columns.len();
        let mut acc = head_rows.collect_rows()?;
        for term in &intent.compound {
            let side = self.select_rows(&term.select, params, cancel, depth, true)?;
            if side.columns().len() != width {
                return Err(Error::SqlSyntax(format!(
                    "compound sides disagree on arity: {} vs {}",
                    width,
                    side.columns().len()
                )));
            }
            acc = setops::apply(term.op, acc, side.collect_rows()?);
        }

        let schema = RowSchema::unqualified(&columns);
        let ordered = self.order_and_slice(
            acc,
            &schema,
            &intent.order_by,
            intent.limit,
            intent.offset,
            cancel,
        )?;
        Ok(Rows::from_vec(columns, ordered))
    }

    // ------------------------------------------------------------------
    // Single SELECT
    // ------------------------------------------------------------------

    fn select_rows(
        &self,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
        cancel: &Option<CancelToken>,
        depth: usize,
        apply_tail: bool,
    ) -> Result<Rows> {
        let (mut schema, mut stream, filter_applied) =
            self.open_from(intent, params, cancel, depth)?;

        // Joins, left-deep: the accumulated stream probes each joined
        // table's materialized build side.
        for join in &intent.joins {
            let (right_schema, build_rows) =
                self.materialize_source(&join.table, params, cancel, depth)?;
            let (probe_key, build_key) =
                resolve_join_keys(&schema, &right_schema, &join.left_key, &join.right_key)?;
            let emit = match join.kind {
                JoinKind::Inner => JoinEmit::inner(),
                JoinKind::Left => JoinEmit {
                    probe_unmatched: true,
                    build_unmatched: false,
                },
                JoinKind::Right => JoinEmit {
                    probe_unmatched: false,
                    build_unmatched: true,
                },
                JoinKind::Full => JoinEmit::full_outer(),
            };
            let joined = join::execute(
                &build_rows,
                build_key,
                right_schema.width(),
                stream,
                probe_key,
                schema.width(),
                false,
                emit,
                cancel.as_ref(),
            )?;
            schema = schema.merged(&right_schema);
            stream = Box::new(joined.into_iter().map(Ok));
        }

        // Residual filter, when the scan has not already applied it.
        if !filter_applied {
            if let Some(f) = intent.filter.clone() {
                validate_columns(&f, &schema)?;
                let fs = schema.clone();
                let fp = params.clone();
                let strict = self.strict;
                stream = Box::new(stream.filter_map(move |item| match item {
                    Ok(row) => match matches_row(&f, &row, &fs, &fp, strict) {
                        Ok(true) => Some(Ok(row)),
                        Ok(false) => None,
                        Err(e) => Some(Err(e)),
                    },
                    Err(e) => Some(Err(e)),
                }));
            }
        }

        if intent.has_aggregates() || !intent.group_by.is_empty() {
            return self.aggregate_rows(intent, schema, stream, params, cancel, apply_tail);
        }

        // Projection map: source position and output name per column.
        let mut positions = Vec::new();
        let mut names = Vec::new();
        for item in &intent.projection {
            match item {
                SelectItem::AllColumns => {
                    for (i, col) in schema.columns().iter().enumerate() {
                        positions.push(i);
                        names.push(col.name.clone());
                    }
                }
                SelectItem::Column { name, alias } => {
                    positions.push(schema.resolve(name)?);
                    names.push(
                        alias
                            .clone()
                            .unwrap_or_else(|| bare_name(name).to_string()),
                    );
                }
                SelectItem::Aggregate { .. } => {
                    return Err(Error::SqlSyntax(
                        "aggregate outside an aggregate query".into(),
                    ))
                }
            }
        }

        if apply_tail && !intent.order_by.is_empty() {
            // Order over the pre-projection schema, then project.
            let rows = self.order_streamed(
                stream,
                &schema,
                &intent.order_by,
                intent.limit,
                intent.offset,
                cancel,
            )?;
            let projected = rows
                .into_iter()
                .map(|row| positions.iter().map(|&i| row[i].clone()).collect())
                .collect();
            return Ok(Rows::from_vec(names, projected));
        }

        let mut projected: RowStream = Box::new(stream.map(move |item| {
            item.map(|row| positions.iter().map(|&i| row[i].clone()).collect())
        }));
        if apply_tail {
            if let Some(offset) = intent.offset {
                projected = Box::new(skip_ok(projected, offset as usize));
            }
            if let Some(limit) = intent.limit {
                projected = Box::new(take_ok(projected, limit as usize));
            }
        }
        Ok(Rows::new(names, projected))
    }

    // ------------------------------------------------------------------
    // FROM resolution
    // ------------------------------------------------------------------

    /// Open the FROM source: a planned scan for a base table, or the
    /// materialized output of a view body.
    fn open_from(
        &self,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
        cancel: &Option<CancelToken>,
        depth: usize,
    ) -> Result<(RowSchema, RowStream, bool)> {
        let tref = &intent.from;
        if let Some(body) = resolve_view(self.views, self.catalog, &tref.name, depth)? {
            let rows = self.execute_at_depth(&body, params, cancel, depth + 1)?;
            let columns = rows.columns().to_vec();
            let schema = RowSchema::for_table(tref.label(), &columns);
            return Ok((schema, Box::new(rows), false));
        }

        let table = self.lookup_table(&tref.name)?;
        let (plan, legs) = self.plan_for(&table, tref, intent, params)?;
        let filter_here = intent.joins.is_empty();
        let residual = if filter_here { intent.filter.clone() } else { None };
        let scan = PlannedScan::open(
            Arc::clone(&self.src),
            self.usable,
            table,
            tref.label(),
            plan,
            legs,
            residual,
            params.clone(),
            self.strict,
            cancel.clone(),
        )?;
        let schema = scan.schema().clone();
        if filter_here {
            if let Some(f) = &intent.filter {
                validate_columns(f, &schema)?;
            }
        }
        Ok((schema, Box::new(scan), filter_here))
    }

    /// Choose the access plan for one table reference.
    fn plan_for(
        &self,
        table: &Table,
        tref: &TableRef,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
    ) -> Result<(TablePlan, Vec<Index>)> {
        // Pre-filtering the preserved side of a RIGHT or FULL join would
        // change which build rows surface as unmatched, so those shapes
        // scan in full and filter after the join.
        let outer_safe = intent
            .joins
            .iter()
            .all(|j| matches!(j.kind, JoinKind::Inner | JoinKind::Left));
        let plan = match (&intent.filter, outer_safe) {
            (Some(f), true) => {
                let conditions = sargable::analyze(
                    f,
                    Some(tref.label()),
                    Some(&table.column_names()),
                    params,
                )?;
                selector::select_plan(&conditions, &self.catalog.indexes_of(&table.name))
            }
            _ => TablePlan::full_scan(),
        };
        let mut legs = Vec::new();
        for leg in [&plan.primary, &plan.secondary].into_iter().flatten() {
            let index = self
                .catalog
                .index(&leg.index_name)
                .cloned()
                .ok_or_else(|| Error::UnknownTable(leg.index_name.clone()))?;
            legs.push(index);
        }
        debug_assert!(match plan.strategy {
            Strategy::FullScan => legs.is_empty(),
            Strategy::SingleIndex => legs.len() == 1,
            Strategy::RowIdIntersection => legs.len() == 2,
        });
        Ok((plan, legs))
    }

    /// Materialize a table or view for a join build side.
    fn materialize_source(
        &self,
        tref: &TableRef,
        params: &HashMap<String, Value>,
        cancel: &Option<CancelToken>,
        depth: usize,
    ) -> Result<(RowSchema, Vec<Vec<Value>>)> {
        if let Some(body) = resolve_view(self.views, self.catalog, &tref.name, depth)? {
            let rows = self.execute_at_depth(&body, params, cancel, depth + 1)?;
            let columns = rows.columns().to_vec();
            let schema = RowSchema::for_table(tref.label(), &columns);
            return Ok((schema, rows.collect_rows()?));
        }
        let table = self.lookup_table(&tref.name)?;
        let scan = PlannedScan::open(
            Arc::clone(&self.src),
            self.usable,
            table,
            tref.label(),
            TablePlan::full_scan(),
            Vec::new(),
            None,
            params.clone(),
            self.strict,
            cancel.clone(),
        )?;
        let schema = scan.schema().clone();
        let rows: Result<Vec<_>> = scan.collect();
        Ok((schema, rows?))
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    fn aggregate_rows(
        &self,
        intent: &CompiledIntent,
        schema: RowSchema,
        stream: RowStream,
        params: &HashMap<String, Value>,
        cancel: &Option<CancelToken>,
        apply_tail: bool,
    ) -> Result<Rows> {
        let group_by: Vec<usize> = intent
            .group_by
            .iter()
            .map(|name| schema.resolve(name))
            .collect::<Result<_>>()?;

        let mut aggregates = Vec::new();
        let mut outputs = Vec::new();
        let mut names = Vec::new();
        for item in &intent.projection {
            match item {
                SelectItem::Aggregate { func, arg, alias } => {
                    let arg_idx = match (func, arg) {
                        (AggregateFunc::CountStar, _) => None,
                        (_, Some(col)) => Some(schema.resolve(col)?),
                        (_, None) => {
                            return Err(Error::SqlSyntax(
                                "aggregate missing its argument".into(),
                            ))
                        }
                    };
                    outputs.push(OutputCol::Agg(aggregates.len()));
                    names.push(alias.clone().unwrap_or_else(|| aggregate_name(*func, arg)));
                    aggregates.push(AggregateSpec {
                        func: *func,
                        arg: arg_idx,
                    });
                }
                SelectItem::Column { name, alias } => {
                    let idx = schema.resolve(name)?;
                    if !group_by.contains(&idx) {
                        return Err(Error::SqlSyntax(format!(
                            "column {} must appear in GROUP BY",
                            name
                        )));
                    }
                    outputs.push(OutputCol::Group(idx));
                    names.push(
                        alias
                            .clone()
                            .unwrap_or_else(|| bare_name(name).to_string()),
                    );
                }
                SelectItem::AllColumns => {
                    return Err(Error::SqlSyntax(
                        "* cannot be mixed with aggregates".into(),
                    ))
                }
            }
        }

        let mut agg = Aggregator::new(group_by, aggregates, outputs, names);
        for row in stream {
            check_cancel(cancel)?;
            agg.accumulate(&row?)?;
        }
        let (mut rows, columns) = agg.finalize();

        let out_schema = RowSchema::unqualified(&columns);
        if let Some(having) = &intent.having {
            validate_columns(having, &out_schema)?;
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if matches_row(having, &row, &out_schema, params, self.strict)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        if apply_tail {
            rows = self.order_and_slice(
                rows,
                &out_schema,
                &intent.order_by,
                intent.limit,
                intent.offset,
                cancel,
            )?;
        }
        Ok(Rows::from_vec(columns, rows))
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    fn comparator(
        &self,
        schema: &RowSchema,
        order_by: &[crate::intent::OrderTerm],
    ) -> Result<RowComparator> {
        let mut terms = Vec::with_capacity(order_by.len());
        for term in order_by {
            terms.push((schema.resolve(&term.column)?, term.order));
        }
        Ok(RowComparator::new(terms))
    }

    /// Order a stream, retaining only what LIMIT/OFFSET can observe.
    fn order_streamed(
        &self,
        stream: RowStream,
        schema: &RowSchema,
        order_by: &[crate::intent::OrderTerm],
        limit: Option<u64>,
        offset: Option<u64>,
        cancel: &Option<CancelToken>,
    ) -> Result<Vec<Vec<Value>>> {
        let cmp = self.comparator(schema, order_by)?;
        let offset = offset.unwrap_or(0) as usize;
        match limit {
            Some(limit) => {
                let mut top = TopN::new(limit as usize + offset, cmp);
                for row in stream {
                    check_cancel(cancel)?;
                    top.try_insert(row?);
                }
                let mut rows = top.extract_sorted();
                drop_prefix(&mut rows, offset);
                Ok(rows)
            }
            None => {
                let mut rows: Vec<Vec<Value>> = Vec::new();
                for row in stream {
                    check_cancel(cancel)?;
                    rows.push(row?);
                }
                rows.sort_by(|a, b| cmp.compare(a, b));
                drop_prefix(&mut rows, offset);
                Ok(rows)
            }
        }
    }

    /// Order and slice an already-materialized row list.
    fn order_and_slice(
        &self,
        mut rows: Vec<Vec<Value>>,
        schema: &RowSchema,
        order_by: &[crate::intent::OrderTerm],
        limit: Option<u64>,
        offset: Option<u64>,
        cancel: &Option<CancelToken>,
    ) -> Result<Vec<Vec<Value>>> {
        check_cancel(cancel)?;
        if !order_by.is_empty() {
            let cmp = self.comparator(schema, order_by)?;
            rows.sort_by(|a, b| cmp.compare(a, b));
        }
        drop_prefix(&mut rows, offset.unwrap_or(0) as usize);
        if let Some(limit) = limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn check_cancel(cancel: &Option<CancelToken>) -> Result<()> {
    if let Some(tok) = cancel {
        if tok.is_canceled() {
            return Err(Error::Canceled);
        }
    }
    Ok(())
}

fn drop_prefix(rows: &mut Vec<Vec<Value>>, offset: usize) {
    if offset > 0 {
        rows.drain(..offset.min(rows.len()));
    }
}

fn bare_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Resolve every column a predicate references, so name errors surface
/// at compile time rather than mid-iteration.
fn validate_columns(intent: &crate::intent::PredicateIntent, schema: &RowSchema) -> Result<()> {
    for node in &intent.nodes {
        if let Some(col) = node.column.as_deref() {
            schema.resolve(col)?;
        }
    }
    Ok(())
}

/// Canonical output name of an aggregate, e.g. `COUNT(*)` or `AVG(score)`.
fn aggregate_name(func: AggregateFunc, arg: &Option<String>) -> String {
    match (func, arg) {
        (AggregateFunc::CountStar, _) => "COUNT(*)".to_string(),
        (f, Some(col)) => format!("{}({})", f.name(), col),
        (f, None) => format!("{}()", f.name()),
    }
}

/// Resolve the ON equality against both sides, swapping if needed.
fn resolve_join_keys(
    probe: &RowSchema,
    build: &RowSchema,
    left_key: &str,
    right_key: &str,
) -> Result<(usize, usize)> {
    match (probe.resolve(left_key), build.resolve(right_key)) {
        (Ok(p), Ok(b)) => Ok((p, b)),
        _ => {
            let p = probe.resolve(right_key)?;
            let b = build.resolve(left_key)?;
            Ok((p, b))
        }
    }
}

/// Skip adaptor that forwards errors.
fn skip_ok(
    iter: RowStream,
    mut n: usize,
) -> impl Iterator<Item = Result<Vec<Value>>> {
    iter.filter(move |item| match item {
        Ok(_) if n > 0 => {
            n -= 1;
            false
        }
        _ => true,
    })
}

/// Take adaptor that forwards errors and stops after `n` rows.
fn take_ok(
    iter: RowStream,
    mut n: usize,
) -> impl Iterator<Item = Result<Vec<Value>>> {
    iter.take_while(move |item| match item {
        Ok(_) => {
            if n == 0 {
                return false;
            }
            n -= 1;
            true
        }
        Err(_) => true,
    })
}
