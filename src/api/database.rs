//! Programmatic database surface
//!
//! [`Database`] opens a single-file store (path or bytes), executes
//! queries through three tiers — DIRECT (parse, run, discard), CACHED
//! (memoized by normalized text and parameter shape), and JIT (a
//! long-lived table handle with its own predicate, projection and
//! ordering) — and hands out write transactions and view registrations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use log::debug;

use crate::api::txn::WriteTxn;
use crate::error::{Error, Result};
use crate::exec::{QueryEngine, Rows};
use crate::intent::{
    CompiledIntent, OrderTerm, PredicateIntent, SelectItem, TableRef,
};
use crate::plan::cache::{CacheKey, PlanCache};
use crate::schema::Catalog;
use crate::storage::header::{DbHeader, HEADER_SIZE};
use crate::storage::source::{FilePageSource, MemoryPageSource, PageSource};
use crate::types::{CancelToken, SortOrder, Value};
use crate::view::ViewRegistry;

bitflags! {
    /// Database open modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Reject every write path.
        const READ_ONLY = 0x01;
        /// Create the file when missing.
        const CREATE = 0x02;
        /// Comparisons over mismatched types raise `TypeError` instead
        /// of evaluating Unknown.
        const STRICT_TYPES = 0x04;
    }
}

/// Default page size for freshly created databases.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

pub(crate) struct DbInner {
    pub(crate) src: Arc<dyn PageSource>,
    pub(crate) usable: u32,
    pub(crate) catalog: RwLock<Arc<Catalog>>,
    pub(crate) views: RwLock<ViewRegistry>,
    pub(crate) plan_cache: Mutex<PlanCache<Arc<CompiledIntent>>>,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) strict: bool,
}

/// An open database.
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    // ------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------

    /// Open (or with [`OpenFlags::CREATE`], create) a database file.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Database> {
        let path = path.as_ref();
        let read_only = flags.contains(OpenFlags::READ_ONLY);
        let src: Arc<dyn PageSource> = if !path.exists() && flags.contains(OpenFlags::CREATE) {
            if read_only {
                return Err(Error::Misuse("cannot create a read-only database"));
            }
            Arc::new(FilePageSource::create(path, DEFAULT_PAGE_SIZE)?)
        } else {
            Arc::new(FilePageSource::open(path, read_only)?)
        };
        Database::from_source(src, flags)
    }

    /// Open a read-only database over an in-memory image.
    pub fn open_bytes(bytes: Vec<u8>, flags: OpenFlags) -> Result<Database> {
        let src: Arc<dyn PageSource> = if flags.contains(OpenFlags::READ_ONLY) {
            Arc::new(MemoryPageSource::open(bytes)?)
        } else {
            Arc::new(MemoryPageSource::open_writable(bytes)?)
        };
        Database::from_source(src, flags)
    }

    /// Create a fresh writable in-memory database.
    pub fn create_memory() -> Result<Database> {
        let src: Arc<dyn PageSource> = Arc::new(MemoryPageSource::create(DEFAULT_PAGE_SIZE));
        Database::from_source(src, OpenFlags::empty())
    }

    fn from_source(src: Arc<dyn PageSource>, flags: OpenFlags) -> Result<Database> {
        let page1 = src.page(1)?;
        let header = DbHeader::parse(&page1.bytes()[..HEADER_SIZE])?;
        let usable = header.usable_size();
        let catalog = Catalog::load(&src, usable)?;
        debug!(
            "opened database: {} pages of {} bytes, {} tables",
            src.page_count(),
            src.page_size(),
            catalog.table_names().len()
        );
        Ok(Database {
            inner: Arc::new(DbInner {
                src,
                usable,
                catalog: RwLock::new(Arc::new(catalog)),
                views: RwLock::new(ViewRegistry::new()),
                plan_cache: Mutex::new(PlanCache::new()),
                write_lock: Mutex::new(()),
                strict: flags.contains(OpenFlags::STRICT_TYPES),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// DIRECT tier: parse, execute, discard.
    pub fn execute(&self, sql: &str) -> Result<Rows> {
        self.execute_with(sql, &HashMap::new())
    }

    /// DIRECT tier with bound parameters.
    pub fn execute_with(&self, sql: &str, params: &HashMap<String, Value>) -> Result<Rows> {
        let intent = crate::parser::parse(sql)?;
        self.run_intent(&intent, params, None)
    }

    /// CACHED tier: memoize the compiled intent by normalized text and
    /// parameter shape, re-execute with the bound values.
    pub fn execute_cached(&self, sql: &str, params: &HashMap<String, Value>) -> Result<Rows> {
        let key = CacheKey::new(sql, params);
        let intent = {
            let cache = self.inner.plan_cache.lock().expect("plan cache lock poisoned");
            cache.get(&key).cloned()
        };
        let intent = match intent {
            Some(hit) => hit,
            None => {
                let compiled = Arc::new(crate::parser::parse(sql)?);
                self.inner
                    .plan_cache
                    .lock()
                    .expect("plan cache lock poisoned")
                    .insert(key, Arc::clone(&compiled));
                compiled
            }
        };
        self.run_intent(&intent, params, None)
    }

    /// Execute an already-compiled intent (the parser-collaborator seam).
    pub fn execute_intent(
        &self,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
        cancel: Option<CancelToken>,
    ) -> Result<Rows> {
        self.run_intent(intent, params, cancel)
    }

    /// Prepare a query for repeated execution.
    pub fn prepare(&self, sql: &str) -> Result<PreparedQuery> {
        Ok(PreparedQuery {
            inner: Arc::clone(&self.inner),
            intent: crate::parser::parse(sql)?,
        })
    }

    /// JIT tier: a long-lived handle bound to one table.
    pub fn jit(&self, table: &str) -> Result<TableHandle> {
        let catalog = self.inner.catalog.read().expect("catalog lock poisoned");
        if catalog.table(table).is_none() && catalog.view(table).is_none() {
            return Err(Error::UnknownTable(table.to_string()));
        }
        Ok(TableHandle {
            inner: Arc::clone(&self.inner),
            table: table.to_string(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
        })
    }

    /// A reader over one table with an optional column projection.
    pub fn reader(&self, table: &str, projection: Option<&[&str]>) -> Result<Rows> {
        let mut intent = CompiledIntent::scan(table);
        if let Some(cols) = projection {
            intent.projection = cols
                .iter()
                .map(|c| SelectItem::Column {
                    name: c.to_string(),
                    alias: None,
                })
                .collect();
        }
        self.run_intent(&intent, &HashMap::new(), None)
    }

    /// Render the access plan for a query.
    pub fn explain(&self, sql: &str, params: &HashMap<String, Value>) -> Result<String> {
        let intent = crate::parser::parse(sql)?;
        self.with_engine(|engine| engine.describe(&intent, params))
    }

    pub(crate) fn run_intent(
        &self,
        intent: &CompiledIntent,
        params: &HashMap<String, Value>,
        cancel: Option<CancelToken>,
    ) -> Result<Rows> {
        self.with_engine(|engine| engine.execute(intent, params, cancel))
    }

    fn with_engine<T>(&self, f: impl FnOnce(&QueryEngine<'_>) -> Result<T>) -> Result<T> {
        run_engine(&self.inner, f)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Register a named query as a view.
    pub fn register_view(&self, name: &str, sql: &str) -> Result<()> {
        let intent = crate::parser::parse(sql)?;
        self.inner
            .views
            .write()
            .expect("view registry lock poisoned")
            .register(name, intent);
        Ok(())
    }

    pub fn unregister_view(&self, name: &str) -> bool {
        self.inner
            .views
            .write()
            .expect("view registry lock poisoned")
            .unregister(name)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Begin an exclusive write transaction.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let guard = self.inner.write_lock.lock().expect("write lock poisoned");
        WriteTxn::begin(&self.inner, guard)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn table_names(&self) -> Vec<String> {
        self.inner
            .catalog
            .read()
            .expect("catalog lock poisoned")
            .table_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn data_version(&self) -> u64 {
        self.inner.src.data_version()
    }

    pub fn page_count(&self) -> u32 {
        self.inner.src.page_count()
    }
}

pub(crate) fn run_engine<T>(
    inner: &DbInner,
    f: impl FnOnce(&QueryEngine<'_>) -> Result<T>,
) -> Result<T> {
    let catalog = Arc::clone(&inner.catalog.read().expect("catalog lock poisoned"));
    let views = inner.views.read().expect("view registry lock poisoned");
    let engine = QueryEngine {
        src: Arc::clone(&inner.src),
        usable: inner.usable,
        strict: inner.strict,
        catalog: &catalog,
        views: &views,
    };
    f(&engine)
}

// ============================================================================
// Prepared Queries
// ============================================================================

/// A compiled query held for repeated execution.
pub struct PreparedQuery {
    inner: Arc<DbInner>,
    intent: CompiledIntent,
}

impl PreparedQuery {
    pub fn execute(&self, params: &HashMap<String, Value>) -> Result<Rows> {
        run_engine(&self.inner, |engine| engine.execute(&self.intent, params, None))
    }

    pub fn execute_cancellable(
        &self,
        params: &HashMap<String, Value>,
        cancel: CancelToken,
    ) -> Result<Rows> {
        run_engine(&self.inner, |engine| {
            engine.execute(&self.intent, params, Some(cancel))
        })
    }

    /// Render the chosen access plan.
    pub fn explain(&self, params: &HashMap<String, Value>) -> Result<String> {
        run_engine(&self.inner, |engine| engine.describe(&self.intent, params))
    }
}

// ============================================================================
// JIT Table Handles
// ============================================================================

/// A long-lived handle bound to a table, carrying its own residual
/// predicate, projection and ordering. Each [`TableHandle::query`]
/// re-executes against the current snapshot without re-parsing.
#[derive(Clone)]
pub struct TableHandle {
    inner: Arc<DbInner>,
    table: String,
    filter: Option<PredicateIntent>,
    order_by: Vec<OrderTerm>,
    limit: Option<u64>,
}

impl TableHandle {
    /// AND a predicate expression onto the handle.
    pub fn filter(mut self, expr: &str) -> Result<TableHandle> {
        let parsed = crate::parser::parse_expression(expr)?;
        self.filter = Some(match self.filter.take() {
            None => parsed,
            Some(mut existing) => {
                existing.and_with(&parsed);
                existing
            }
        });
        Ok(self)
    }

    /// Append an ordering term.
    pub fn order_by(mut self, column: &str, order: SortOrder) -> TableHandle {
        self.order_by.push(OrderTerm {
            column: column.to_string(),
            order,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> TableHandle {
        self.limit = Some(limit);
        self
    }

    /// Execute against the current snapshot. An empty column list means
    /// all columns.
    pub fn query(&self, columns: &[&str]) -> Result<Rows> {
        let projection = if columns.is_empty() {
            vec![SelectItem::AllColumns]
        } else {
            columns
                .iter()
                .map(|c| SelectItem::Column {
                    name: c.to_string(),
                    alias: None,
                })
                .collect()
        };
        let intent = CompiledIntent {
            projection,
            from: TableRef::named(&self.table),
            joins: Vec::new(),
            filter: self.filter.clone(),
            group_by: Vec::new(),
            having: None,
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: None,
            compound: Vec::new(),
        };
        run_engine(&self.inner, |engine| {
            engine.execute(&intent, &HashMap::new(), None)
        })
    }
}
