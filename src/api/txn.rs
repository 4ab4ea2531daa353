//! Write transactions
//!
//! A [`WriteTxn`] holds the database's exclusive writer lock and layers a
//! shadow page map over the page source. DDL and INSERT batches mutate
//! the shadow; commit flushes every dirty page through the source, bumps
//! the header's change counter, and republishes the catalog. Rollback
//! just drops the shadow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, MutexGuard, RwLock};

use log::debug;

use crate::api::database::DbInner;
use crate::error::{Error, Result};
use crate::parser::tokenizer::{tokenize, Token};
use crate::schema::{ddl, Catalog, Index, Table, ViewDef, SCHEMA_ROOT};
use crate::storage::btree::types::PageType;
use crate::storage::btree::write::{index_insert, init_tree, table_insert, PageStore};
use crate::storage::btree::BtCursor;
use crate::storage::header::{DbHeader, HEADER_SIZE};
use crate::storage::record::encode_record;
use crate::storage::source::{Page, PageSource};
use crate::types::{Pgno, RowId, Value};

// ============================================================================
// Shadow Source
// ============================================================================

/// Uncommitted page images layered over the base source. Readers opened
/// against the shadow observe the transaction's own writes; the data
/// version is frozen for the life of the transaction.
pub(crate) struct ShadowSource {
    base: Arc<dyn PageSource>,
    dirty: RwLock<HashMap<Pgno, Arc<[u8]>>>,
    page_count: AtomicU32,
    base_version: u64,
}

impl ShadowSource {
    fn new(base: Arc<dyn PageSource>) -> ShadowSource {
        ShadowSource {
            page_count: AtomicU32::new(base.page_count()),
            base_version: base.data_version(),
            dirty: RwLock::new(HashMap::new()),
            base,
        }
    }

    fn dirty_pages(&self) -> Vec<(Pgno, Arc<[u8]>)> {
        let dirty = self.dirty.read().expect("shadow lock poisoned");
        let mut pages: Vec<(Pgno, Arc<[u8]>)> =
            dirty.iter().map(|(p, d)| (*p, Arc::clone(d))).collect();
        pages.sort_by_key(|(p, _)| *p);
        pages
    }

    fn put(&self, pgno: Pgno, image: Vec<u8>) {
        self.dirty
            .write()
            .expect("shadow lock poisoned")
            .insert(pgno, Arc::from(image));
    }
}

impl PageSource for ShadowSource {
    fn page_count(&self) -> Pgno {
        self.page_count.load(AtomicOrdering::Acquire)
    }

    fn page_size(&self) -> u32 {
        self.base.page_size()
    }

    fn page(&self, pgno: Pgno) -> Result<Page> {
        if pgno == 0 || pgno > self.page_count() {
            return Err(Error::InvalidPage(pgno));
        }
        {
            let dirty = self.dirty.read().expect("shadow lock poisoned");
            if let Some(image) = dirty.get(&pgno) {
                return Ok(Page::from_arc(Arc::clone(image)));
            }
        }
        self.base.page(pgno)
    }

    fn invalidate(&self, _pgno: Pgno) {}

    fn data_version(&self) -> u64 {
        self.base_version
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

/// Writer-side page access over the shadow.
struct ShadowStore<'a> {
    shadow: &'a ShadowSource,
    usable: u32,
}

impl PageStore for ShadowStore<'_> {
    fn read_image(&self, pgno: Pgno) -> Result<Vec<u8>> {
        Ok(self.shadow.page(pgno)?.bytes().to_vec())
    }

    fn write_image(&mut self, pgno: Pgno, mut image: Vec<u8>) -> Result<()> {
        // Page 1 carries the file header ahead of its B-tree content;
        // node re-encoding must not clobber it.
        if pgno == 1 {
            let current = self.shadow.page(1)?;
            image[..HEADER_SIZE].copy_from_slice(&current.bytes()[..HEADER_SIZE]);
        }
        self.shadow.put(pgno, image);
        Ok(())
    }

    fn allocate(&mut self) -> Pgno {
        self.shadow.page_count.fetch_add(1, AtomicOrdering::AcqRel) + 1
    }

    fn page_size(&self) -> u32 {
        self.shadow.page_size()
    }

    fn usable_size(&self) -> u32 {
        self.usable
    }
}

// ============================================================================
// Write Transaction
// ============================================================================

/// An exclusive write transaction for DDL and INSERT batches.
pub struct WriteTxn<'db> {
    inner: &'db DbInner,
    _guard: MutexGuard<'db, ()>,
    shadow: Arc<ShadowSource>,
    catalog: Catalog,
    header: DbHeader,
    schema_changed: bool,
    finished: bool,
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn begin(inner: &'db DbInner, guard: MutexGuard<'db, ()>) -> Result<WriteTxn<'db>> {
        if inner.src.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let header_page = inner.src.page(1)?;
        let header = DbHeader::parse(&header_page.bytes()[..HEADER_SIZE])?;
        let catalog = inner.catalog.read().expect("catalog lock poisoned").as_ref().clone();
        Ok(WriteTxn {
            inner,
            _guard: guard,
            shadow: Arc::new(ShadowSource::new(Arc::clone(&inner.src))),
            catalog,
            header,
            schema_changed: false,
            finished: false,
        })
    }

    fn store(&self) -> ShadowStore<'_> {
        ShadowStore {
            shadow: &self.shadow,
            usable: self.inner.usable,
        }
    }

    fn shadow_source(&self) -> Arc<dyn PageSource> {
        Arc::clone(&self.shadow) as Arc<dyn PageSource>
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::Misuse("transaction already finished"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    /// Execute a `CREATE TABLE | INDEX | VIEW` statement.
    pub fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        self.check_open()?;
        let tokens = tokenize(sql)?;
        let second = tokens.get(1).cloned();
        let third = tokens.get(2).cloned();
        let kind = match (&second, &third) {
            (Some(t), _) if t.is_kw("table") => "table",
            (Some(t), _) if t.is_kw("index") => "index",
            (Some(t), _) if t.is_kw("view") => "view",
            (Some(t), Some(u)) if t.is_kw("unique") && u.is_kw("index") => "index",
            _ => {
                return Err(Error::SqlSyntax(
                    "only CREATE TABLE/INDEX/VIEW are supported here".into(),
                ))
            }
        };
        match kind {
            "table" => self.create_table(sql),
            "index" => self.create_index(sql),
            _ => self.create_view(sql),
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        self.catalog.table(name).is_some() || self.catalog.view(name).is_some()
    }

    fn create_table(&mut self, sql: &str) -> Result<()> {
        let (name, columns) = ddl::parse_create_table(sql)?;
        if self.name_taken(&name) {
            return Err(Error::SqlSyntax(format!("table {} already exists", name)));
        }
        let mut store = self.store();
        let root = init_tree(&mut store, PageType::TableLeaf)?;
        self.append_schema_row("table", &name, &name, root, sql)?;
        self.catalog.add_table(Table {
            name,
            root_page: root,
            columns,
            sql: sql.to_string(),
        });
        self.schema_changed = true;
        Ok(())
    }

    fn create_index(&mut self, sql: &str) -> Result<()> {
        let (name, table_name, columns, is_unique) = ddl::parse_create_index(sql)?;
        if self.catalog.index(&name).is_some() {
            return Err(Error::SqlSyntax(format!("index {} already exists", name)));
        }
        let table = self
            .catalog
            .table(&table_name)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(table_name.clone()))?;
        for col in &columns {
            if table.column_index(&col.name).is_none() {
                return Err(Error::UnknownColumn(format!(
                    "{}.{}",
                    table_name, col.name
                )));
            }
        }
        let mut store = self.store();
        let root = init_tree(&mut store, PageType::IndexLeaf)?;
        let index = Index {
            name: name.clone(),
            table_name: table_name.clone(),
            root_page: root,
            columns,
            is_unique,
        };

        // Backfill entries from the table's existing rows.
        let mut cursor = BtCursor::new(self.shadow_source(), table.root_page, self.inner.usable);
        let mut pending = Vec::new();
        while cursor.move_next()? {
            let rowid = cursor.rowid()?;
            let row = crate::exec::scan::decode_table_row(&table, cursor.payload()?, rowid)?;
            pending.push((rowid, self.index_entry(&index, &table, &row, rowid)?));
        }
        drop(cursor);
        for (_, entry) in &pending {
            self.insert_index_entry(&index, entry)?;
        }

        self.append_schema_row("index", &name, &table_name, root, sql)?;
        self.catalog.add_index(index);
        self.schema_changed = true;
        Ok(())
    }

    fn create_view(&mut self, sql: &str) -> Result<()> {
        let (name, body_sql) = ddl::parse_create_view(sql)?;
        if self.name_taken(&name) {
            return Err(Error::SqlSyntax(format!("view {} already exists", name)));
        }
        // Validate the body up front so broken views fail at DDL time.
        crate::parser::parse(&body_sql)?;
        self.append_schema_row("view", &name, &name, 0, sql)?;
        self.catalog.add_view(ViewDef { name, body_sql });
        self.schema_changed = true;
        Ok(())
    }

    fn append_schema_row(
        &mut self,
        kind: &str,
        name: &str,
        tbl_name: &str,
        root: Pgno,
        sql: &str,
    ) -> Result<()> {
        let record = encode_record(&[
            Value::Text(kind.to_string()),
            Value::Text(name.to_string()),
            Value::Text(tbl_name.to_string()),
            Value::Integer(root as i64),
            Value::Text(sql.to_string()),
        ]);
        let rowid = self.next_rowid(SCHEMA_ROOT)?;
        let mut store = self.store();
        table_insert(&mut store, SCHEMA_ROOT, rowid, &record)
    }

    fn next_rowid(&self, root: Pgno) -> Result<RowId> {
        let mut cursor = BtCursor::new(self.shadow_source(), root, self.inner.usable);
        if cursor.last()? {
            Ok(cursor.rowid()? + 1)
        } else {
            Ok(1)
        }
    }

    // ------------------------------------------------------------------
    // INSERT
    // ------------------------------------------------------------------

    /// Insert a batch of rows given in declared column order. An
    /// `INTEGER PRIMARY KEY` column supplies the rowid when non-NULL.
    pub fn insert(&mut self, table_name: &str, rows: &[Vec<Value>]) -> Result<usize> {
        self.check_open()?;
        let table = self
            .catalog
            .table(table_name)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(table_name.to_string()))?;
        let indexes: Vec<Index> = self
            .catalog
            .indexes_of(&table.name)
            .into_iter()
            .cloned()
            .collect();
        let alias = table.rowid_alias();
        let mut next = self.next_rowid(table.root_page)?;

        for row in rows {
            if row.len() != table.columns.len() {
                return Err(Error::SchemaMismatch {
                    table: table.name.clone(),
                    declared: table.columns.len(),
                    found: row.len(),
                });
            }
            let rowid = match alias.map(|i| &row[i]) {
                Some(Value::Integer(explicit)) => {
                    let explicit = *explicit;
                    next = next.max(explicit + 1);
                    explicit
                }
                Some(Value::Null) | None => {
                    let assigned = next;
                    next += 1;
                    assigned
                }
                Some(other) => {
                    return Err(Error::TypeError(format!(
                        "rowid column takes an integer, got {:?}",
                        other.column_type()
                    )))
                }
            };

            // The alias column is stored as NULL; readers substitute the
            // rowid on decode.
            let stored: Vec<Value> = row
                .iter()
                .enumerate()
                .map(|(i, v)| if alias == Some(i) { Value::Null } else { v.clone() })
                .collect();
            let record = encode_record(&stored);
            let mut store = self.store();
            table_insert(&mut store, table.root_page, rowid, &record).map_err(|e| {
                match e {
                    Error::UniqueViolation(_) => {
                        Error::UniqueViolation(format!("{}.rowid", table.name))
                    }
                    other => other,
                }
            })?;

            for index in &indexes {
                let entry = self.index_entry(index, &table, row, rowid)?;
                self.insert_index_entry(index, &entry)?;
            }
        }
        debug!("inserted {} rows into {}", rows.len(), table.name);
        Ok(rows.len())
    }

    /// Key values plus trailing rowid, encoded as an index entry record.
    fn index_entry(
        &self,
        index: &Index,
        table: &Table,
        row: &[Value],
        rowid: RowId,
    ) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(index.columns.len() + 1);
        for col in &index.columns {
            let pos = table.column_index(&col.name).ok_or_else(|| {
                Error::UnknownColumn(format!("{}.{}", table.name, col.name))
            })?;
            let v = if table.rowid_alias() == Some(pos) {
                Value::Integer(rowid)
            } else {
                row[pos].clone()
            };
            values.push(v);
        }
        values.push(Value::Integer(rowid));
        Ok(values)
    }

    fn insert_index_entry(&self, index: &Index, entry: &[Value]) -> Result<()> {
        let orders = index.sort_orders();
        if index.is_unique {
            // NULL keys never collide; otherwise an existing entry with an
            // equal column prefix is a violation.
            let key = &entry[..entry.len() - 1];
            if key.iter().all(|v| !v.is_null()) {
                let mut probe =
                    BtCursor::new(self.shadow_source(), index.root_page, self.inner.usable);
                if probe.index_seek(key, &orders, true)? {
                    return Err(Error::UniqueViolation(format!(
                        "{}.{}",
                        index.table_name,
                        index
                            .columns
                            .iter()
                            .map(|c| c.name.as_str())
                            .collect::<Vec<_>>()
                            .join(",")
                    )));
                }
            }
        }
        let record = encode_record(entry);
        let mut store = ShadowStore {
            shadow: &self.shadow,
            usable: self.inner.usable,
        };
        index_insert(&mut store, index.root_page, &record, &orders)
    }

    // ------------------------------------------------------------------
    // Commit / Rollback
    // ------------------------------------------------------------------

    /// Flush the shadow, bump the header, republish the catalog.
    pub fn commit(mut self) -> Result<()> {
        self.check_open()?;
        let mut header = self.header.clone();
        header.page_count = self.shadow.page_count();
        header.change_counter = header.change_counter.wrapping_add(1);
        if self.schema_changed {
            header.schema_cookie = header.schema_cookie.wrapping_add(1);
        }
        let mut page1 = self.shadow.page(1)?.bytes().to_vec();
        page1[..HEADER_SIZE].copy_from_slice(&header.encode());
        self.shadow.put(1, page1);

        for (pgno, image) in self.shadow.dirty_pages() {
            self.inner.src.write_page(pgno, &image)?;
        }

        let catalog = Catalog::load(&self.inner.src, self.inner.usable)?;
        *self.inner.catalog.write().expect("catalog lock poisoned") = Arc::new(catalog);
        self.finished = true;
        debug!("write transaction committed at version {}", self.inner.src.data_version());
        Ok(())
    }

    /// Discard all uncommitted changes.
    pub fn rollback(mut self) {
        self.finished = true;
    }
}
