//! Schema catalog
//!
//! Tables, columns, indexes and views discovered from the schema B-tree
//! rooted at page 1. A catalog is immutable for the lifetime of a database
//! snapshot; writers publish a new one atomically on commit.

pub mod ddl;

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::debug;

use crate::error::{Error, Result};
use crate::storage::btree::BtCursor;
use crate::storage::record::decode_record;
use crate::storage::source::PageSource;
use crate::types::{ColumnValue, Pgno};

/// Root page of the schema B-tree.
pub const SCHEMA_ROOT: Pgno = 1;

/// Name of the built-in schema table.
pub const SCHEMA_TABLE_NAME: &str = "sqlite_schema";

// ============================================================================
// Schema Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub declared_type: String,
    pub ordinal: usize,
    pub is_primary_key: bool,
    pub is_not_null: bool,
    /// `INTEGER PRIMARY KEY`: the column is the rowid and its values are
    /// not physically stored in the payload.
    pub is_rowid_alias: bool,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub root_page: Pgno,
    pub columns: Vec<Column>,
    /// Original CREATE statement, as stored in the schema row.
    pub sql: String,
}

impl Table {
    /// Ordinal of `name`, case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Ordinal of the rowid-alias column, if the table has one.
    pub fn rowid_alias(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_rowid_alias)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: String,
    pub ordinal: usize,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub table_name: String,
    pub root_page: Pgno,
    pub columns: Vec<IndexColumn>,
    pub is_unique: bool,
}

impl Index {
    /// Per-column sort orders, for entry comparison.
    pub fn sort_orders(&self) -> Vec<crate::types::SortOrder> {
        self.columns
            .iter()
            .map(|c| {
                if c.descending {
                    crate::types::SortOrder::Desc
                } else {
                    crate::types::SortOrder::Asc
                }
            })
            .collect()
    }
}

/// A view recorded with its body as unresolved SQL text.
#[derive(Debug, Clone)]
pub struct ViewDef {
    pub name: String,
    pub body_sql: String,
}

lazy_static! {
    /// The built-in schema table itself.
    static ref SCHEMA_TABLE: Table = Table {
        name: SCHEMA_TABLE_NAME.to_string(),
        root_page: SCHEMA_ROOT,
        columns: ["type", "name", "tbl_name", "rootpage", "sql"]
            .iter()
            .enumerate()
            .map(|(i, n)| Column {
                name: n.to_string(),
                declared_type: if *n == "rootpage" { "INTEGER" } else { "TEXT" }.to_string(),
                ordinal: i,
                is_primary_key: false,
                is_not_null: false,
                is_rowid_alias: false,
            })
            .collect(),
        sql: String::new(),
    };
}

// ============================================================================
// Catalog
// ============================================================================

/// All schema objects of one database snapshot. Lookup is
/// case-insensitive; iteration orders are deterministic.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    tables: HashMap<String, Table>,
    indexes: HashMap<String, Index>,
    /// Lowercased table name -> index names, sorted.
    table_indexes: HashMap<String, Vec<String>>,
    views: HashMap<String, ViewDef>,
}

impl Catalog {
    /// Build a catalog by scanning the schema B-tree.
    pub fn load(src: &Arc<dyn PageSource>, usable: u32) -> Result<Catalog> {
        let mut catalog = Catalog::default();
        let mut cursor = BtCursor::new(Arc::clone(src), SCHEMA_ROOT, usable);
        while cursor.move_next()? {
            let values = decode_record(cursor.payload()?)?;
            if values.len() < 5 {
                return Err(Error::SchemaMismatch {
                    table: SCHEMA_TABLE_NAME.to_string(),
                    declared: 5,
                    found: values.len(),
                });
            }
            let kind = text_of(&values[0]);
            let root_page = match values[3] {
                ColumnValue::Integer(n) => n as Pgno,
                _ => 0,
            };
            let sql = match &values[4] {
                ColumnValue::Null => continue, // auto-indexes carry no SQL
                other => text_of(other),
            };
            match kind.as_str() {
                "table" => {
                    let (name, columns) = ddl::parse_create_table(&sql)?;
                    catalog.add_table(Table {
                        name,
                        root_page,
                        columns,
                        sql,
                    });
                }
                "index" => {
                    let (name, table_name, columns, is_unique) = ddl::parse_create_index(&sql)?;
                    catalog.add_index(Index {
                        name,
                        table_name,
                        root_page,
                        columns,
                        is_unique,
                    });
                }
                "view" => {
                    let (name, body_sql) = ddl::parse_create_view(&sql)?;
                    catalog.add_view(ViewDef { name, body_sql });
                }
                other => debug!("skipping schema row of kind {:?}", other),
            }
        }
        debug!(
            "catalog loaded: {} tables, {} indexes, {} views",
            catalog.tables.len(),
            catalog.indexes.len(),
            catalog.views.len()
        );
        Ok(catalog)
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.to_ascii_lowercase(), table);
    }

    pub fn add_index(&mut self, index: Index) {
        let key = index.table_name.to_ascii_lowercase();
        let names = self.table_indexes.entry(key).or_default();
        names.push(index.name.clone());
        names.sort();
        self.indexes
            .insert(index.name.to_ascii_lowercase(), index);
    }

    pub fn add_view(&mut self, view: ViewDef) {
        self.views.insert(view.name.to_ascii_lowercase(), view);
    }

    /// Look up a table; the built-in schema table is always present.
    pub fn table(&self, name: &str) -> Option<&Table> {
        let key = name.to_ascii_lowercase();
        if key == SCHEMA_TABLE_NAME || key == "sqlite_master" {
            return Some(&SCHEMA_TABLE);
        }
        self.tables.get(&key)
    }

    pub fn view(&self, name: &str) -> Option<&ViewDef> {
        self.views.get(&name.to_ascii_lowercase())
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.get(&name.to_ascii_lowercase())
    }

    /// Indexes on `table`, ordered by name for deterministic planning.
    pub fn indexes_of(&self, table: &str) -> Vec<&Index> {
        self.table_indexes
            .get(&table.to_ascii_lowercase())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| self.indexes.get(&n.to_ascii_lowercase()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Table names, sorted.
    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.values().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

fn text_of(v: &ColumnValue<'_>) -> String {
    match v {
        ColumnValue::Text(b) => String::from_utf8_lossy(b).into_owned(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schema_table_lookup() {
        let catalog = Catalog::default();
        let t = catalog.table("sqlite_schema").unwrap();
        assert_eq!(t.root_page, SCHEMA_ROOT);
        assert_eq!(t.columns.len(), 5);
        assert!(catalog.table("SQLITE_MASTER").is_some());
    }

    #[test]
    fn test_indexes_sorted_by_name() {
        let mut catalog = Catalog::default();
        for name in ["zeta", "alpha", "mid"] {
            catalog.add_index(Index {
                name: name.to_string(),
                table_name: "t".to_string(),
                root_page: 5,
                columns: vec![],
                is_unique: false,
            });
        }
        let names: Vec<&str> = catalog.indexes_of("t").iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut catalog = Catalog::default();
        catalog.add_table(Table {
            name: "Users".to_string(),
            root_page: 2,
            columns: vec![],
            sql: String::new(),
        });
        assert!(catalog.table("USERS").is_some());
        assert!(catalog.table("users").is_some());
    }
}
