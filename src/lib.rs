//! Sharc - embedded read-mostly analytical engine over the SQLite file format
//!
//! A single-file page store read through typed B-tree cursors, an
//! intent-based predicate and plan layer with a rule-based index
//! selector, streaming execution kernels (aggregation, tiered FULL OUTER
//! hash join, bounded Top-N, set operations), a plan cache with DIRECT /
//! CACHED / JIT execution tiers, and a single-writer insert path that
//! produces files readable by any compliant reader of the format.

pub mod api;
pub mod error;
pub mod exec;
pub mod intent;
pub mod parser;
pub mod plan;
pub mod schema;
pub mod storage;
pub mod types;
pub mod util;
pub mod vector;
pub mod view;

// Re-export the main public types.
pub use api::{Database, OpenFlags, PreparedQuery, TableHandle, WriteTxn};
pub use error::{Error, Result};
pub use exec::Rows;
pub use intent::{CompiledIntent, Operand, PredicateBuilder, PredicateIntent, PredicateOp};
pub use types::{CancelToken, ColumnValue, RowId, SortOrder, Value};
