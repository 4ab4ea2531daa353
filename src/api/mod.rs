//! Public API: the database façade, prepared queries, JIT handles and
//! write transactions.

pub mod database;
pub mod txn;

pub use database::{Database, OpenFlags, PreparedQuery, TableHandle, DEFAULT_PAGE_SIZE};
pub use txn::WriteTxn;
