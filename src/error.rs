//! Error taxonomy and Result alias for Sharc
//!
//! Every failure the engine can report is one of the kinds below. Storage
//! and decoder errors are fatal for the current query and surface as-is;
//! name-resolution errors surface at compile time, before any page fetch.

use crate::types::Pgno;

/// Typed error kinds reported by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Page number 0 or beyond the declared page count.
    #[error("invalid page number {0}")]
    InvalidPage(Pgno),

    /// Page header or body inconsistent, or a short read.
    #[error("corrupt page {pgno}: {reason}")]
    CorruptPage { pgno: Pgno, reason: &'static str },

    /// Varint truncation or serial type out of range.
    #[error("corrupt record: {0}")]
    CorruptRecord(&'static str),

    /// Page-type mismatch during descent, or a cycle in the parent stack.
    #[error("corrupt b-tree at page {pgno}: {reason}")]
    CorruptBTree { pgno: Pgno, reason: &'static str },

    /// Declared column count disagrees with a stored record.
    #[error("table {table}: schema declares {declared} columns, record holds {found}")]
    SchemaMismatch {
        table: String,
        declared: usize,
        found: usize,
    },

    #[error("no such table: {0}")]
    UnknownTable(String),

    #[error("no such column: {0}")]
    UnknownColumn(String),

    /// An unqualified column name resolves to more than one source.
    #[error("ambiguous column name: {0}")]
    AmbiguousColumn(String),

    /// The query references a parameter absent from the bound map.
    #[error("parameter not bound: :{0}")]
    ParameterNotBound(String),

    /// Operator applied to incompatible operand types (strict mode only).
    #[error("type error: {0}")]
    TypeError(String),

    /// View resolution exceeded the maximum nesting depth.
    #[error("view nesting too deep while resolving {0}")]
    ViewRecursion(String),

    /// A writer advanced the data version while a read was in flight.
    #[error("snapshot is stale: data version advanced mid-read")]
    SnapshotStale,

    /// The query's cancel token fired.
    #[error("query canceled")]
    Canceled,

    /// Write attempted against a read-only page source.
    #[error("attempt to write a read-only database")]
    ReadOnly,

    /// Duplicate key in a unique index on insert.
    #[error("UNIQUE constraint failed: {0}")]
    UniqueViolation(String),

    /// The bundled parser rejected the query text.
    #[error("syntax error: {0}")]
    SqlSyntax(String),

    /// API misuse, e.g. inserting through a finished transaction.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
