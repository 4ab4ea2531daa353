//! On-disk format properties: files we write are readable back through
//! an independent open, scans stay ordered across page splits, oversize
//! payloads round-trip through overflow chains, and snapshot/cancel
//! rules hold.

use std::collections::HashMap;

use sharc::{CancelToken, Database, Error, OpenFlags, Value};

fn int(i: i64) -> Value {
    Value::Integer(i)
}

#[test]
fn test_file_roundtrip_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("round.db");

    {
        let db = Database::open(&path, OpenFlags::CREATE).unwrap();
        let mut txn = db.begin_write().unwrap();
        txn.execute_ddl("CREATE TABLE kv (id INTEGER PRIMARY KEY, body TEXT)")
            .unwrap();
        let rows: Vec<Vec<Value>> = (1..=1200)
            .map(|i| vec![int(i), Value::Text(format!("row-{:04}", i))])
            .collect();
        txn.insert("kv", &rows).unwrap();
        txn.commit().unwrap();
    }

    let db = Database::open(&path, OpenFlags::READ_ONLY).unwrap();
    let rows = db
        .execute("SELECT id, body FROM kv ORDER BY id")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 1200);
    assert_eq!(rows[0], vec![int(1), Value::Text("row-0001".into())]);
    assert_eq!(rows[1199], vec![int(1200), Value::Text("row-1200".into())]);
}

#[test]
fn test_full_scan_produces_ascending_rowids() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, pad TEXT)")
        .unwrap();
    // Descending insert order plus enough bulk to force interior levels.
    let rows: Vec<Vec<Value>> = (1..=3000)
        .rev()
        .map(|i| vec![int(i), Value::Text("x".repeat(40))])
        .collect();
    txn.insert("t", &rows).unwrap();
    txn.commit().unwrap();

    let rows = db
        .execute("SELECT id FROM t")
        .unwrap()
        .collect_rows()
        .unwrap();
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| match r[0] {
            Value::Integer(i) => i,
            _ => panic!("non-integer id"),
        })
        .collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    assert_eq!(ids.len(), 3000);
}

#[test]
fn test_seek_hits_and_misses() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)")
        .unwrap();
    // Only even rowids are present.
    let rows: Vec<Vec<Value>> = (1..=500).map(|i| vec![int(i * 2), int(i)]).collect();
    txn.insert("t", &rows).unwrap();
    txn.commit().unwrap();

    for probe in [2i64, 250, 1000] {
        let rows = db
            .execute(&format!("SELECT v FROM t WHERE id = {}", probe))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(rows.len(), 1, "rowid {} should be present", probe);
    }
    for probe in [1i64, 251, 1001] {
        let rows = db
            .execute(&format!("SELECT v FROM t WHERE id = {}", probe))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert!(rows.is_empty(), "rowid {} should be absent", probe);
    }
}

#[test]
fn test_overflow_payload_roundtrip() {
    let db = Database::create_memory().unwrap();
    let big = "long-".repeat(5000);
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE blobs (id INTEGER PRIMARY KEY, body TEXT)")
        .unwrap();
    txn.insert(
        "blobs",
        &[
            vec![int(1), Value::Text(big.clone())],
            vec![int(2), Value::Text("small".into())],
        ],
    )
    .unwrap();
    txn.commit().unwrap();

    let rows = db
        .execute("SELECT body FROM blobs ORDER BY id")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows[0][0], Value::Text(big));
    assert_eq!(rows[1][0], Value::Text("small".into()));
}

#[test]
fn test_snapshot_goes_stale_when_writer_commits_mid_read() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, pad TEXT)").unwrap();
    // Span many leaf pages so the open iterator still has page fetches
    // ahead of it when the writer lands.
    let rows: Vec<Vec<Value>> = (1..=5000)
        .map(|i| vec![int(i), Value::Text("p".repeat(64))])
        .collect();
    txn.insert("t", &rows).unwrap();
    txn.commit().unwrap();

    let mut reader = db.execute("SELECT id FROM t").unwrap();
    assert!(reader.next().unwrap().is_ok());

    let mut txn = db.begin_write().unwrap();
    txn.insert("t", &[vec![int(5001), Value::Text("late".into())]]).unwrap();
    txn.commit().unwrap();

    // The open iterator pinned the pre-writer snapshot version and must
    // refuse to continue.
    let stale = reader.find_map(|r| r.err());
    assert!(matches!(stale, Some(Error::SnapshotStale)));
}

#[test]
fn test_cancel_token_aborts_iteration() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
    let rows: Vec<Vec<Value>> = (1..=50).map(|i| vec![int(i)]).collect();
    txn.insert("t", &rows).unwrap();
    txn.commit().unwrap();

    let token = CancelToken::new();
    token.cancel();
    let query = db.prepare("SELECT id FROM t").unwrap();
    let mut rows = query
        .execute_cancellable(&HashMap::new(), token)
        .unwrap();
    assert!(matches!(rows.next(), Some(Err(Error::Canceled))));
}

#[test]
fn test_unique_violation_and_rollback() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, email TEXT)")
        .unwrap();
    txn.execute_ddl("CREATE UNIQUE INDEX idx_email ON t (email)").unwrap();
    txn.insert("t", &[vec![int(1), Value::Text("a@x".into())]]).unwrap();
    txn.commit().unwrap();

    let mut txn = db.begin_write().unwrap();
    let err = txn
        .insert("t", &[vec![int(2), Value::Text("a@x".into())]])
        .unwrap_err();
    assert!(matches!(err, Error::UniqueViolation(_)));
    txn.rollback();

    // Nothing from the failed transaction is visible.
    let rows = db.execute("SELECT id FROM t").unwrap().collect_rows().unwrap();
    assert_eq!(rows.len(), 1);

    // Duplicate rowids violate the rowid key.
    let mut txn = db.begin_write().unwrap();
    let err = txn
        .insert("t", &[vec![int(1), Value::Text("b@x".into())]])
        .unwrap_err();
    assert!(matches!(err, Error::UniqueViolation(_)));
    txn.rollback();
}

#[test]
fn test_read_only_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");
    {
        let db = Database::open(&path, OpenFlags::CREATE).unwrap();
        let mut txn = db.begin_write().unwrap();
        txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        txn.commit().unwrap();
    }
    let db = Database::open(&path, OpenFlags::READ_ONLY).unwrap();
    assert!(matches!(db.begin_write(), Err(Error::ReadOnly)));
}

#[test]
fn test_explicit_and_assigned_rowids_interleave() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, tag TEXT)").unwrap();
    txn.insert(
        "t",
        &[
            vec![int(10), Value::Text("explicit".into())],
            vec![Value::Null, Value::Text("assigned".into())],
        ],
    )
    .unwrap();
    txn.commit().unwrap();
    let rows = db
        .execute("SELECT id, tag FROM t ORDER BY id")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows[0][0], int(10));
    assert_eq!(rows[1][0], int(11));
}

#[test]
fn test_strict_mode_raises_type_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strict.db");
    {
        let db = Database::open(&path, OpenFlags::CREATE).unwrap();
        let mut txn = db.begin_write().unwrap();
        txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)").unwrap();
        txn.insert("t", &[vec![int(1), int(5)]]).unwrap();
        txn.commit().unwrap();
    }

    // Default mode: mismatched comparison is Unknown, row rejected.
    let lax = Database::open(&path, OpenFlags::empty()).unwrap();
    let rows = lax
        .execute("SELECT id FROM t WHERE v = 'five'")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert!(rows.is_empty());

    // Strict mode: same query errors.
    let strict = Database::open(&path, OpenFlags::STRICT_TYPES).unwrap();
    let err = strict
        .execute("SELECT id FROM t WHERE v = 'five'")
        .unwrap()
        .collect_rows()
        .unwrap_err();
    assert!(matches!(err, Error::TypeError(_)));
}
