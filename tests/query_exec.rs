//! End-to-end query execution over freshly written databases.

use std::collections::HashMap;
use std::sync::Once;

use sharc::{Database, Error, SortOrder, Value};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn int(i: i64) -> Value {
    Value::Integer(i)
}

fn seed_users(db: &Database) {
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
        .unwrap();
    txn.insert(
        "users",
        &[
            vec![int(1), text("Alice"), int(30)],
            vec![int(2), text("Bob"), int(40)],
            vec![int(3), text("Charlie"), int(25)],
        ],
    )
    .unwrap();
    txn.commit().unwrap();
}

fn seed_orders(db: &Database) {
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER, amount REAL)")
        .unwrap();
    txn.insert(
        "orders",
        &[
            vec![int(10), int(1), Value::Real(100.5)],
            vec![int(11), int(1), Value::Real(200.0)],
            vec![int(12), int(2), Value::Real(300.0)],
        ],
    )
    .unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_filter_and_order() {
    init();
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let rows = db
        .execute("SELECT name, age FROM users WHERE age > 28 ORDER BY age ASC")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(
        rows,
        vec![vec![text("Alice"), int(30)], vec![text("Bob"), int(40)]]
    );
}

#[test]
fn test_left_join_null_fill() {
    init();
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    seed_orders(&db);
    let rows = db
        .execute(
            "SELECT u.name, o.amount FROM users u LEFT JOIN orders o ON u.id = o.user_id \
             ORDER BY u.id, o.id",
        )
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![text("Alice"), Value::Real(100.5)],
            vec![text("Alice"), Value::Real(200.0)],
            vec![text("Bob"), Value::Real(300.0)],
            vec![text("Charlie"), Value::Null],
        ]
    );
}

#[test]
fn test_inner_join_drops_unmatched() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    seed_orders(&db);
    let rows = db
        .execute("SELECT u.name FROM users u JOIN orders o ON u.id = o.user_id ORDER BY o.id")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert!(!rows.iter().any(|r| r[0] == text("Charlie")));
}

#[test]
fn test_group_by_aggregates() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE staff (id INTEGER PRIMARY KEY, dept TEXT, score INTEGER)")
        .unwrap();
    txn.insert(
        "staff",
        &[
            vec![Value::Null, text("eng"), int(100)],
            vec![Value::Null, text("eng"), int(200)],
            vec![Value::Null, text("sales"), int(300)],
            vec![Value::Null, text("sales"), int(400)],
        ],
    )
    .unwrap();
    txn.commit().unwrap();

    let rows = db
        .execute("SELECT dept, COUNT(*), AVG(score) FROM staff GROUP BY dept ORDER BY dept")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![text("eng"), int(2), Value::Real(150.0)],
            vec![text("sales"), int(2), Value::Real(350.0)],
        ]
    );
}

#[test]
fn test_having_filters_groups() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE t (id INTEGER PRIMARY KEY, k TEXT)").unwrap();
    txn.insert(
        "t",
        &[
            vec![Value::Null, text("a")],
            vec![Value::Null, text("a")],
            vec![Value::Null, text("b")],
        ],
    )
    .unwrap();
    txn.commit().unwrap();

    let rows = db
        .execute("SELECT k, COUNT(*) FROM t GROUP BY k HAVING COUNT(*) > 1")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows, vec![vec![text("a"), int(2)]]);
}

#[test]
fn test_union_dedups_across_ranges() {
    let db = Database::create_memory().unwrap();
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE TABLE users_a (id INTEGER PRIMARY KEY)").unwrap();
    txn.execute_ddl("CREATE TABLE users_b (id INTEGER PRIMARY KEY)").unwrap();
    let a: Vec<Vec<Value>> = (1..=2500).map(|i| vec![int(i)]).collect();
    let b: Vec<Vec<Value>> = (2001..=4500).map(|i| vec![int(i)]).collect();
    txn.insert("users_a", &a).unwrap();
    txn.insert("users_b", &b).unwrap();
    txn.commit().unwrap();

    let rows = db
        .execute("SELECT id FROM users_a UNION SELECT id FROM users_b")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 4500);

    let rows = db
        .execute("SELECT id FROM users_a INTERSECT SELECT id FROM users_b")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 500);

    let rows = db
        .execute("SELECT id FROM users_a EXCEPT SELECT id FROM users_b")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 2000);
}

#[test]
fn test_limit_offset() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let rows = db
        .execute("SELECT name FROM users ORDER BY age DESC LIMIT 2 OFFSET 1")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows, vec![vec![text("Alice")], vec![text("Charlie")]]);
}

#[test]
fn test_parameters_and_cached_tier() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let mut params = HashMap::new();
    params.insert("min".to_string(), int(28));
    let sql = "SELECT name FROM users WHERE age >= :min ORDER BY name";
    let first = db.execute_cached(sql, &params).unwrap().collect_rows().unwrap();
    assert_eq!(first.len(), 2);

    // Same shape, different value: cache hit must re-bind.
    params.insert("min".to_string(), int(39));
    let second = db
        .execute_cached("SELECT  name FROM users WHERE age >= :min ORDER BY name", &params)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(second, vec![vec![text("Bob")]]);

    // Unbound parameter surfaces as its own error kind.
    let err = db.execute(sql).unwrap_err();
    assert!(matches!(err, Error::ParameterNotBound(_)));
}

#[test]
fn test_prepared_query_reuse() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let query = db
        .prepare("SELECT name FROM users WHERE age > :cutoff ORDER BY age")
        .unwrap();
    let mut params = HashMap::new();
    params.insert("cutoff".to_string(), int(24));
    assert_eq!(query.execute(&params).unwrap().collect_rows().unwrap().len(), 3);
    params.insert("cutoff".to_string(), int(35));
    assert_eq!(query.execute(&params).unwrap().collect_rows().unwrap().len(), 1);
}

#[test]
fn test_jit_handle_reexecutes_against_current_snapshot() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let handle = db
        .jit("users")
        .unwrap()
        .filter("age >= 30")
        .unwrap()
        .order_by("age", SortOrder::Desc);
    assert_eq!(handle.query(&["name"]).unwrap().collect_rows().unwrap().len(), 2);

    // New rows are visible on the next call without re-parsing.
    let mut txn = db.begin_write().unwrap();
    txn.insert("users", &[vec![int(4), text("Dora"), int(50)]]).unwrap();
    txn.commit().unwrap();
    let rows = handle.query(&["name"]).unwrap().collect_rows().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], vec![text("Dora")]);
}

#[test]
fn test_views_resolve_and_compose() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    db.register_view("adults", "SELECT name, age FROM users WHERE age >= 28")
        .unwrap();
    // The outer predicate composes with the view body.
    let rows = db
        .execute("SELECT name FROM adults WHERE age < 35 ORDER BY name")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows, vec![vec![text("Alice")]]);

    // A view over a view still resolves.
    db.register_view("adult_names", "SELECT name FROM adults").unwrap();
    assert_eq!(
        db.execute("SELECT name FROM adult_names ORDER BY name")
            .unwrap()
            .collect_rows()
            .unwrap()
            .len(),
        2
    );

    assert!(db.unregister_view("adult_names"));
    assert!(matches!(
        db.execute("SELECT name FROM adult_names"),
        Err(Error::UnknownTable(_))
    ));
}

#[test]
fn test_view_recursion_depth_limit() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    // A self-referential view exhausts the nesting budget.
    db.register_view("loopy", "SELECT * FROM loopy").unwrap();
    assert!(matches!(
        db.execute("SELECT * FROM loopy"),
        Err(Error::ViewRecursion(_))
    ));
}

#[test]
fn test_ddl_views_persist_in_schema() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let mut txn = db.begin_write().unwrap();
    txn.execute_ddl("CREATE VIEW seniors AS SELECT name FROM users WHERE age >= 40")
        .unwrap();
    txn.commit().unwrap();
    let rows = db
        .execute("SELECT name FROM seniors")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows, vec![vec![text("Bob")]]);
}

#[test]
fn test_name_errors_surface_at_compile_time() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    assert!(matches!(
        db.execute("SELECT * FROM missing"),
        Err(Error::UnknownTable(_))
    ));
    assert!(matches!(
        db.execute("SELECT nope FROM users"),
        Err(Error::UnknownColumn(_))
    ));
    seed_orders(&db);
    assert!(matches!(
        db.execute("SELECT id FROM users u JOIN orders o ON u.id = o.user_id WHERE id = 1"),
        Err(Error::AmbiguousColumn(_))
    ));
}

#[test]
fn test_reader_projection() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let rows = db.reader("users", Some(&["name"])).unwrap();
    assert_eq!(rows.columns(), &["name".to_string()]);
    assert_eq!(rows.collect_rows().unwrap().len(), 3);
}

#[test]
fn test_like_and_in_residuals() {
    let db = Database::create_memory().unwrap();
    seed_users(&db);
    let rows = db
        .execute("SELECT name FROM users WHERE name LIKE 'A%' OR id IN (3)")
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 2);
}
