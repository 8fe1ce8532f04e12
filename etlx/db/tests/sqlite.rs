//! Integration tests for the database facade against an in-memory SQLite database.

#![cfg(feature = "sql")]

use etlx_db::prelude::*;
use std::time::Duration;

async fn open_memory() -> Database {
    DriverRegistry::with_defaults()
        .open("sqlite3::memory:")
        .await
        .unwrap()
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_execute_and_query_rows() {
    let mut db = open_memory().await;
    assert_eq!(db.driver_name(), "sqlite3");

    db.execute(r#"CREATE TABLE "sales" (id INTEGER, amount REAL, name TEXT)"#)
        .await
        .unwrap();
    let inserted = db
        .execute_rows_affected("INSERT INTO sales VALUES (1, 10.5, 'a'), (2, 20, NULL)")
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let result = db
        .query_with_columns("SELECT id, amount, name FROM sales ORDER BY id")
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["id", "amount", "name"]);
    assert_eq!(result.rows[0]["id"].as_i64(), Some(1));
    assert!(result.rows[1]["name"].is_null());

    let single = db
        .query_single_row("SELECT COUNT(*) AS total FROM sales")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(single["total"].as_i64(), Some(2));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_result_has_no_single_row() {
    let mut db = open_memory().await;
    db.execute("CREATE TABLE t (id INTEGER)").await.unwrap();

    assert!(db.query_single_row("SELECT id FROM t").await.unwrap().is_none());
    assert!(db.query_rows("SELECT id FROM t").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tables_and_schema() {
    let mut db = open_memory().await;
    db.execute("CREATE TABLE b (x TEXT NOT NULL); CREATE TABLE a (id INTEGER)")
        .await
        .unwrap();

    let tables = db.all_tables().await.unwrap();
    let names: Vec<_> = tables
        .rows
        .iter()
        .filter_map(|r| r["name"].to_text())
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let schema = db.table_schema("b").await.unwrap();
    assert_eq!(schema.rows[0]["name"].to_text().as_deref(), Some("x"));
    assert_eq!(schema.rows[0]["is_nullable"].to_text().as_deref(), Some("NO"));
}

#[tokio::test]
async fn test_query_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("extract.csv");
    let mut db = open_memory().await;

    let written = db
        .query_to_csv("SELECT 1 AS id, 'x' AS label UNION ALL SELECT 2, 'y'", &path)
        .await
        .unwrap();

    assert_eq!(written, 2);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "id,label\n1,x\n2,y\n"
    );
}

#[tokio::test]
async fn test_sql_errors_surface() {
    let mut db = open_memory().await;
    let err = db.execute("SELECT * FROM missing_table").await.unwrap_err();
    assert!(err.to_string().contains("missing_table"));
}

#[tokio::test]
async fn test_timeout_override_and_ping() {
    let mut db = DriverRegistry::with_defaults()
        .open_with_timeout("sqlite3::memory:", Some(Duration::from_secs(7)))
        .await
        .unwrap();
    assert_eq!(db.timeout(), Duration::from_secs(7));
    db.ping().await.unwrap();
}

#[tokio::test]
async fn test_unknown_and_missing_drivers() {
    let registry = DriverRegistry::with_defaults();

    let err = registry.open("oracle:scott/tiger").await.unwrap_err();
    assert!(matches!(err, DbError::UnknownDriver(ref d) if d == "oracle"));

    let err = registry.open("no-prefix").await.unwrap_err();
    assert!(matches!(err, DbError::InvalidConnection(_)));
}
