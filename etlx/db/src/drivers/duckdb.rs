//! Embedded analytic engine, file backed or in memory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::duckdb::types::Value as DuckValue;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use tracing::debug;

use crate::connection_string::{embedded_path, ensure_parent};
use crate::driver::{Connection, Driver, EXTENDED_TIMEOUT};
use crate::error::DbError;
use crate::value::{QueryResult, Row, Value};
use crate::Result;

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDriver;

#[async_trait]
impl Driver for DuckDbDriver {
    fn name(&self) -> &str {
        "duckdb"
    }

    fn default_timeout(&self) -> Duration {
        EXTENDED_TIMEOUT
    }

    async fn connect(&self, _driver: &str, dsn: &str) -> Result<Box<dyn Connection>> {
        let path = embedded_path(dsn, "duckdb");
        let conn = tokio::task::spawn_blocking(move || -> Result<::duckdb::Connection> {
            match path {
                None => Ok(::duckdb::Connection::open_in_memory()?),
                Some(path) => {
                    ensure_parent(&path)?;
                    debug!("Opening duckdb file {}", path.display());
                    Ok(::duckdb::Connection::open(path)?)
                }
            }
        })
        .await?
        .map_err(|e| DbError::Connect {
            driver: "duckdb".into(),
            message: e.to_string(),
        })?;

        Ok(Box::new(DuckDbConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

pub struct DuckDbConnection {
    conn: Arc<Mutex<::duckdb::Connection>>,
}

impl DuckDbConnection {
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&::duckdb::Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| DbError::Query("duckdb connection lock poisoned".into()))?;
            f(&guard)
        })
        .await?
    }
}

fn single_statement(sql: &str) -> bool {
    !sql.trim().trim_end_matches(';').contains(';')
}

fn to_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::SmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::Int(i) => Value::Int(i64::from(i)),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(i.to_string())),
        DuckValue::UTinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::USmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::UInt(i) => Value::Int(i64::from(i)),
        DuckValue::UBigInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(i.to_string())),
        DuckValue::Float(f) => Value::Float(f64::from(f)),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => {
            let text = d.to_string();
            text.parse().map(Value::Float).unwrap_or(Value::Text(text))
        }
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Enum(s) => Value::Text(s),
        DuckValue::Blob(b) => Value::Bytes(b),
        DuckValue::Timestamp(unit, v) => DateTime::from_timestamp_micros(unit.to_micros(v))
            .map(|ts| Value::Timestamp(ts.naive_utc()))
            .unwrap_or(Value::Null),
        DuckValue::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(i64::from(days))))
            .map(Value::Date)
            .unwrap_or(Value::Null),
        other => Value::Text(format!("{other:?}")),
    }
}

#[async_trait]
impl Connection for DuckDbConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            if single_statement(&sql) {
                Ok(conn.execute(&sql, [])? as u64)
            } else {
                conn.execute_batch(&sql)?;
                Ok(0)
            }
        })
        .await
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let columns: Vec<String> = rows
                .as_ref()
                .map(|s| s.column_names())
                .unwrap_or_default();

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Row::with_capacity(columns.len());
                for (idx, name) in columns.iter().enumerate() {
                    let value: DuckValue = row.get(idx)?;
                    record.insert(name.clone(), to_value(value));
                }
                out.push(record);
            }
            Ok(QueryResult::new(columns, out))
        })
        .await
    }

    async fn table_schema(&mut self, table: &str) -> Result<QueryResult> {
        let sql = format!(
            "SELECT column_name AS name, data_type AS type, CASE WHEN is_nullable THEN 'YES' ELSE 'NO' END AS is_nullable \
             FROM duckdb_columns() WHERE table_name = '{}' ORDER BY column_index",
            table.replace('\'', "''")
        );
        self.query(&sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queries_in_memory() {
        let mut conn = DuckDbDriver.connect("duckdb", "").await.unwrap();
        conn.execute("CREATE TABLE t (id INTEGER, name VARCHAR); INSERT INTO t VALUES (1, 'a'), (2, NULL);")
            .await
            .unwrap();

        let result = conn.query("SELECT id, name FROM t ORDER BY id").await.unwrap();

        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.rows[0]["id"], Value::Int(1));
        assert_eq!(result.rows[1]["name"], Value::Null);
    }
}
