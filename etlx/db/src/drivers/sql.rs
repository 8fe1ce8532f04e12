//! Generic SQL driver for sqlite, postgres and mysql through sqlx's `Any` backend.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{install_default_drivers, AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Column, Row as _, TypeInfo};
use tracing::debug;

use crate::connection_string::{embedded_path, ensure_parent, is_memory, mysql_url, postgres_url};
use crate::driver::{Connection, Driver};
use crate::error::DbError;
use crate::value::{QueryResult, Row, Value};
use crate::Result;

const MAX_CONNECTIONS: u32 = 25;
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Pooled driver for the dialects sqlx ships with.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlDriver;

/// Build the sqlx URL for a `driver:dsn` pair.
pub fn sqlx_url(driver: &str, dsn: &str) -> Result<String> {
    match driver {
        "sqlite" | "sqlite3" => {
            if dsn.starts_with("sqlite:") {
                return Ok(dsn.to_string());
            }
            match embedded_path(dsn, "db") {
                None => Ok("sqlite::memory:".to_string()),
                Some(path) => {
                    ensure_parent(&path)?;
                    Ok(format!("sqlite://{}?mode=rwc", path.display()))
                }
            }
        }
        "postgres" | "postgresql" | "pgx" => postgres_url(dsn),
        "mysql" => mysql_url(dsn),
        other => Err(DbError::UnknownDriver(other.to_string())),
    }
}

#[async_trait]
impl Driver for SqlDriver {
    fn name(&self) -> &str {
        "sql"
    }

    async fn connect(&self, driver: &str, dsn: &str) -> Result<Box<dyn Connection>> {
        install_default_drivers();

        let url = sqlx_url(driver, dsn)?;
        let in_memory = matches!(driver, "sqlite" | "sqlite3") && is_memory(dsn);

        // an in-memory sqlite database lives as long as its single connection
        let options = if in_memory {
            AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .idle_timeout(IDLE_TIMEOUT)
                .max_lifetime(MAX_LIFETIME)
        };

        let pool = options
            .connect(&url)
            .await
            .map_err(|e| DbError::Connect {
                driver: driver.to_string(),
                message: e.to_string(),
            })?;
        debug!("Connected {driver} pool");

        Ok(Box::new(SqlConnection {
            pool,
            driver: driver.to_string(),
        }))
    }
}

pub struct SqlConnection {
    pool: AnyPool,
    driver: String,
}

fn cell<'r, T>(row: &'r AnyRow, idx: usize) -> Option<Value>
where
    T: sqlx::Decode<'r, Any> + sqlx::Type<Any> + Into<Value>,
{
    row.try_get::<Option<T>, _>(idx)
        .ok()
        .map(|v| v.map(Into::into).unwrap_or(Value::Null))
}

fn decode_cell(row: &AnyRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let typed = match type_name.as_str() {
        "NULL" => Some(Value::Null),
        "BOOLEAN" | "BOOL" => cell::<bool>(row, idx),
        "SMALLINT" => cell::<i16>(row, idx),
        "INTEGER" | "INT" => cell::<i32>(row, idx),
        "BIGINT" => cell::<i64>(row, idx),
        "REAL" => cell::<f32>(row, idx),
        "DOUBLE" => cell::<f64>(row, idx),
        "TEXT" | "VARCHAR" => cell::<String>(row, idx),
        "BLOB" => cell::<Vec<u8>>(row, idx),
        _ => None,
    };
    typed
        .or_else(|| cell::<i64>(row, idx))
        .or_else(|| cell::<f64>(row, idx))
        .or_else(|| cell::<String>(row, idx))
        .or_else(|| cell::<Vec<u8>>(row, idx))
        .unwrap_or(Value::Null)
}

fn decode_row(row: &AnyRow) -> Row {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), decode_cell(row, col.ordinal())))
        .collect()
}

#[async_trait]
impl Connection for SqlConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let rows = sqlx::raw_sql(sql).fetch_all(&self.pool).await?;
        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        Ok(QueryResult::new(columns, rows.iter().map(decode_row).collect()))
    }

    async fn all_tables(&mut self) -> Result<QueryResult> {
        let sql = match self.driver.as_str() {
            "sqlite" | "sqlite3" => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            "mysql" => "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = DATABASE()",
            _ => "SELECT table_name AS name FROM information_schema.tables WHERE table_schema NOT IN ('pg_catalog', 'information_schema')",
        };
        self.query(sql).await
    }

    async fn table_schema(&mut self, table: &str) -> Result<QueryResult> {
        if matches!(self.driver.as_str(), "sqlite" | "sqlite3") {
            let sql = format!(
                "SELECT name, type, CASE WHEN \"notnull\" = 1 THEN 'NO' ELSE 'YES' END AS is_nullable \
                 FROM pragma_table_info('{}') ORDER BY cid",
                table.replace('\'', "''")
            );
            return self.query(&sql).await;
        }
        let sql = format!(
            "SELECT column_name AS name, data_type AS type, is_nullable \
             FROM information_schema.columns WHERE table_name = '{}' ORDER BY ordinal_position",
            table.replace('\'', "''")
        );
        self.query(&sql).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
