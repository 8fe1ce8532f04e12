//! Capability traits implemented by every database backend

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::value::QueryResult;
use crate::Result;

/// Default per-call timeout for generic SQL drivers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Per-call timeout for the embedded analytic engine and ODBC.
pub const EXTENDED_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A database backend able to open connections from a driver specific DSN.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Identifier reported by `GetDriverName`
    fn name(&self) -> &str;

    /// Timeout applied to every call on connections of this driver
    fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Open a new connection, `driver` is the id it was looked up with (e.g. `postgres`, `sqlite3`)
    async fn connect(&self, driver: &str, dsn: &str) -> Result<Box<dyn Connection>>;
}

/// An open session on a backend.
///
/// SQL handed to these methods has already gone through dialect rewriting.
#[async_trait]
pub trait Connection: Send {
    /// Execute one or more statements, returning the number of affected rows
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a query and collect every row
    async fn query(&mut self, sql: &str) -> Result<QueryResult>;

    /// Stream a query into a CSV file, returning the number of rows written
    async fn query_to_csv(&mut self, sql: &str, path: &Path) -> Result<u64> {
        let result = self.query(sql).await?;
        crate::csv_sink::write_csv(path, &result)
    }

    async fn all_tables(&mut self) -> Result<QueryResult> {
        self.query("SELECT table_name AS name FROM information_schema.tables")
            .await
    }

    async fn table_schema(&mut self, table: &str) -> Result<QueryResult> {
        self.query(&format!(
            "SELECT column_name AS name, data_type AS type, is_nullable \
             FROM information_schema.columns WHERE table_name = '{}' ORDER BY ordinal_position",
            table.replace('\'', "''")
        ))
        .await
    }

    async fn ping(&mut self) -> Result<()> {
        self.query("SELECT 1").await.map(|_| ())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
