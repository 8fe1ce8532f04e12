//! The uniform operation surface every runner talks to.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::dialect::adjust_query;
use crate::driver::Connection;
use crate::error::DbError;
use crate::value::{QueryResult, Row};
use crate::Result;

/// An open database handle with its driver id and per-call timeout.
///
/// Queries are rewritten for the driver dialect before they reach the connection
/// and every call is bounded by the timeout.
pub struct Database {
    conn: Box<dyn Connection>,
    driver: String,
    timeout: Duration,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("driver", &self.driver)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

async fn bounded<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DbError::Timeout(timeout))?
}

impl Database {
    pub fn new(driver: impl Into<String>, conn: Box<dyn Connection>, timeout: Duration) -> Self {
        Self {
            conn,
            driver: driver.into(),
            timeout,
        }
    }

    /// The driver id this handle was opened with (`GetDriverName`)
    pub fn driver_name(&self) -> &str {
        &self.driver
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Override the per-call timeout, e.g. from an item `timeout`
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn prepare(&self, sql: &str) -> String {
        adjust_query(&self.driver, sql)
    }

    /// `ExecuteQuery`
    #[instrument(skip_all, err, fields(driver = %self.driver))]
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.execute_rows_affected(sql).await.map(|_| ())
    }

    /// `ExecuteQueryRowsAffected`
    pub async fn execute_rows_affected(&mut self, sql: &str) -> Result<u64> {
        let sql = self.prepare(sql);
        let time = Instant::now();
        let affected = bounded(self.timeout, self.conn.execute(&sql)).await?;
        debug!("Executed statement, {affected} rows affected. Elapsed time: {:.2?}", time.elapsed());
        Ok(affected)
    }

    /// `QueryMultiRowsWithCols`
    #[instrument(skip_all, err, fields(driver = %self.driver))]
    pub async fn query_with_columns(&mut self, sql: &str) -> Result<QueryResult> {
        let sql = self.prepare(sql);
        let time = Instant::now();
        let result = bounded(self.timeout, self.conn.query(&sql)).await?;
        debug!(
            "Fetched {} rows. Elapsed time: {:.2?}",
            result.rows.len(),
            time.elapsed()
        );
        Ok(result)
    }

    /// `QueryMultiRows`
    pub async fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.query_with_columns(sql).await.map(|r| r.rows)
    }

    /// `QuerySingleRow`: the first row, `None` for an empty result
    pub async fn query_single_row(&mut self, sql: &str) -> Result<Option<Row>> {
        Ok(self.query_rows(sql).await?.into_iter().next())
    }

    /// `Query2CSV`, returns the number of rows written
    #[instrument(skip(self, sql), err, fields(driver = %self.driver))]
    pub async fn query_to_csv(&mut self, sql: &str, path: &Path) -> Result<u64> {
        let sql = self.prepare(sql);
        bounded(self.timeout, self.conn.query_to_csv(&sql, path)).await
    }

    /// `AllTables`
    pub async fn all_tables(&mut self) -> Result<QueryResult> {
        bounded(self.timeout, self.conn.all_tables()).await
    }

    /// `TableSchema`
    pub async fn table_schema(&mut self, table: &str) -> Result<QueryResult> {
        bounded(self.timeout, self.conn.table_schema(table)).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        bounded(self.timeout, self.conn.ping()).await
    }

    pub async fn close(self) -> Result<()> {
        let timeout = self.timeout;
        bounded(timeout, self.conn.close()).await
    }
}
