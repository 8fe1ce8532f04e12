//! Open-database connectivity driver using [arrow-odbc](https://docs.rs/arrow-odbc)'s `odbc_api`.
//!
//! Every call opens its own connection on a blocking thread; ODBC handles are
//! not shared across tasks.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use arrow_odbc::odbc_api::buffers::TextRowSet;
use arrow_odbc::odbc_api::{ConnectionOptions, Cursor, Environment, ResultSetMetadata};
use async_trait::async_trait;
use tracing::debug;

use crate::csv_sink::{bytes_to_utf8, CsvSink};
use crate::driver::{Connection, Driver, EXTENDED_TIMEOUT};
use crate::error::DbError;
use crate::value::{QueryResult, Row, Value};
use crate::Result;

const BATCH_SIZE: usize = 5000;
const MAX_STR_LEN: usize = 4096;

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

fn environment() -> Result<&'static Environment> {
    if let Some(env) = ENVIRONMENT.get() {
        return Ok(env);
    }
    let env = Environment::new()?;
    Ok(ENVIRONMENT.get_or_init(|| env))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OdbcDriver;

#[async_trait]
impl Driver for OdbcDriver {
    fn name(&self) -> &str {
        "odbc"
    }

    fn default_timeout(&self) -> Duration {
        EXTENDED_TIMEOUT
    }

    async fn connect(&self, _driver: &str, dsn: &str) -> Result<Box<dyn Connection>> {
        let conn = OdbcConnection {
            dsn: dsn.to_string(),
        };
        let probe = conn.dsn.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            environment()?
                .connect_with_connection_string(&probe, ConnectionOptions::default())
                .map(|_| ())
                .map_err(|e| DbError::Connect {
                    driver: "odbc".into(),
                    message: e.to_string(),
                })
        })
        .await??;
        Ok(Box::new(conn))
    }
}

pub struct OdbcConnection {
    dsn: String,
}

/// Integer when the text parses as one, float when it has a fraction,
/// otherwise text decoded from latin-1 when it is not UTF-8.
fn classify(bytes: &[u8]) -> Value {
    let text = bytes_to_utf8(bytes);
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if trimmed.contains('.') {
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
    }
    Value::Text(trimmed.to_string())
}

/// Run `sql`, handing every fetched row to `on_row`. Returns the column names.
fn run<F>(dsn: &str, sql: &str, mut on_row: F) -> Result<Vec<String>>
where
    F: FnMut(&[String], Vec<Value>) -> Result<()>,
{
    let conn = environment()?.connect_with_connection_string(dsn, ConnectionOptions::default())?;
    let mut prepared = conn.prepare(sql)?;
    let Some(mut cursor) = prepared.execute(())? else {
        return Ok(Vec::new());
    };

    let mut columns = Vec::new();
    for idx in 1..=cursor.num_result_cols()? {
        columns.push(cursor.col_name(idx as u16)?);
    }

    let buffer = TextRowSet::for_cursor(BATCH_SIZE, &mut cursor, Some(MAX_STR_LEN))?;
    let mut row_cursor = cursor.bind_buffer(buffer)?;
    while let Some(batch) = row_cursor.fetch()? {
        for row in 0..batch.num_rows() {
            let values = (0..batch.num_cols())
                .map(|col| batch.at(col, row).map(classify).unwrap_or(Value::Null))
                .collect();
            on_row(&columns, values)?;
        }
    }
    Ok(columns)
}

#[async_trait]
impl Connection for OdbcConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let (dsn, sql) = (self.dsn.clone(), sql.to_string());
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn =
                environment()?.connect_with_connection_string(&dsn, ConnectionOptions::default())?;
            let mut prepared = conn.prepare(&sql)?;
            prepared.execute(())?;
            Ok(0)
        })
        .await?
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let (dsn, sql) = (self.dsn.clone(), sql.to_string());
        tokio::task::spawn_blocking(move || -> Result<QueryResult> {
            let mut rows = Vec::new();
            let columns = run(&dsn, &sql, |columns, values| {
                rows.push(columns.iter().cloned().zip(values).collect::<Row>());
                Ok(())
            })?;
            Ok(QueryResult::new(columns, rows))
        })
        .await?
    }

    /// Streams batches straight into the CSV file instead of collecting them.
    async fn query_to_csv(&mut self, sql: &str, path: &Path) -> Result<u64> {
        let (dsn, sql, path) = (self.dsn.clone(), sql.to_string(), PathBuf::from(path));
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut sink: Option<CsvSink> = None;
            let columns = run(&dsn, &sql, |columns, values| {
                if sink.is_none() {
                    sink = Some(CsvSink::create(&path, columns)?);
                }
                match sink.as_mut() {
                    Some(sink) => sink.write_row(values.iter()),
                    None => Ok(()),
                }
            })?;
            let written = match sink {
                Some(sink) => sink.finish()?,
                None => CsvSink::create(&path, &columns)?.finish()?,
            };
            debug!("Wrote {written} rows to {}", path.display());
            Ok(written)
        })
        .await?
    }
}
