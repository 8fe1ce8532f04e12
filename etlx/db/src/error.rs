use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by the database facade and its drivers.
///
/// Connection strings are never included in the messages, only the driver id.
#[derive(Debug, Error, Diagnostic)]
pub enum DbError {
    #[error("no driver registered for '{0}'")]
    #[diagnostic(
        code(etlx::db::unknown_driver),
        help("Connection strings take the form `driver:dsn`, e.g. `sqlite3:database/app.db` or `duckdb:`")
    )]
    UnknownDriver(String),

    #[error("driver '{driver}' is not enabled in this build")]
    #[diagnostic(
        code(etlx::db::driver_disabled),
        help("Rebuild with the `{driver}` feature flag")
    )]
    DriverDisabled { driver: String },

    #[error("{driver} Conn: {message}")]
    #[diagnostic(code(etlx::db::connect))]
    Connect { driver: String, message: String },

    #[error("{0}")]
    #[diagnostic(code(etlx::db::query))]
    Query(String),

    #[error("operation timed out after {0:.2?}")]
    #[diagnostic(
        code(etlx::db::timeout),
        help("Raise the item `timeout` (seconds) in its metadata")
    )]
    Timeout(Duration),

    #[error("invalid connection string: {0}")]
    #[diagnostic(code(etlx::db::invalid_connection))]
    InvalidConnection(String),

    #[error(transparent)]
    #[diagnostic(code(etlx::db::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(etlx::db::csv))]
    Csv(#[from] csv::Error),

    #[cfg(feature = "sql")]
    #[error(transparent)]
    #[diagnostic(code(etlx::db::sqlx))]
    Sqlx(#[from] sqlx::Error),

    #[cfg(feature = "duckdb")]
    #[error(transparent)]
    #[diagnostic(code(etlx::db::duckdb))]
    DuckDb(#[from] duckdb::Error),

    #[cfg(feature = "odbc")]
    #[error(transparent)]
    #[diagnostic(code(etlx::db::odbc))]
    Odbc(#[from] arrow_odbc::odbc_api::Error),

    #[error("background task failed: {0}")]
    #[diagnostic(code(etlx::db::join))]
    Join(#[from] tokio::task::JoinError),
}
