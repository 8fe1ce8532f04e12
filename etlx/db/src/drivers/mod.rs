//! Bundled drivers, each behind its feature flag.

#[cfg(feature = "duckdb")]
pub mod duckdb;
#[cfg(feature = "odbc")]
pub mod odbc;
#[cfg(feature = "sql")]
pub mod sql;
