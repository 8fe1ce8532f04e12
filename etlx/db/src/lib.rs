//! Database facade for etlx.
//!
//! Connection strings take the form `driver:dsn`, or the lake attach form
//! `[ATTACH] 'ducklake:DSN' [AS name] [(DATA_PATH '...')]`. A [`DriverRegistry`]
//! maps the driver prefix to a [`Driver`] and hands back a [`Database`] handle
//! exposing the uniform operation set used by the engine.
//!
//! ```rust,no_run
//! use etlx_db::prelude::*;
//!
//! # async fn run() -> etlx_db::Result<()> {
//! let registry = DriverRegistry::with_defaults();
//! let mut db = registry.open("sqlite3:database/app.db").await?;
//! db.execute("CREATE TABLE IF NOT EXISTS t (id INTEGER)").await?;
//! let rows = db.query_rows("SELECT COUNT(*) AS total FROM t").await?;
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection_string;
pub mod csv_sink;
pub mod dialect;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod facade;
pub mod lake;
pub mod registry;
pub mod value;

pub use connection_string::{parse_connection, ConnectionTarget};
pub use driver::{Connection, Driver, DEFAULT_TIMEOUT, EXTENDED_TIMEOUT};
pub use error::DbError;
pub use facade::Database;
pub use lake::LakeAttach;
pub use registry::DriverRegistry;
pub use value::{QueryResult, Row, Value};

pub type Result<T> = core::result::Result<T, DbError>;

/// Prelude to import the facade and its value types
pub mod prelude {
    pub use super::{
        parse_connection, Connection, ConnectionTarget, Database, DbError, Driver,
        DriverRegistry, QueryResult, Row, Value,
    };
}
