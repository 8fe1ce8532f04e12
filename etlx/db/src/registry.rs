//! Driver lookup by connection-string prefix.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::connection_string::{parse_connection, ConnectionTarget};
use crate::driver::Driver;
use crate::error::DbError;
use crate::facade::Database;
use crate::lake::LakeAttach;
use crate::Result;

/// Driver ids understood by the bundled drivers, used to tell a disabled
/// feature apart from a typo.
const KNOWN_DRIVERS: &[(&str, &str)] = &[
    ("sqlite", "sql"),
    ("sqlite3", "sql"),
    ("postgres", "sql"),
    ("postgresql", "sql"),
    ("pgx", "sql"),
    ("mysql", "sql"),
    ("duckdb", "duckdb"),
    ("ducklake", "duckdb"),
    ("odbc", "odbc"),
];

/// Registry of drivers keyed by the connection-string prefix.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every driver compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "sql")]
        {
            let sql: Arc<dyn Driver> = Arc::new(crate::drivers::sql::SqlDriver);
            for id in ["sqlite", "sqlite3", "postgres", "postgresql", "pgx", "mysql"] {
                registry.register(id, sql.clone());
            }
        }

        #[cfg(feature = "duckdb")]
        registry.register("duckdb", Arc::new(crate::drivers::duckdb::DuckDbDriver));

        #[cfg(feature = "odbc")]
        registry.register("odbc", Arc::new(crate::drivers::odbc::OdbcDriver));

        registry
    }

    pub fn register(&mut self, id: impl Into<String>, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(id.into().to_lowercase(), driver);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&id.to_lowercase()).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    fn lookup(&self, id: &str) -> Result<Arc<dyn Driver>> {
        if let Some(driver) = self.get(id) {
            return Ok(driver);
        }
        match KNOWN_DRIVERS.iter().find(|(known, _)| *known == id) {
            Some((_, feature)) => Err(DbError::DriverDisabled {
                driver: (*feature).to_string(),
            }),
            None => Err(DbError::UnknownDriver(id.to_string())),
        }
    }

    /// Open a handle using the driver's default timeout.
    pub async fn open(&self, conn: &str) -> Result<Database> {
        self.open_with_timeout(conn, None).await
    }

    /// Open a handle, `timeout` overriding the driver default.
    #[instrument(skip_all, err)]
    pub async fn open_with_timeout(
        &self,
        conn: &str,
        timeout: Option<Duration>,
    ) -> Result<Database> {
        match parse_connection(conn) {
            ConnectionTarget::Lake(lake) => self.open_lake(&lake, timeout).await,
            ConnectionTarget::Driver { driver, dsn } => {
                if driver.is_empty() {
                    return Err(DbError::InvalidConnection(
                        "missing `driver:` prefix".to_string(),
                    ));
                }
                let imp = self.lookup(&driver)?;
                let handle = imp.connect(&driver, &dsn).await?;
                debug!("Opened {driver} connection");
                Ok(Database::new(
                    driver,
                    handle,
                    timeout.unwrap_or_else(|| imp.default_timeout()),
                ))
            }
        }
    }

    /// Open the analytic engine in memory, load the lake extension, attach
    /// the catalog and switch to it.
    async fn open_lake(&self, lake: &LakeAttach, timeout: Option<Duration>) -> Result<Database> {
        let imp = self.lookup("duckdb")?;
        let handle = imp.connect("duckdb", ":memory:").await?;
        let mut db = Database::new(
            "duckdb",
            handle,
            timeout.unwrap_or_else(|| imp.default_timeout()),
        );
        db.execute("INSTALL ducklake; LOAD ducklake;").await?;
        db.execute(&lake.attach_sql()).await?;
        db.execute(&format!("USE {}", lake.catalog())).await?;
        debug!("Attached lake catalog {}", lake.catalog());
        Ok(db)
    }
}
