//! etlx - Declarative ETL pipelines written as Markdown documents
//!
//! This crate is a meta-package that re-exports the etlx crates so that a
//! single dependency brings the configuration model, the engine, the database
//! facade and the transports.
//!
//! # Features
//!
//! - **core**: Configuration model and engine (enabled by default)
//! - **sql**: SQLite, PostgreSQL and MySQL drivers (enabled by default)
//! - **duckdb**: Embedded DuckDB driver and lake attachments
//! - **odbc**: ODBC driver
//! - **http**: HTTP upload and download (enabled by default)
//! - **s3**: S3 upload and download (enabled by default)
//! - **full**: All features
//!
//! # Examples
//!
//! ```no_run
//! use etlx::prelude::*;
//!
//! # async fn run() -> etlx::Result<()> {
//! let outcome = etlx::api::run_file("pipeline.md", &RunOptions::default()).await?;
//! println!("{} records, {} failures", outcome.records.len(), outcome.failures());
//! # Ok(())
//! # }
//! ```

// Re-exports from core
#[cfg(feature = "core")]
pub use etlx_core::{self as core, prelude as core_prelude};

#[cfg(feature = "core")]
pub use etlx_core::{
    config::{Config, ConfigError, Node},
    engine::{Engine, LogRecord, RunOptions, RunOutcome, RunnerKind},
    progress_tracker::{LoggingProgressTracker, ProgressEvent, ProgressTracker},
    Error, Result,
};

// Re-exports from db
pub use etlx_db::{self as db, prelude as db_prelude};

// Re-exports from transport
pub use etlx_transport::{self as transport, prelude as transport_prelude};

/// Prelude module that exports commonly used types and functions.
///
/// `use etlx::prelude::*;` brings the engine together with the database and
/// transport preludes.
pub mod prelude {
    #[cfg(feature = "core")]
    pub use etlx_core::{Error, Result};

    #[cfg(feature = "core")]
    pub use etlx_core::prelude::*;

    pub use etlx_db::prelude::*;

    pub use etlx_transport::prelude::*;
}

/// A simpler API for common use cases
#[cfg(feature = "core")]
pub mod api {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;

    /// Load a Markdown or notebook document and run every section.
    ///
    /// Uses the default drivers and transports, the process environment and
    /// logs progress through `tracing`.
    pub async fn run_file<P: AsRef<Path>>(path: P, options: &RunOptions) -> Result<RunOutcome> {
        let config = Config::from_file(path)?;
        let mut engine = Engine::builder()
            .config(config)
            .tracker(Arc::new(LoggingProgressTracker) as Arc<dyn ProgressTracker>)
            .build();
        engine.run_all(options).await
    }
}
