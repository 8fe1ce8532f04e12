//! Configuration model, query composition and pipeline orchestration for etlx.
//!
//! A run starts from a Markdown (or notebook) document parsed into a
//! [`Config`](config::Config). The [`Engine`](engine::Engine) then hands each
//! top-level section to its runner, which resolves SQL through placeholders and
//! query references, executes it against the [`etlx_db`] facade, and leaves a
//! [`LogRecord`](engine::LogRecord) for every unit of work.
//!
//! ```rust,no_run
//! use etlx_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> etlx_core::Result<()> {
//! let config = Config::from_file("pipeline.md")?;
//! let mut engine = Engine::builder()
//!     .config(config)
//!     .tracker(Arc::new(LoggingProgressTracker) as Arc<dyn ProgressTracker>)
//!     .build();
//!
//! let outcome = engine.run_all(&RunOptions::default()).await?;
//! for record in outcome.records.iter().filter(|r| !r.success) {
//!     eprintln!("{}: {}", record.name, record.msg);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod placeholders;
pub mod progress_tracker;
pub mod query_doc;
pub mod templating;

pub use error::{Error, Result};

/// Prelude to import the configuration model and the engine
pub mod prelude {
    pub use super::config::{Config, ConfigError, Node};
    pub use super::engine::{Engine, LogRecord, RunOptions, RunOutcome, RunnerKind};
    pub use super::env::{EnvResolver, MapEnv, ProcessEnv};
    pub use super::progress_tracker::{LoggingProgressTracker, ProgressEvent, ProgressTracker};
    pub use super::query_doc::{build_query, QueryDoc};
    pub use super::{Error, Result};
}
