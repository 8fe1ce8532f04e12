use std::sync::Arc;

use miette::{Diagnostic, NamedSource, SourceSpan};

/// Errors that stop a configuration from loading or a section from running.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum ConfigError {
    #[error("configuration file not found: '{file_path}'")]
    #[diagnostic(
        code(etlx::config::file_not_found),
        help("Check that the file path is correct and the file exists")
    )]
    NotFound {
        #[source]
        source: std::io::Error,
        file_path: String,
    },

    #[error("error parsing notebook JSON")]
    #[diagnostic(
        code(etlx::config::notebook),
        help("Notebooks must be valid .ipynb JSON with a `cells` list")
    )]
    Notebook(#[source] serde_json::Error),

    #[error("missing parent section for level {level} heading: {heading}")]
    #[diagnostic(
        code(etlx::config::orphan_heading),
        help("A level {level} heading needs an enclosing heading one level up")
    )]
    OrphanHeading {
        level: usize,
        heading: String,
        #[source_code]
        source_code: Arc<NamedSource<String>>,
        #[label("no enclosing section")]
        span: SourceSpan,
    },

    #[error("missing or invalid {0} section")]
    #[diagnostic(code(etlx::config::missing_section))]
    MissingSection(String),

    #[error("missing metadata in {0} section")]
    #[diagnostic(
        code(etlx::config::missing_metadata),
        help("Add a ```yaml metadata``` block under the `{0}` heading")
    )]
    MissingMetadata(String),

    #[error("{0} err no connection defined")]
    #[diagnostic(
        code(etlx::config::missing_connection),
        help("Set `connection` in the section metadata or the DB_DRIVER_NAME / DB_DSN variables")
    )]
    MissingConnection(String),

    #[error("{0} is deactivated")]
    #[diagnostic(code(etlx::config::deactivated))]
    Deactivated(String),

    #[error("invalid {key} configuration: {message}")]
    #[diagnostic(code(etlx::config::invalid))]
    Invalid { key: String, message: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// A payload the parser skipped, reported without aborting the walk.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ParseWarning {
    /// Heading path of the section holding the block
    pub section: String,
    pub message: String,
}
