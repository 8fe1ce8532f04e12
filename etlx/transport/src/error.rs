//! Error types for transport operations

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by file, network and delivery adapters
#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    /// No adapter is configured for the operation
    #[error("{operation} is not supported by this build")]
    #[diagnostic(
        code(etlx::transport::unsupported),
        help("Inject an implementation through the engine's `Transports` bundle")
    )]
    Unsupported { operation: String },

    #[error("{0}")]
    #[diagnostic(code(etlx::transport::invalid_params))]
    InvalidParams(String),

    #[error(transparent)]
    #[diagnostic(code(etlx::transport::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(etlx::transport::zip))]
    Zip(#[from] zip::result::ZipError),

    #[cfg(feature = "http")]
    #[error(transparent)]
    #[diagnostic(code(etlx::transport::http))]
    Http(#[from] reqwest::Error),

    #[error("request to {url} failed with status {status}")]
    #[diagnostic(code(etlx::transport::http_status))]
    Status { url: String, status: u16 },

    #[cfg(feature = "s3")]
    #[error("Object store error: {0}")]
    #[diagnostic(code(etlx::transport::object_store))]
    ObjectStore(#[from] object_store::Error),

    #[error("background task failed: {0}")]
    #[diagnostic(code(etlx::transport::join))]
    Join(#[from] tokio::task::JoinError),
}

impl TransportError {
    pub fn unsupported(operation: impl Into<String>) -> Self {
        TransportError::Unsupported {
            operation: operation.into(),
        }
    }
}
