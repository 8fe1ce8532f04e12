use crate::{config::ConfigError, templating::TemplateError};

use etlx_db::DbError;
use etlx_transport::TransportError;
use miette::Diagnostic;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(Box<ConfigError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Db(Box<DbError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(Box<TransportError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(Box<TemplateError>),

    #[error("invalid error pattern: {0}")]
    #[diagnostic(
        code(etlx::pattern),
        help("`*_on_err_match_patt` values are regular expressions matched against the error text")
    )]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    #[diagnostic(code(etlx::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(etlx::json))]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::Config(Box::new(error))
    }
}

impl From<DbError> for Error {
    fn from(error: DbError) -> Self {
        Error::Db(Box::new(error))
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Error::Transport(Box::new(error))
    }
}

impl From<TemplateError> for Error {
    fn from(error: TemplateError) -> Self {
        Error::Template(Box::new(error))
    }
}
