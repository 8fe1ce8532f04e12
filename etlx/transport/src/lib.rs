//! Transport adapters for etlx
//!
//! - Local file copy and zip / gzip compression (always available)
//! - HTTP upload and download (with the `http` feature)
//! - S3 upload and download (with the `s3` feature)
//! - Contracts for FTP, SFTP, email and spreadsheet writers
//!
//! The engine receives every adapter through a [`Transports`] bundle so that
//! embedders and tests can swap any channel.

use std::fmt;
use std::sync::Arc;

pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod local;
pub mod mail;
pub mod remote;
#[cfg(feature = "s3")]
pub mod s3;
pub mod spreadsheet;

pub use error::TransportError;
pub use mail::{Mail, Mailer};
pub use remote::{
    FtpClient, FtpParams, HttpClient, HttpParams, ObjectStoreClient, S3Params, SftpClient,
    SftpParams, Unsupported, SFTP_DIAL_TIMEOUT,
};
pub use spreadsheet::{ColumnFormula, SheetItem, SheetItemKind, SpreadsheetJob, SpreadsheetWriter};

pub type Result<T> = core::result::Result<T, TransportError>;

/// Every channel the engine can reach.
#[derive(Clone)]
pub struct Transports {
    pub ftp: Arc<dyn FtpClient>,
    pub sftp: Arc<dyn SftpClient>,
    pub http: Arc<dyn HttpClient>,
    pub s3: Arc<dyn ObjectStoreClient>,
    pub mailer: Arc<dyn Mailer>,
    pub spreadsheet: Arc<dyn SpreadsheetWriter>,
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transports").finish_non_exhaustive()
    }
}

impl Transports {
    /// Every channel reports `Unsupported`
    pub fn unsupported() -> Self {
        Self {
            ftp: Arc::new(Unsupported),
            sftp: Arc::new(Unsupported),
            http: Arc::new(Unsupported),
            s3: Arc::new(Unsupported),
            mailer: Arc::new(Unsupported),
            spreadsheet: Arc::new(Unsupported),
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_spreadsheet(mut self, writer: Arc<dyn SpreadsheetWriter>) -> Self {
        self.spreadsheet = writer;
        self
    }

    pub fn with_ftp(mut self, client: Arc<dyn FtpClient>) -> Self {
        self.ftp = client;
        self
    }

    pub fn with_sftp(mut self, client: Arc<dyn SftpClient>) -> Self {
        self.sftp = client;
        self
    }

    pub fn with_http(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = client;
        self
    }

    pub fn with_s3(mut self, client: Arc<dyn ObjectStoreClient>) -> Self {
        self.s3 = client;
        self
    }
}

impl Default for Transports {
    /// The HTTP and S3 clients compiled into this build, `Unsupported` elsewhere
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut transports = Self::unsupported();

        #[cfg(feature = "http")]
        match http::ReqwestHttp::new() {
            Ok(client) => transports.http = Arc::new(client),
            Err(e) => tracing::warn!("HTTP client unavailable: {e}"),
        }

        #[cfg(feature = "s3")]
        {
            transports.s3 = Arc::new(s3::S3Store);
        }

        transports
    }
}

/// Prelude module that exports commonly used types
pub mod prelude {
    pub use crate::local::{copy_file, gunzip, gzip_file, unzip, zip_files};
    pub use crate::{
        FtpParams, HttpParams, Mail, Result, S3Params, SftpParams, SheetItem, SheetItemKind,
        SpreadsheetJob, TransportError, Transports,
    };
}
