//! Narrow contracts for remote transfers. The engine only ever talks to these
//! traits; concrete clients are injected through [`crate::Transports`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use serde::Serialize;

use crate::{Result, TransportError};

/// Dial timeout for SFTP sessions.
pub const SFTP_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters of an FTP transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Builder)]
pub struct FtpParams {
    #[builder(into)]
    pub host: String,
    pub port: Option<u16>,
    #[builder(into, default)]
    pub user: String,
    #[builder(into, default)]
    pub password: String,
    #[builder(into)]
    pub local_path: PathBuf,
    #[builder(into)]
    pub remote_path: String,
}

impl FtpParams {
    /// `host:port`, defaulting to port 21
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(21))
    }
}

/// Parameters of an SFTP transfer. The server key is pinned through `host_key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Builder)]
pub struct SftpParams {
    #[builder(into)]
    pub host: String,
    pub port: Option<u16>,
    #[builder(into, default)]
    pub user: String,
    #[builder(into, default)]
    pub password: String,
    /// Path of the trusted public key of the server
    #[builder(into)]
    pub host_key: PathBuf,
    #[builder(into)]
    pub local_path: PathBuf,
    #[builder(into)]
    pub remote_path: String,
}

impl SftpParams {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(22))
    }
}

/// Parameters of an HTTP transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Builder)]
pub struct HttpParams {
    #[builder(into)]
    pub url: String,
    /// Defaults to GET for downloads and POST for uploads
    #[builder(into)]
    pub method: Option<String>,
    #[builder(default)]
    pub headers: BTreeMap<String, String>,
    #[builder(into)]
    pub content_type: Option<String>,
    /// Multipart field name; when absent the file is sent as the raw body
    #[builder(into)]
    pub form_field: Option<String>,
    /// File to upload
    #[builder(into)]
    pub source: Option<PathBuf>,
    /// File to download into
    #[builder(into)]
    pub target: Option<PathBuf>,
}

/// Parameters of an S3 transfer. Unset credentials fall back to `AWS_*` variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Builder)]
pub struct S3Params {
    #[builder(into)]
    pub bucket: String,
    #[builder(into)]
    pub key: String,
    #[builder(into)]
    pub region: Option<String>,
    #[builder(into)]
    pub endpoint: Option<String>,
    #[builder(into)]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    #[builder(into)]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing)]
    #[builder(into)]
    pub session_token: Option<String>,
    #[builder(default)]
    pub path_style: bool,
    /// Allow plain HTTP endpoints
    #[builder(default)]
    pub allow_http: bool,
    #[builder(into)]
    pub source: Option<PathBuf>,
    #[builder(into)]
    pub target: Option<PathBuf>,
}

#[async_trait]
pub trait FtpClient: Send + Sync {
    async fn upload(&self, params: &FtpParams) -> Result<()>;
    async fn download(&self, params: &FtpParams) -> Result<()>;
}

#[async_trait]
pub trait SftpClient: Send + Sync {
    async fn upload(&self, params: &SftpParams) -> Result<()>;
    async fn download(&self, params: &SftpParams) -> Result<()>;
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send the source file, returning the response status
    async fn upload(&self, params: &HttpParams) -> Result<u16>;
    /// Fetch into the target file, returning the number of bytes written
    async fn download(&self, params: &HttpParams) -> Result<u64>;
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn upload(&self, params: &S3Params) -> Result<()>;
    async fn download(&self, params: &S3Params) -> Result<u64>;
}

/// Adapter used when no client is available for a channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

#[async_trait]
impl FtpClient for Unsupported {
    async fn upload(&self, _params: &FtpParams) -> Result<()> {
        Err(TransportError::unsupported("ftp upload"))
    }

    async fn download(&self, _params: &FtpParams) -> Result<()> {
        Err(TransportError::unsupported("ftp download"))
    }
}

#[async_trait]
impl SftpClient for Unsupported {
    async fn upload(&self, _params: &SftpParams) -> Result<()> {
        Err(TransportError::unsupported("sftp upload"))
    }

    async fn download(&self, _params: &SftpParams) -> Result<()> {
        Err(TransportError::unsupported("sftp download"))
    }
}

#[async_trait]
impl HttpClient for Unsupported {
    async fn upload(&self, _params: &HttpParams) -> Result<u16> {
        Err(TransportError::unsupported("http upload"))
    }

    async fn download(&self, _params: &HttpParams) -> Result<u64> {
        Err(TransportError::unsupported("http download"))
    }
}

#[async_trait]
impl ObjectStoreClient for Unsupported {
    async fn upload(&self, _params: &S3Params) -> Result<()> {
        Err(TransportError::unsupported("s3 upload"))
    }

    async fn download(&self, _params: &S3Params) -> Result<u64> {
        Err(TransportError::unsupported("s3 download"))
    }
}
