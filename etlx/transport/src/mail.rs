//! Email delivery contract.

use std::path::PathBuf;

use async_trait::async_trait;
use bon::Builder;
use serde::Serialize;

use crate::remote::Unsupported;
use crate::{Result, TransportError};

/// A rendered message ready to send. SMTP settings are up to the mailer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Builder)]
pub struct Mail {
    #[builder(default)]
    pub to: Vec<String>,
    #[builder(default)]
    pub cc: Vec<String>,
    #[builder(default)]
    pub bcc: Vec<String>,
    #[builder(into, default)]
    pub subject: String,
    /// HTML body
    #[builder(into, default)]
    pub body: String,
    #[builder(default)]
    pub attachments: Vec<PathBuf>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<()>;
}

#[async_trait]
impl Mailer for Unsupported {
    async fn send(&self, _mail: &Mail) -> Result<()> {
        Err(TransportError::unsupported("email delivery"))
    }
}
