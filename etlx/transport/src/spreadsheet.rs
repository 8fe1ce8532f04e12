//! Spreadsheet template contract.

use std::path::PathBuf;

use async_trait::async_trait;
use etlx_db::QueryResult;
use serde::Serialize;

use crate::remote::Unsupported;
use crate::{Result, TransportError};

/// How an entry lands in the sheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetItemKind {
    /// Single value written at the anchor cell
    #[default]
    Value,
    /// A formula written at the anchor cell
    Formula,
    /// Rows written from the anchor, optionally as a named table
    Table,
}

impl SheetItemKind {
    pub fn parse(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "table" => SheetItemKind::Table,
            "formula" => SheetItemKind::Formula,
            _ => SheetItemKind::Value,
        }
    }
}

/// Formula applied to a table column.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColumnFormula {
    pub column: String,
    pub formula: String,
}

/// One mapping entry with the data already queried.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SheetItem {
    pub sheet: String,
    /// Name of the spreadsheet table to create or replace
    pub table: Option<String>,
    /// Anchor cell or range, e.g. `B3`
    pub range: String,
    pub kind: SheetItemKind,
    pub header: bool,
    /// What to do when the table exists: `append`, `replace`, ...
    pub if_exists: Option<String>,
    pub table_style: Option<String>,
    pub formula: Option<String>,
    pub formulas: Vec<ColumnFormula>,
    pub data: QueryResult,
}

/// Populate `template` into `output`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpreadsheetJob {
    pub template: PathBuf,
    pub output: PathBuf,
    pub items: Vec<SheetItem>,
}

#[async_trait]
pub trait SpreadsheetWriter: Send + Sync {
    async fn write(&self, job: &SpreadsheetJob) -> Result<()>;
}

#[async_trait]
impl SpreadsheetWriter for Unsupported {
    async fn write(&self, _job: &SpreadsheetJob) -> Result<()> {
        Err(TransportError::unsupported("spreadsheet export"))
    }
}
