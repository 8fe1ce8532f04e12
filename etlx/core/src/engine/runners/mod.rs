//! One runner per kind of top-level section.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use etlx_db::Database;
use tracing::warn;

use super::log::{LogBook, LogRecord};
use super::Runtime;
use crate::config::{ConfigError, Node};
use crate::Result;

pub mod actions;
pub mod data_quality;
pub mod db2db;
pub mod etl;
pub mod exports;
pub mod logs;
pub mod multi_queries;
pub mod notify;
pub mod requires;
pub mod scripts;

/// The section and its metadata, failing when either is missing or the section is off.
pub(crate) fn active_section<'a>(rt: &Runtime<'a>, key: &str) -> Result<(&'a Node, &'a Node)> {
    let (section, meta) = rt.config.section_with_metadata(key)?;
    if !meta.is_active() {
        return Err(ConfigError::Deactivated(key.to_string()).into());
    }
    Ok((section, meta))
}

/// Open the first configured connection, leaving a `:Conn` record either way.
pub(crate) async fn connect(
    rt: &Runtime<'_>,
    book: &mut LogBook,
    record: LogRecord,
    candidates: &[Option<&str>],
    meta: Option<&Node>,
) -> Option<Database> {
    let Some(conn) = rt.connection(candidates) else {
        book.push(record.failed("no connection defined"));
        return None;
    };
    match rt.open(&conn, meta).await {
        Ok(db) => {
            let driver = db.driver_name().to_string();
            book.push(record.ok(format!("connection to {driver} successful")));
            Some(db)
        }
        Err(e) => {
            book.push(record.failed(format!("connecting to {}: {e}", driver_of(&conn))));
            None
        }
    }
}

/// Close a handle, a failure only deserves a warning.
pub(crate) async fn close(db: Database) {
    if let Err(e) = db.close().await {
        warn!("Failed to close the connection: {e}");
    }
}

// Driver id only, DSNs may hold credentials
fn driver_of(conn: &str) -> String {
    etlx_db::parse_connection(conn).driver().to_string()
}

/// The section `path` after placeholders, created when missing.
pub(crate) fn section_path(
    rt: &Runtime<'_>,
    meta: &Node,
    dates: &[NaiveDateTime],
) -> Result<Option<PathBuf>> {
    let Some(path) = meta.get_str("path").filter(|p| !p.trim().is_empty()) else {
        return Ok(None);
    };
    let path = PathBuf::from(rt.placeholders(dates).apply(path));
    std::fs::create_dir_all(&path)?;
    Ok(Some(path))
}

/// `<dir>/<name>_YYYYMMDD.<ext>` for the first reference date (today without one).
pub(crate) fn dated_file(dir: &Path, name: &str, ext: &str, dates: &[NaiveDateTime]) -> PathBuf {
    let stamp = dates
        .first()
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d").to_string());
    dir.join(format!("{name}_{stamp}.{ext}"))
}

/// The description of a metadata map, empty when unset.
pub(crate) fn description(meta: &Node) -> &str {
    meta.get_str("description").unwrap_or_default()
}

/// A record named `{key}->{item}` or `{key}->{item}:{suffix}`.
pub(crate) fn item_record(key: &str, item_key: &str, suffix: &str, reference: Option<String>) -> LogRecord {
    let name = if suffix.is_empty() {
        format!("{key}->{item_key}")
    } else {
        format!("{key}->{item_key}:{suffix}")
    };
    LogRecord::start(name, key).item(item_key).reference(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_messages_hide_dsns() {
        assert_eq!(driver_of("postgres:host=db password=secret"), "postgres");
        assert_eq!(driver_of("ATTACH 'ducklake:meta.ducklake' AS dl"), "ducklake");
    }
}
