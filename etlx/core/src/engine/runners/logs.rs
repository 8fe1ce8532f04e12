//! `LOGS` sections: the records of the run saved through SQL.
//!
//! The records are written to a JSON file first; `save_log_sql` reads it
//! through `<fname>` (for example `read_json('<fname>')` on DuckDB) and inserts
//! into `<table>`.

use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, instrument};

use super::{close, connect};
use crate::config::{ConfigError, Node};
use crate::engine::log::{LogBook, LogRecord};
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::Result;

#[instrument(skip_all, fields(key = %key, records = history.len()))]
pub async fn run(rt: &Runtime<'_>, key: &str, history: &[LogRecord], book: &mut LogBook) -> Result<()> {
    let (section, meta) = rt.config.section_with_metadata(key)?;
    if !meta.is_active() {
        return Err(ConfigError::Deactivated(key.to_string()).into());
    }
    let dates = rt.dates_for(Some(meta));
    let reference = Runtime::reference(&dates);

    let Some(conn) = rt.connection(&[meta.get_str("connection")]) else {
        return Err(ConfigError::MissingConnection(key.to_string()).into());
    };
    let fname = write_json(rt, meta, history)?;
    debug!("Saved {} records to {}", history.len(), fname.display());
    let fname = fname.display().to_string();

    let record = LogRecord::start(format!("{key}:Conn"), key).reference(reference.clone());
    let Some(mut db) = connect(rt, book, record, &[Some(conn.as_str())], Some(meta)).await else {
        return Ok(());
    };

    let ctx = rt
        .sql_context(section, &dates)
        .table(meta.get_str("table"))
        .file(Some(&fname))
        .label(key);
    let mut phases = Phases::new(&mut db, &ctx, book, key, key).reference(reference);

    if phases.before(meta.get_set("before_sql"), &OnError::none()).await {
        if let Some(save) = meta.get_set("save_log_sql") {
            let on_err = OnError::from_metadata(meta, "save_on_err_patt", "save_on_err_sql", false);
            phases.main(save, &on_err).await;
        }
    }
    phases.after(meta.get_set("after_sql"), &OnError::none()).await;
    drop(phases);
    close(db).await;
    Ok(())
}

/// Pretty JSON of the records in a uniquely named `logs.*.json` file that outlives the run.
fn write_json(rt: &Runtime<'_>, meta: &Node, history: &[LogRecord]) -> Result<PathBuf> {
    let dir = meta
        .get_str("tmp_dir")
        .filter(|d| !d.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| rt.tmp_dir.to_path_buf());
    std::fs::create_dir_all(&dir)?;

    let mut file = tempfile::Builder::new()
        .prefix("logs.")
        .suffix(".json")
        .tempfile_in(&dir)?;
    serde_json::to_writer_pretty(&mut file, history)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}
