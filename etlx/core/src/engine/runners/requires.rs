//! `REQUIRES` sections: configuration fragments loaded from files or queries.

use std::path::Path;

use tracing::{debug, instrument};

use super::{active_section, close, connect, description, item_record, section_path};
use crate::config::{Config, Node};
use crate::engine::log::LogBook;
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::Result;

const DEFAULT_COLUMN: &str = "conf";

/// Load every fragment; the engine merges them into the running document.
#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<Vec<Config>> {
    let (section, meta) = active_section(rt, key)?;
    let main_path = section_path(rt, meta, &rt.options.dates)?;
    let mut configs = Vec::new();

    for (item_key, item, item_meta) in rt.items(key, section, book) {
        let record = item_record(key, &item_key, "", None).description(description(item_meta));
        let loaded = if item_meta.get_str("query").is_some_and(|q| !q.trim().is_empty()) {
            from_query(rt, key, meta, &item_key, item, item_meta, book).await
        } else if let Some(path) = item_meta.get_str("path").filter(|p| !p.trim().is_empty()) {
            let path = Runtime::resolve_path(main_path.as_deref(), &rt.placeholders(&[]).apply(path));
            from_path(&path)
        } else {
            Err("neither query nor path given".to_string())
        };

        match loaded {
            Ok(config) => {
                debug!("{key}->{item_key}: loaded sections {:?}", config.order());
                book.push(record.ok("Successfully loaded!"));
                configs.push(config);
            }
            Err(msg) => book.push(record.failed(msg)),
        }
    }
    Ok(configs)
}

fn from_path(path: &Path) -> std::result::Result<Config, String> {
    if !path.is_file() {
        return Err(format!("file doesn't exists: {}", path.display()));
    }
    Config::from_fragment_file(path)
        .map_err(|e| format!("Error parsing config: {} -> {e}", path.display()))
}

async fn from_query(
    rt: &Runtime<'_>,
    key: &str,
    section_meta: &Node,
    item_key: &str,
    item: &Node,
    meta: &Node,
    book: &mut LogBook,
) -> std::result::Result<Config, String> {
    let conn_record = item_record(key, item_key, "Conn", None);
    let candidates = [meta.get_str("connection"), section_meta.get_str("connection")];
    let Some(mut db) = connect(rt, book, conn_record, &candidates, Some(meta)).await else {
        return Err("no connection to load the configuration from".to_string());
    };

    let name = format!("{key}->{item_key}");
    let ctx = rt.sql_context(item, &[]).label(&name);
    let mut phases = Phases::new(&mut db, &ctx, book, &name, key).item(item_key);
    let column = meta.get_str("column").unwrap_or(DEFAULT_COLUMN);

    let mut loaded = Err("failed to get md conf string query".to_string());
    if phases.before(meta.get_set("before_sql"), &OnError::none()).await {
        let query = meta.get_str("query").unwrap_or_default();
        loaded = match phases.db().query_single_row(&ctx.resolve(query)).await {
            Ok(row) => match row.and_then(|r| r.get(column).and_then(|v| v.to_text())) {
                Some(text) => Config::from_markdown_fragment(&text, &name)
                    .map_err(|e| format!("Error parsing config: {name} -> {e}")),
                None => Err(format!("failed to get md conf string query: column {column}")),
            },
            Err(e) => Err(format!("failed to execute get md conf query: {e}")),
        };
    }
    phases.after(meta.get_set("after_sql"), &OnError::none()).await;
    drop(phases);
    close(db).await;
    loaded
}
