//! `DATA_QUALITY` sections: each item counts violations and may fix them.

use etlx_db::Value;
use tracing::{debug, instrument};

use super::{active_section, close, connect, description, item_record};
use crate::config::Node;
use crate::engine::log::LogBook;
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::Result;

const DEFAULT_COLUMN: &str = "total";

#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<()> {
    let (section, meta) = active_section(rt, key)?;

    for (item_key, item, item_meta) in rt.items(key, section, book) {
        run_item(rt, key, meta, &item_key, item, item_meta, book).await;
    }
    Ok(())
}

#[instrument(skip_all, fields(item = %item_key))]
async fn run_item(
    rt: &Runtime<'_>,
    key: &str,
    section_meta: &Node,
    item_key: &str,
    item: &Node,
    meta: &Node,
    book: &mut LogBook,
) {
    let dates = rt.dates_for(Some(meta));
    let reference = Runtime::reference(&dates);

    let Some(query) = meta.get_str("query") else {
        book.push(
            item_record(key, item_key, "", reference).failed("missing query in item metadata"),
        );
        return;
    };

    let conn_record = item_record(key, item_key, "Conn", reference.clone());
    let candidates = [meta.get_str("connection"), section_meta.get_str("connection")];
    let Some(mut db) = connect(rt, book, conn_record, &candidates, Some(meta)).await else {
        return;
    };

    let table = meta.get_str("table");
    let name = format!("{key}->{item_key}");
    let ctx = rt.sql_context(item, &dates).table(table).label(&name);
    let column = meta.get_str("column").unwrap_or(DEFAULT_COLUMN);
    let check_only = meta.get_bool("check_only") == Some(true);
    let fix_only = meta.get_bool("fix_only") == Some(true);

    let mut phases = Phases::new(&mut db, &ctx, book, &name, key)
        .item(item_key)
        .reference(reference.clone());

    if phases.before(meta.get_set("before_sql"), &OnError::none()).await {
        let violations = if fix_only {
            None
        } else {
            let record = phases.record("").description(description(meta));
            let sql = ctx.resolve(query);
            match phases.db().query_single_row(&sql).await {
                Ok(row) => {
                    let count = row
                        .as_ref()
                        .and_then(|r| r.get(column))
                        .and_then(Value::as_i64)
                        .unwrap_or_default();
                    let mut record = record.ok(format!("CHECK: successful, {count} rows"));
                    record.rows = Some(count);
                    phases.book().push(record);
                    Some(count)
                }
                Err(e) => {
                    phases.book().push(record.failed(format!("CHECK: {e}")));
                    None
                }
            }
        };

        let needs_fix = fix_only || violations.is_some_and(|n| n > 0);
        match meta.get_str("fix_quality_err") {
            Some(fix) if needs_fix && !check_only => {
                let record = phases.record("Fix");
                let sql = ctx.resolve(fix);
                match phases.db().execute_rows_affected(&sql).await {
                    Ok(fixed) => {
                        let mut record = record.ok("FIX: successful");
                        record.rows_fixed = Some(fixed);
                        record.rows = violations;
                        phases.book().push(record);
                    }
                    Err(e) => phases.book().push(record.failed(format!("FIX: {e}"))),
                }
            }
            _ => debug!("{name}: nothing to fix"),
        }
    }

    phases.after(meta.get_set("after_sql"), &OnError::none()).await;
    drop(phases);
    close(db).await;
}
