//! `SCRIPTS` sections: arbitrary SQL run through the phase pattern.

use tracing::instrument;

use super::{active_section, close, connect, dated_file, description, item_record, section_path};
use crate::config::Node;
use crate::engine::log::LogBook;
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::Result;

#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<()> {
    let (section, meta) = active_section(rt, key)?;
    let main_path = section_path(rt, meta, &rt.options.dates)?;

    for (item_key, item, item_meta) in rt.items(key, section, book) {
        let item_run = ScriptItem {
            rt,
            key,
            section_meta: meta,
            main_path: main_path.as_deref(),
        };
        item_run.run(&item_key, item, item_meta, book).await;
    }
    Ok(())
}

struct ScriptItem<'r, 'a> {
    rt: &'r Runtime<'a>,
    key: &'r str,
    section_meta: &'a Node,
    main_path: Option<&'r std::path::Path>,
}

impl ScriptItem<'_, '_> {
    #[instrument(skip_all, fields(item = %item_key))]
    async fn run(&self, item_key: &str, item: &Node, meta: &Node, book: &mut LogBook) {
        let dates = self.rt.dates_for(Some(meta));
        let reference = Runtime::reference(&dates);
        let record = item_record(self.key, item_key, "", reference.clone())
            .description(description(meta));
        let failures = book.failures();

        let conn_record = item_record(self.key, item_key, "Conn", reference.clone());
        let candidates = [meta.get_str("connection"), self.section_meta.get_str("connection")];
        let Some(mut db) = connect(self.rt, book, conn_record, &candidates, Some(meta)).await else {
            book.push(record.failed("no connection"));
            return;
        };

        let fname = ["path", "fname", "file"]
            .iter()
            .find_map(|k| meta.get_str(k))
            .map(|p| Runtime::resolve_path(self.main_path, &self.rt.placeholders(&dates).apply(p)))
            .unwrap_or_else(|| dated_file(self.rt.tmp_dir, item_key, "csv", &dates))
            .display()
            .to_string();
        let name = format!("{}->{item_key}", self.key);
        let ctx = self
            .rt
            .sql_context(item, &dates)
            .table(meta.get_str("table"))
            .file(Some(&fname))
            .label(&name);

        let mut phases = Phases::new(&mut db, &ctx, book, &name, self.key)
            .item(item_key)
            .reference(reference);

        if phases.before(meta.get_set("before_sql"), &OnError::none()).await
            && phases
                .condition(meta.get_str("condition"), meta.get_str("condition_msg"))
                .await
        {
            if let Some(script) = meta.get_set("script_sql") {
                let on_err = OnError::from_metadata(meta, "on_err_patt", "on_err_sql", false);
                phases.main(script, &on_err).await;
            }
        }
        phases.after(meta.get_set("after_sql"), &OnError::none()).await;
        drop(phases);
        close(db).await;

        let mut record = if book.failures() > failures {
            record.failed("error: see the phase records")
        } else {
            record.ok("Success")
        };
        record.fname = Some(fname);
        book.push(record);
    }
}
