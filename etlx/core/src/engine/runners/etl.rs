//! `ETL` sections: every item runs the `extract`, `transform` and `load` steps.
//!
//! A step is driven by the `{step}_*` keys of the item metadata:
//!
//! | key | use |
//! |---|---|
//! | `{step}_conn` | connection, else the section `connection` |
//! | `{step}_before_sql` / `{step}_after_sql` | around the main SQL |
//! | `{step}_condition` / `{step}_condition_msg` | gate, first column must be true |
//! | `{step}_validation` | rules `{sql, type, msg, active}` |
//! | `{step}_sql` | the main SQL |
//! | `{step}_from_file` | file extension to main SQL, `others` as fallback |
//! | `{step}_*on_err_match_patt` / `_sql` | recovery of a failing phase |
//!
//! With `to_csv` (or `odbc_to_csv`) set, the extract step writes its last
//! statement to a dated CSV in the tmp dir whatever the extract driver is. The
//! load step then reads it back through `<fname>`.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, instrument};

use super::{active_section, close, connect, dated_file, description, item_record};
use crate::config::Node;
use crate::engine::log::{LogBook, LogRecord};
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::Result;

/// Steps in execution order
pub const STEPS: [&str; 3] = ["extract", "transform", "load"];

const DEFAULT_CLEAN_SQL: &str = r#"DELETE FROM "<table>""#;
const DEFAULT_DROP_SQL: &str = r#"DROP TABLE "<table>""#;
const DEFAULT_ROWS_SQL: &str = r#"SELECT COUNT(*) AS "nrows" FROM "<table>""#;
const ROW_COLUMNS: [&str; 3] = ["nrows", "rows", "total"];

#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<()> {
    let (section, meta) = active_section(rt, key)?;

    for (item_key, item, item_meta) in rt.items(key, section, book) {
        let item_run = ItemRun {
            rt,
            key,
            section_meta: meta,
            item_key: &item_key,
            item,
            meta: item_meta,
        };
        item_run.run(book).await;
    }
    Ok(())
}

struct ItemRun<'r, 'a> {
    rt: &'r Runtime<'a>,
    key: &'r str,
    section_meta: &'a Node,
    item_key: &'r str,
    item: &'a Node,
    meta: &'a Node,
}

impl ItemRun<'_, '_> {
    #[instrument(skip_all, fields(item = %self.item_key))]
    async fn run(&self, book: &mut LogBook) {
        let dates = self.rt.dates_for(Some(self.meta));
        let reference = Runtime::reference(&dates);
        let record = item_record(self.key, self.item_key, "", reference.clone())
            .description(description(self.meta));
        let failures = book.failures();

        let input = match self.input_file(&dates) {
            Ok(input) => input,
            Err(e) => {
                book.push(record.failed(format!("input file: {e}")));
                return;
            }
        };
        let load_only = self.rt.options.maintenance() || input.is_some();
        let table = self.meta.get_str("table").unwrap_or(self.item_key).to_string();
        let fname = input
            .clone()
            .unwrap_or_else(|| dated_file(self.rt.tmp_dir, &table, "csv", &dates))
            .display()
            .to_string();

        for step in STEPS {
            if load_only && step != "load" {
                continue;
            }
            let steps = &self.rt.options.steps;
            if !steps.is_empty() && !steps.iter().any(|s| s == step) {
                debug!("STEP {step} Excluded from the process");
                let name = format!("{}->{}->{step}", self.key, self.item_key);
                book.push(
                    LogRecord::start(name, self.key)
                        .item(self.item_key)
                        .reference(reference.clone())
                        .ok(format!("STEP {step} Excluded from the process")),
                );
                continue;
            }
            let Some(main) = main_cell(self.meta, step, input.as_deref()) else {
                continue;
            };
            self.run_step(step, main, &table, &fname, &dates, reference.clone(), book)
                .await;
        }

        let mut record = if book.failures() > failures {
            record.failed("finished with errors")
        } else {
            record.ok("successful")
        };
        record.fname = Some(fname);
        book.push(record);
    }

    /// The item `file` (or the run `file`), relocated into the tmp dir with `tmp: true`.
    fn input_file(&self, dates: &[NaiveDateTime]) -> Result<Option<PathBuf>> {
        let Some(file) = self
            .meta
            .get_str("file")
            .or(self.rt.options.file.as_deref())
            .filter(|f| !f.trim().is_empty())
        else {
            return Ok(None);
        };
        let path = PathBuf::from(self.rt.placeholders(dates).apply(file));
        if self.meta.get_bool("tmp") != Some(true) {
            return Ok(Some(path));
        }

        let Some(name) = path.file_name() else {
            return Ok(Some(path));
        };
        let target = self.rt.tmp_dir.join(name);
        etlx_transport::local::copy_file(&path, &target)?;
        debug!("Copied {} into {}", path.display(), target.display());
        Ok(Some(target))
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(step = %step))]
    async fn run_step(
        &self,
        step: &str,
        main: &Node,
        table: &str,
        fname: &str,
        dates: &[NaiveDateTime],
        reference: Option<String>,
        book: &mut LogBook,
    ) {
        let key = |suffix: &str| format!("{step}_{suffix}");
        let name = format!("{}->{}->{step}", self.key, self.item_key);
        let failures = book.failures();
        let record = LogRecord::start(&name, self.key)
            .item(self.item_key)
            .reference(reference.clone());

        let conn_record = LogRecord::start(format!("{name}:Conn"), self.key)
            .item(self.item_key)
            .reference(reference.clone());
        let candidates = [
            self.meta.get_str(&key("conn")),
            self.section_meta.get_str("connection"),
        ];
        let Some(mut db) = connect(self.rt, book, conn_record, &candidates, Some(self.meta)).await
        else {
            book.push(record.failed("no connection"));
            return;
        };

        let ctx = self
            .rt
            .sql_context(self.item, dates)
            .table(Some(table))
            .file(Some(fname))
            .label(&name);
        let options = self.rt.options;
        let meta = self.meta;
        let mut phases = Phases::new(&mut db, &ctx, book, &name, self.key)
            .item(self.item_key)
            .reference(reference);

        let before = OnError::from_metadata(
            meta,
            &key("before_on_err_match_patt"),
            &key("before_on_err_match_sql"),
            true,
        );
        let before_ok = phases.before(meta.get_set(&key("before_sql")), &before).await;

        if before_ok && options.maintenance() {
            if options.clean {
                let sql = meta.get_str("clean_sql").unwrap_or(DEFAULT_CLEAN_SQL);
                phases.statement("CLEAN", sql).await;
            }
            if options.drop {
                let sql = meta.get_str("drop_sql").unwrap_or(DEFAULT_DROP_SQL);
                phases.statement("DROP", sql).await;
            }
            if options.rows {
                let sql = meta.get_str("rows_sql").unwrap_or(DEFAULT_ROWS_SQL);
                phases.count("ROWS", sql, &ROW_COLUMNS).await;
            }
        } else if before_ok {
            let passed = phases
                .condition(
                    meta.get_str(&key("condition")),
                    meta.get_str(&key("condition_msg")),
                )
                .await
                && phases.validate(meta.get_set(&key("validation"))).await;

            if passed {
                let to_csv = step == "extract"
                    && (meta.get_bool("to_csv") == Some(true)
                        || meta.get_bool("odbc_to_csv") == Some(true));
                if to_csv {
                    phases.main_to_csv(main, Path::new(fname)).await;
                } else {
                    let on_err = OnError::from_metadata(
                        meta,
                        &key("on_err_match_patt"),
                        &key("on_err_match_sql"),
                        false,
                    );
                    phases.main(main, &on_err).await;
                }
            }
        }

        let after = OnError::from_metadata(
            meta,
            &key("after_on_err_match_patt"),
            &key("after_on_err_match_sql"),
            true,
        );
        phases.after(meta.get_set(&key("after_sql")), &after).await;
        drop(phases);
        close(db).await;

        book.push(if book.failures() > failures {
            record.failed("finished with errors")
        } else {
            record.ok("successful")
        });
    }
}

/// The main SQL of a step; with an input file, the SQL for its extension first.
fn main_cell<'n>(meta: &'n Node, step: &str, file: Option<&Path>) -> Option<&'n Node> {
    let main = meta.get_set(&format!("{step}_sql"));
    let Some(file) = file else {
        return main;
    };
    let ext = file
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    meta.get(&format!("{step}_from_file"))
        .and_then(|by_ext| by_ext.get_set(&ext).or_else(|| by_ext.get_set("others")))
        .or(main)
}
