//! `EXPORTS` sections: files written from query results.
//!
//! An item produces its file in one of three ways: `export_sql` (the database
//! writes it, usually through `COPY ... TO '<fname>'`), `template` + `mapping`
//! (a spreadsheet template filled by the [`SpreadsheetWriter`]) or
//! `text_template: true` (a Jinja template rendered over `data_sql` results).
//!
//! [`SpreadsheetWriter`]: etlx_transport::SpreadsheetWriter

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use etlx_db::{Database, QueryResult, Value};
use etlx_transport::{ColumnFormula, SheetItem, SheetItemKind, SpreadsheetJob};
use indexmap::IndexMap;
use tracing::{debug, instrument};

use super::{active_section, close, connect, dated_file, description, item_record, section_path};
use crate::config::{ConfigError, Node};
use crate::engine::log::LogBook;
use crate::engine::lookup::SqlContext;
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::templating;
use crate::Result;

const SPREADSHEET_EXTENSIONS: [&str; 3] = ["xlsx", "xls", "xlsm"];

#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<()> {
    let (section, meta) = active_section(rt, key)?;
    let main_path = section_path(rt, meta, &rt.options.dates)?;

    for (item_key, item, item_meta) in rt.items(key, section, book) {
        let export = Export {
            rt,
            key,
            section_meta: meta,
            main_path: main_path.as_deref(),
            item_key: &item_key,
            item,
            meta: item_meta,
        };
        export.run(book).await;
    }
    Ok(())
}

struct Export<'r, 'a> {
    rt: &'r Runtime<'a>,
    key: &'r str,
    section_meta: &'a Node,
    main_path: Option<&'r Path>,
    item_key: &'r str,
    item: &'a Node,
    meta: &'a Node,
}

impl Export<'_, '_> {
    #[instrument(skip_all, fields(item = %self.item_key))]
    async fn run(&self, book: &mut LogBook) {
        let meta = self.meta;
        let dates = self.rt.dates_for(Some(meta));
        let reference = Runtime::reference(&dates);

        let conn_record = item_record(self.key, self.item_key, "Conn", reference.clone());
        let candidates = [meta.get_str("connection"), self.section_meta.get_str("connection")];
        let Some(mut db) = connect(self.rt, book, conn_record, &candidates, Some(meta)).await else {
            return;
        };

        let name = meta.get_str("name").unwrap_or(self.item_key);
        let fname = self.output_file(name, &dates).display().to_string();
        let label = format!("{}->{}", self.key, self.item_key);
        let ctx = self
            .rt
            .sql_context(self.item, &dates)
            .table(Some(name))
            .file(Some(&fname))
            .label(&label);
        let mut phases = Phases::new(&mut db, &ctx, book, &label, self.key)
            .item(self.item_key)
            .reference(reference);

        phases.before(meta.get_set("before_sql"), &OnError::none()).await;

        let record = phases.record("").description(description(meta));
        let outcome = if let Some(export) = meta.get_set("export_sql") {
            phases.main(export, &OnError::none()).await.map(|_| fname.clone()).ok_or(None)
        } else if meta.get_bool("text_template") == Some(true) {
            self.text_template(phases.db(), &ctx, &fname).await.map_err(Some)
        } else if let (Some(template), Some(mapping)) =
            (meta.get_str("template"), meta.get_set("mapping"))
        {
            self.spreadsheet(phases.db(), &ctx, template, mapping, &fname)
                .await
                .map_err(Some)
        } else {
            debug!("{label}: nothing to export");
            Err(None)
        };
        match outcome {
            Ok(file) => {
                let mut record = record.ok(label.clone());
                record.fname = Some(file);
                phases.book().push(record);
            }
            Err(Some(msg)) => phases.book().push(record.failed(format!("{label} -> {msg}"))),
            // `export_sql` already left its `:Main` record
            Err(None) => {}
        }

        phases.after(meta.get_set("after_sql"), &OnError::none()).await;
        drop(phases);
        close(db).await;
    }

    /// Item `path`, else `<section path or tmp>/<name>_YYYYMMDD.<ext>`.
    fn output_file(&self, name: &str, dates: &[NaiveDateTime]) -> PathBuf {
        if let Some(path) = self.meta.get_str("path").filter(|p| !p.trim().is_empty()) {
            let path = self.rt.placeholders(dates).apply(path);
            return Runtime::resolve_path(self.main_path, &path);
        }
        let ext = self
            .meta
            .get_str("template")
            .filter(|_| self.meta.get_bool("text_template") != Some(true))
            .and_then(|t| Path::new(t).extension())
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "csv".to_string());
        dated_file(self.main_path.unwrap_or(self.rt.tmp_dir), name, &ext, dates)
    }

    async fn spreadsheet(
        &self,
        db: &mut Database,
        ctx: &SqlContext<'_>,
        template: &str,
        mapping: &Node,
        fname: &str,
    ) -> std::result::Result<String, String> {
        let template = Runtime::resolve_path(self.main_path, &ctx.render(template));
        let ext = template
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            return Err(format!("unsupported template file extension: {ext}"));
        }
        if !template.is_file() {
            return Err(format!("template doesn't exists: {}", template.display()));
        }

        let entries = mapping_entries(db, ctx, mapping)
            .await
            .map_err(|e| format!("failed to execute map query: {e}"))?;
        if entries.is_empty() {
            return Err("invalid mapping length Zero".to_string());
        }

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| e.is_active()) {
            let mut item = sheet_item(entry);
            if let Some(sql) = entry.get_str("sql").filter(|s| !s.trim().is_empty()) {
                item.data = db
                    .query_with_columns(&ctx.resolve(sql))
                    .await
                    .map_err(|e| format!("{} -> failed to execute query: {e}", item.sheet))?;
            }
            if item.kind == SheetItemKind::Value {
                item.data = single_column(item.data, entry.get_str("key").unwrap_or("value"));
            }
            items.push(item);
        }

        let job = SpreadsheetJob {
            template,
            output: PathBuf::from(fname),
            items,
        };
        self.rt
            .transports
            .spreadsheet
            .write(&job)
            .await
            .map_err(|e| format!("failed to save file: {e}"))?;
        Ok(fname.to_string())
    }

    async fn text_template(
        &self,
        db: &mut Database,
        ctx: &SqlContext<'_>,
        fname: &str,
    ) -> std::result::Result<String, String> {
        let source = self
            .meta
            .get_str("template")
            .ok_or_else(|| ConfigError::invalid(self.item_key, "text_template needs a template").to_string())?;
        let text = match self.item.get_str(source) {
            Some(text) => text.to_string(),
            None => {
                let path = Runtime::resolve_path(self.main_path, &ctx.render(source));
                templating::load(&path.to_string_lossy()).map_err(|e| e.to_string())?
            }
        };

        let mut data = IndexMap::new();
        for (name, sql) in data_queries(self.item, self.meta.get_set("data_sql")) {
            let rows = db
                .query_rows(&ctx.resolve(sql))
                .await
                .map_err(|e| format!("{name} -> failed to execute query: {e}"))?;
            data.insert(name, rows);
        }

        let rendered = templating::render(self.item_key, &text, &data, false).map_err(|e| e.to_string())?;
        std::fs::write(fname, rendered).map_err(|e| format!("failed to save file: {e}"))?;
        Ok(fname.to_string())
    }
}

/// `data_sql` entries keyed by the item key they name, by position when inline.
pub(crate) fn data_queries<'n>(item: &'n Node, data_sql: Option<&'n Node>) -> Vec<(String, &'n str)> {
    let entries: Vec<&str> = match data_sql {
        Some(Node::List(list)) => list.iter().filter_map(Node::as_str).collect(),
        Some(node) => node.as_str().into_iter().collect(),
        None => Vec::new(),
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            if item.get_str(entry).is_some() {
                (entry.to_string(), entry)
            } else {
                (i.to_string(), entry)
            }
        })
        .collect()
}

/// Mapping given inline as a list, or as a query whose rows are the entries.
async fn mapping_entries(db: &mut Database, ctx: &SqlContext<'_>, mapping: &Node) -> Result<Vec<Node>> {
    match mapping {
        Node::List(entries) => Ok(entries.iter().filter(|e| e.is_map()).cloned().collect()),
        Node::String(sql) => {
            let rows = db.query_rows(&ctx.resolve(sql)).await?;
            rows.iter()
                .map(|row| Ok(Node::from(serde_json::to_value(row)?)))
                .collect()
        }
        other => Err(ConfigError::invalid("mapping", format!("invalid mapping data type: {other}")).into()),
    }
}

fn sheet_item(entry: &Node) -> SheetItem {
    let text = |key: &str| entry.get_str(key).filter(|v| !v.is_empty()).map(str::to_string);
    let formulas = entry
        .get("formulas")
        .and_then(Node::as_list)
        .unwrap_or_default()
        .iter()
        .filter(|f| f.is_active())
        .filter_map(|f| {
            Some(ColumnFormula {
                column: f.get_str("column")?.to_string(),
                formula: f.get_str("formula")?.to_string(),
            })
        })
        .collect();

    SheetItem {
        sheet: text("sheet").unwrap_or_else(|| "Sheet1".to_string()),
        table: text("table"),
        range: text("range").unwrap_or_else(|| "A1".to_string()),
        kind: SheetItemKind::parse(entry.get_str("type").unwrap_or("table")),
        header: entry.get_bool("header").unwrap_or_default(),
        if_exists: text("if_exists"),
        table_style: text("table_style"),
        formula: text("formula"),
        formulas,
        data: QueryResult::default(),
    }
}

/// Keep only `column` of the first row; a value cell takes a single value.
fn single_column(data: QueryResult, column: &str) -> QueryResult {
    let row = data.rows.into_iter().next().map(|mut row| {
        let value = row.shift_remove(column).unwrap_or(Value::Null);
        etlx_db::Row::from_iter([(column.to_string(), value)])
    });
    QueryResult::new(vec![column.to_string()], row.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const DOC: &str = r#"# EXPORTS

## report

```yaml
template: report.xlsx
data_sql:
  - totals
  - SELECT 1 AS one
mapping:
  - sheet: Summary
    range: B2
    type: value
    key: total
  - sheet: Detail
    type: table
    table: detail
    header: true
    formulas:
      - column: C
        formula: "=A2*B2"
      - column: D
        formula: "=1"
        active: false
```

```sql totals
SELECT SUM(x) AS total FROM t
```
"#;

    fn item(config: &Config) -> &Node {
        config.section("EXPORTS").unwrap().get("report").unwrap()
    }

    #[test]
    fn mapping_entries_become_sheet_items() {
        let config = Config::from_markdown_fragment(DOC, "exports.md").unwrap();
        let mapping = item(&config).metadata().unwrap().get("mapping").unwrap();
        let entries = mapping.as_list().unwrap();

        let value = sheet_item(&entries[0]);
        assert_eq!(value.kind, SheetItemKind::Value);
        assert_eq!(value.range, "B2");

        let table = sheet_item(&entries[1]);
        assert_eq!(table.kind, SheetItemKind::Table);
        assert_eq!(table.table.as_deref(), Some("detail"));
        assert!(table.header);
        assert_eq!(table.formulas.len(), 1);
        assert_eq!(table.formulas[0].column, "C");
    }

    #[test]
    fn data_is_keyed_by_item_key_or_position() {
        let config = Config::from_markdown_fragment(DOC, "exports.md").unwrap();
        let item = item(&config);
        let queries = data_queries(item, item.metadata().unwrap().get_set("data_sql"));
        let keys: Vec<&str> = queries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["totals", "1"]);
    }

    #[test]
    fn value_cells_keep_one_column() {
        let row = etlx_db::Row::from_iter([
            ("total".to_string(), Value::Int(7)),
            ("other".to_string(), Value::Int(1)),
        ]);
        let data = QueryResult::new(vec!["total".into(), "other".into()], vec![row]);
        let data = single_column(data, "total");
        assert_eq!(data.columns, ["total"]);
        assert_eq!(data.first_value("total"), Some(&Value::Int(7)));
    }
}
