//! `MULTI_QUERIES` sections: item queries joined into one statement.

use etlx_db::Row;
use tracing::{debug, instrument};

use super::{active_section, close, connect};
use crate::config::{ConfigError, Node};
use crate::engine::log::{LogBook, LogRecord};
use crate::engine::phase::{OnError, Phases};
use crate::engine::Runtime;
use crate::Result;

const DEFAULT_UNION: &str = "UNION\n";

/// Run the joined query; its rows are returned unless `save_sql` consumes them.
#[instrument(skip_all, fields(key = %key))]
pub async fn run(rt: &Runtime<'_>, key: &str, book: &mut LogBook) -> Result<Vec<Row>> {
    let (section, meta) = active_section(rt, key)?;
    let dates = rt.dates_for(Some(meta));
    let reference = Runtime::reference(&dates);

    let queries = item_queries(rt, key, section, &dates);
    if queries.is_empty() {
        debug!("{key}: no item query to run");
        return Ok(Vec::new());
    }
    let union = meta.get_str("union_key").unwrap_or(DEFAULT_UNION);
    let joined = queries.join(union);

    let Some(conn) = rt.connection(&[meta.get_str("connection")]) else {
        return Err(ConfigError::MissingConnection(key.to_string()).into());
    };
    let record = LogRecord::start(format!("{key}:Conn"), key).reference(reference.clone());
    let Some(mut db) = connect(rt, book, record, &[Some(conn.as_str())], Some(meta)).await else {
        return Ok(Vec::new());
    };

    let ctx = rt
        .sql_context(section, &dates)
        .extra("query", joined.clone())
        .label(key);
    let mut phases = Phases::new(&mut db, &ctx, book, key, key).reference(reference);
    let mut rows = Vec::new();

    if phases.before(meta.get_set("before_sql"), &OnError::none()).await {
        if let Some(save) = meta.get_set("save_sql") {
            let on_err = OnError::from_metadata(meta, "save_on_err_patt", "save_on_err_sql", true);
            phases.main(save, &on_err).await;
        } else {
            let record = phases.record("Main");
            match phases.db().query_rows(&joined).await {
                Ok(result) => {
                    let mut record = record.ok(format!("{} queries, {} rows", queries.len(), result.len()));
                    record.rows = i64::try_from(result.len()).ok();
                    phases.book().push(record);
                    rows = result;
                }
                Err(e) => phases.book().push(record.failed(e.to_string())),
            }
        }
    }

    phases.after(meta.get_set("after_sql"), &OnError::none()).await;
    drop(phases);
    close(db).await;
    Ok(rows)
}

/// The resolved `query` of every active, selected item in order.
fn item_queries(rt: &Runtime<'_>, key: &str, section: &Node, dates: &[chrono::NaiveDateTime]) -> Vec<String> {
    section
        .children()
        .into_iter()
        .filter(|(item_key, _)| rt.selected(item_key))
        .filter_map(|(item_key, item)| {
            let meta = item.metadata().filter(|m| m.is_active())?;
            let Some(query) = meta.get_str("query") else {
                debug!("{key}->{item_key}: no query");
                return None;
            };
            let ctx = rt.sql_context(item, dates).label(format!("{key}->{item_key}"));
            Some(ctx.resolve(query).trim_end().to_string() + "\n")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::RunOptions;
    use crate::env::MapEnv;
    use etlx_db::DriverRegistry;
    use etlx_transport::Transports;
    use std::path::Path;

    const DOC: &str = r#"# MULTI_QUERIES

```yaml
connection: "duckdb:"
union_key: "UNION ALL\n"
```

## north

```yaml
query: north_sql
```

```sql north_sql
SELECT 'north' AS region
```

## south

```yaml
query: SHARED_DOC
```

## west

```yaml
query: west_sql
active: false
```

# SHARED_DOC

## region

```yaml
select: "'south' AS region"
```
"#;

    #[test]
    fn item_queries_follow_document_order() {
        let config = Config::from_markdown_fragment(DOC, "multi.md").unwrap();
        let registry = DriverRegistry::new();
        let env = MapEnv::new();
        let transports = Transports::unsupported();
        let options = RunOptions::default();
        let rt = Runtime {
            config: &config,
            registry: &registry,
            env: &env,
            transports: &transports,
            tmp_dir: Path::new("/tmp"),
            options: &options,
        };
        let section = config.section("MULTI_QUERIES").unwrap();

        let queries = item_queries(&rt, "MULTI_QUERIES", section, &[]);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0], "SELECT 'north' AS region\n");
        assert!(queries[1].contains("'south' AS region"), "{}", queries[1]);
    }
}
