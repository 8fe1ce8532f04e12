//! `db_2_db` action: copy the rows of a source query into a target database.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use etlx_db::{Database, Row};
use regex::Regex;
use tracing::{debug, instrument};

use crate::config::{ConfigError, Node};
use crate::engine::lookup::SqlContext;
use crate::engine::phase::execute_node;
use crate::engine::Runtime;
use crate::Result;

const DEFAULT_CHUNK_SIZE: usize = 1_000;
const DEFAULT_TIMEOUT_SECS: u64 = 500;

static COLUMNS_REGEX: OnceLock<Regex> = OnceLock::new();

/// One side of the transfer.
struct Endpoint<'n> {
    conn: &'n str,
    sql: &'n str,
    before: Option<&'n Node>,
    after: Option<&'n Node>,
}

impl<'n> Endpoint<'n> {
    fn from_params(params: &'n Node, side: &str) -> Result<Self> {
        let node = params
            .get(side)
            .filter(|n| n.is_map())
            .ok_or_else(|| ConfigError::invalid(side, "db_2_db needs a source and a target map"))?;
        let conn = node
            .get_str("conn")
            .ok_or_else(|| ConfigError::invalid(side, format!("no {side} conn string detected")))?;
        let sql = node
            .get_str("sql")
            .ok_or_else(|| ConfigError::invalid(side, format!("no {side} sql detected")))?;
        Ok(Self {
            conn,
            sql,
            before: node.get_set("before"),
            after: node.get_set("after"),
        })
    }
}

/// Run the transfer, returning the number of rows written to the target.
#[instrument(skip_all, err)]
pub async fn transfer(rt: &Runtime<'_>, ctx: &SqlContext<'_>, params: &Node) -> Result<u64> {
    let source = Endpoint::from_params(params, "source")?;
    let target = Endpoint::from_params(params, "target")?;
    let source_meta = params.get("source");
    let chunk_size = source_meta
        .and_then(|s| s.get("chunk_size"))
        .and_then(Node::as_i64)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let timeout = source_meta
        .and_then(|s| s.get("timeout"))
        .and_then(Node::as_i64)
        .and_then(|n| u64::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    let mut source_db = open(rt, source.conn).await?;
    let mut target_db = match open(rt, target.conn).await {
        Ok(db) => db,
        Err(e) => {
            super::close(source_db).await;
            return Err(e);
        }
    };
    source_db.set_timeout(Duration::from_secs(timeout));

    let result = copy_rows(&mut source_db, &mut target_db, ctx, &source, &target, chunk_size).await;
    super::close(source_db).await;
    super::close(target_db).await;
    result
}

async fn open(rt: &Runtime<'_>, conn: &str) -> Result<Database> {
    let conn = rt
        .connection(&[Some(conn)])
        .ok_or_else(|| ConfigError::MissingConnection("db_2_db".to_string()))?;
    Ok(rt.open(&conn, None).await?)
}

async fn copy_rows(
    source_db: &mut Database,
    target_db: &mut Database,
    ctx: &SqlContext<'_>,
    source: &Endpoint<'_>,
    target: &Endpoint<'_>,
    chunk_size: usize,
) -> Result<u64> {
    let time = Instant::now();
    if let Some(before) = source.before {
        execute_node(source_db, ctx, before).await?;
    }
    let data = source_db.query_with_columns(&ctx.resolve(source.sql)).await?;

    if let Some(before) = target.before {
        execute_node(target_db, ctx, before).await?;
    }
    let header = ctx.resolve(target.sql);
    let mut written = 0;
    for chunk in data.rows.chunks(chunk_size) {
        let sql = insert_sql(&header, &data.columns, chunk);
        target_db.execute(&sql).await?;
        written += chunk.len() as u64;
    }

    if let Some(after) = source.after {
        execute_node(source_db, ctx, after).await?;
    }
    if let Some(after) = target.after {
        execute_node(target_db, ctx, after).await?;
    }
    debug!("Copied {written} rows. Elapsed time: {:.2?}", time.elapsed());
    Ok(written)
}

/// `header` with its `:columns` expanded, completed by the `VALUES` tuples of `rows`.
pub fn insert_sql(header: &str, columns: &[String], rows: &[Row]) -> String {
    let header = replace_columns(header, columns);
    let values = rows
        .iter()
        .map(|row| {
            let tuple: Vec<String> = columns
                .iter()
                .map(|c| row.get(c).map(|v| v.to_sql_literal()).unwrap_or_else(|| "NULL".into()))
                .collect();
            format!("({})", tuple.join(", "))
        })
        .collect::<Vec<_>>()
        .join(",\n");

    for token in ["<values>", "[[values]]"] {
        if header.contains(token) {
            return header.replace(token, &values);
        }
    }
    format!("{} {values};", header.trim_end().trim_end_matches(';'))
}

/// Expand `:columns`, quoting each column the way the token itself is quoted.
fn replace_columns(header: &str, columns: &[String]) -> String {
    let regex = COLUMNS_REGEX
        .get_or_init(|| Regex::new(r#"([\["`]?):columns\b([\]"`]?)"#).expect("invalid regex"));
    regex
        .replace_all(header, |caps: &regex::Captures<'_>| {
            let (open, close) = match &caps[1] {
                "[" => ("[", "]"),
                "\"" => ("\"", "\""),
                "`" => ("`", "`"),
                _ => ("", ""),
            };
            columns
                .iter()
                .map(|c| {
                    let c = if open == "[" { c.replace(']', "]]") } else { c.clone() };
                    format!("{open}{c}{close}")
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use etlx_db::Value;

    fn rows() -> (Vec<String>, Vec<Row>) {
        let columns = vec!["id".to_string(), "name".to_string()];
        let row = |id: i64, name: &str| {
            Row::from_iter([
                ("id".to_string(), Value::Int(id)),
                ("name".to_string(), Value::Text(name.to_string())),
            ])
        };
        (columns, vec![row(1, "a"), row(2, "o'b")])
    }

    #[test]
    fn quoted_columns_follow_the_token() {
        let (columns, rows) = rows();
        let sql = insert_sql(r#"INSERT INTO t (":columns") VALUES"#, &columns, &rows);
        assert_eq!(sql, "INSERT INTO t (\"id\", \"name\") VALUES (1, 'a'),\n(2, 'o''b');");

        let sql = insert_sql("INSERT INTO t ([:columns]) VALUES", &columns, &rows[..1]);
        assert_eq!(sql, "INSERT INTO t ([id], [name]) VALUES (1, 'a');");
    }

    #[test]
    fn values_token_is_replaced_in_place() {
        let (columns, rows) = rows();
        let sql = insert_sql(
            "INSERT INTO t (:columns) VALUES <values> ON CONFLICT DO NOTHING",
            &columns,
            &rows[..1],
        );
        assert_eq!(sql, "INSERT INTO t (id, name) VALUES (1, 'a') ON CONFLICT DO NOTHING");
    }
}
