//! Resolution of SQL references and `[[name]]` inclusions.
//!
//! A name resolves, in order, to an extra value bound by the runner, a string
//! sibling of the current item (or of its metadata), the query document built
//! from the top-level section `name`, and the raw top-level string `name`.

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{Config, Node};
use crate::placeholders::Placeholders;
use crate::query_doc::QueryDoc;

static INCLUDE_REGEX: OnceLock<Regex> = OnceLock::new();

/// Look `name` up without falling back to the literal.
pub fn resolve_reference(
    config: &Config,
    scope: &Node,
    extras: &IndexMap<String, String>,
    name: &str,
) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }

    if let Some(value) = extras.get(name) {
        return Some(value.clone());
    }
    if let Some(value) = scope
        .get_str(name)
        .or_else(|| scope.metadata().and_then(|m| m.get_str(name)))
    {
        return Some(value.to_string());
    }

    match config.get(name)? {
        node @ Node::Map(_) => QueryDoc::from_section(name, node)
            .ok()
            .map(|doc| doc.build())
            .filter(|sql| !sql.is_empty()),
        Node::String(sql) => Some(sql.clone()),
        _ => None,
    }
}

/// Replace every `[[name]]` that resolves; unknown names stay as written.
pub fn include_queries(
    config: &Config,
    scope: &Node,
    extras: &IndexMap<String, String>,
    sql: &str,
) -> String {
    if !sql.contains("[[") {
        return sql.to_string();
    }
    let regex = INCLUDE_REGEX.get_or_init(|| Regex::new(r"\[\[(\w+)\]\]").expect("invalid regex"));

    regex
        .replace_all(sql, |caps: &regex::Captures<'_>| {
            resolve_reference(config, scope, extras, &caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Everything needed to turn a SQL reference of one item into executable text.
#[derive(Debug, Clone)]
pub struct SqlContext<'a> {
    config: &'a Config,
    scope: &'a Node,
    extras: IndexMap<String, String>,
    placeholders: Placeholders<'a>,
    debug_dir: Option<&'a Path>,
    label: String,
}

impl<'a> SqlContext<'a> {
    pub fn new(config: &'a Config, scope: &'a Node, placeholders: Placeholders<'a>) -> Self {
        Self {
            config,
            scope,
            extras: IndexMap::new(),
            placeholders,
            debug_dir: None,
            label: "sql".to_string(),
        }
    }

    /// Dump every resolved statement into `dir`.
    pub fn debug_into(mut self, dir: Option<&'a Path>) -> Self {
        self.debug_dir = dir;
        self
    }

    /// Name used for debug dumps
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn table(mut self, table: Option<&'a str>) -> Self {
        self.placeholders = self.placeholders.table(table);
        self
    }

    pub fn file(mut self, file: Option<&'a str>) -> Self {
        self.placeholders = self.placeholders.file(file);
        self
    }

    /// Bind `name` for lookups ahead of the item siblings.
    pub fn extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(name.into(), value.into());
        self
    }

    pub fn config(&self) -> &'a Config {
        self.config
    }

    pub fn scope(&self) -> &'a Node {
        self.scope
    }

    pub fn dates(&self) -> &'a [NaiveDateTime] {
        self.placeholders.dates()
    }

    /// Reference or literal SQL, with inclusions and placeholders applied.
    pub fn resolve(&self, text: &str) -> String {
        let base = resolve_reference(self.config, self.scope, &self.extras, text)
            .unwrap_or_else(|| text.to_string());
        let included = include_queries(self.config, self.scope, &self.extras, &base);
        let sql = self.placeholders.apply(&included);
        self.dump(&sql);
        sql
    }

    /// A name only when it resolves to something.
    pub fn lookup(&self, name: &str) -> Option<String> {
        resolve_reference(self.config, self.scope, &self.extras, name)
    }

    /// Placeholders only, for paths, subjects and other plain text.
    pub fn render(&self, text: &str) -> String {
        self.placeholders.apply(text)
    }

    fn dump(&self, sql: &str) {
        let Some(dir) = self.debug_dir else {
            return;
        };
        let prefix = format!("query.{}.", self.label.replace(['/', '\\', ' '], "_"));
        let written = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".sql")
            .tempfile_in(dir)
            .and_then(|mut file| {
                file.write_all(sql.as_bytes())?;
                file.keep().map_err(|e| e.error)
            });
        match written {
            Ok((_, path)) => debug!("Query {} written to {}", self.label, path.display()),
            Err(e) => warn!("Could not write debug query {}: {e}", self.label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;

    fn config() -> Config {
        Config::from_markdown_fragment(
            "# ETL\n\n## sales\n\n```yaml\ntable: sales\nq2: SELECT 2\n```\n\n```sql q1\nSELECT 1\n```\n\n# SHARED\n\n## id\n\n```sql select\nSELECT id\n```\n\n```sql from\n FROM t\n```\n",
            "lookup.md",
        )
        .unwrap()
    }

    #[test]
    fn item_siblings_come_first() {
        let config = config();
        let item = config.section("ETL").unwrap().get("sales").unwrap();
        let extras = IndexMap::new();

        assert_eq!(include_queries(&config, item, &extras, "[[q1]]"), "SELECT 1\n");
        assert_eq!(include_queries(&config, item, &extras, "[[q2]]"), "SELECT 2");
        assert_eq!(
            include_queries(&config, item, &extras, "WITH s AS ([[SHARED]]) SELECT * FROM s"),
            "WITH s AS (SELECT id\n FROM t\n) SELECT * FROM s"
        );
        assert_eq!(include_queries(&config, item, &extras, "[[nope]]"), "[[nope]]");
    }

    #[test]
    fn literals_are_not_looked_up() {
        let config = config();
        let item = config.section("ETL").unwrap().get("sales").unwrap();
        assert_eq!(resolve_reference(&config, item, &IndexMap::new(), "SELECT 1 AS q1"), None);
    }

    #[test]
    fn context_resolves_then_substitutes() {
        let config = config();
        let item = config.section("ETL").unwrap().get("sales").unwrap();
        let env = MapEnv::new();
        let ctx = SqlContext::new(&config, item, Placeholders::new(&env, &[]))
            .table(Some("sales"))
            .extra("query", "SELECT * FROM <table>");

        assert_eq!(ctx.resolve("query"), "SELECT * FROM sales");
        assert_eq!(ctx.resolve("INSERT INTO x [[q2]]"), "INSERT INTO x SELECT 2");
    }

    #[test]
    fn debug_dumps_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let env = MapEnv::new();
        let ctx = SqlContext::new(&config, config.root(), Placeholders::new(&env, &[]))
            .debug_into(Some(dir.path()))
            .label("ETL->sales");

        ctx.resolve("SELECT 42");

        let dumped: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(dumped.len(), 1);
    }
}
