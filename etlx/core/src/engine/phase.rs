//! The phase pattern shared by every runner.
//!
//! An item runs `BEFORE`, then the gates (condition and validation rules), `MAIN`
//! and `AFTER`. Each phase executes a SQL cell: a string, or a list mixing strings
//! and dynamic queries. A failing phase may be recovered through its [`OnError`]
//! policy. Every phase leaves one [`LogRecord`] in the [`LogBook`].

use std::path::Path;
use std::time::Instant;

use etlx_db::{Database, Value};
use regex::Regex;
use tracing::{debug, warn};

use super::log::{LogBook, LogRecord};
use super::lookup::SqlContext;
use crate::config::{DynamicQuery, Node};
use crate::Result;

/// One statement of a SQL cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SqlEntry<'n> {
    Sql(&'n str),
    Dynamic(&'n DynamicQuery),
}

/// The statements of a cell in authored order. Anything else yields nothing.
pub fn entries(node: &Node) -> Vec<SqlEntry<'_>> {
    match node {
        Node::String(sql) => vec![SqlEntry::Sql(sql)],
        Node::Dynamic(dq) => vec![SqlEntry::Dynamic(dq)],
        Node::List(items) => items
            .iter()
            .filter_map(|item| match item {
                Node::String(sql) => Some(SqlEntry::Sql(sql.as_str())),
                Node::Dynamic(dq) => Some(SqlEntry::Dynamic(dq)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Run a dynamic query and collect its `query` column.
///
/// A failing `before` statement or fetch is logged as a warning and yields no
/// statements, so the enclosing phase carries on with the rest of its cell. A
/// failing `after` statement is logged and the fetched statements are kept.
pub async fn expand_dynamic(
    db: &mut Database,
    ctx: &SqlContext<'_>,
    dq: &DynamicQuery,
) -> Vec<String> {
    if let Some(before) = &dq.before {
        if let Err(e) = db.execute(&ctx.resolve(before)).await {
            warn!("{dq}: before statement failed: {e}");
            return Vec::new();
        }
    }

    let statements = match db.query_rows(&ctx.resolve(&dq.name)).await {
        Ok(rows) => rows
            .iter()
            .filter_map(|row| row.get("query").and_then(Value::to_text))
            .filter(|sql| !sql.trim().is_empty())
            .collect(),
        Err(e) => {
            warn!("{dq}: failed to fetch the queries: {e}");
            Vec::new()
        }
    };

    if let Some(after) = &dq.after {
        if let Err(e) = db.execute(&ctx.resolve(after)).await {
            warn!("{dq}: after statement failed: {e}");
        }
    }

    debug!("{dq} expanded into {} statements", statements.len());
    statements
}

/// Execute every statement of a cell, returning the summed affected rows.
pub async fn execute_node(db: &mut Database, ctx: &SqlContext<'_>, node: &Node) -> Result<u64> {
    let mut affected = 0;
    for entry in entries(node) {
        match entry {
            SqlEntry::Sql(sql) => {
                affected += db.execute_rows_affected(&ctx.resolve(sql)).await?;
            }
            SqlEntry::Dynamic(dq) => {
                for sql in expand_dynamic(db, ctx, dq).await {
                    affected += db.execute_rows_affected(&sql).await?;
                }
            }
        }
    }
    Ok(affected)
}

/// Recovery policy of a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OnError<'n> {
    /// Regular expression matched against the error text
    pub pattern: Option<&'n str>,
    /// SQL cell executed when the pattern matches
    pub recovery: Option<&'n Node>,
    /// Run the failed cell again after a successful recovery
    pub retry_main: bool,
}

impl<'n> OnError<'n> {
    /// Read the policy from `pattern_key` / `sql_key` of a metadata map.
    pub fn from_metadata(meta: &'n Node, pattern_key: &str, sql_key: &str, retry_main: bool) -> Self {
        Self {
            pattern: meta.get_str(pattern_key).filter(|p| !p.is_empty()),
            recovery: meta.get_set(sql_key),
            retry_main,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    fn matches(&self, error: &str) -> Result<bool> {
        match (self.pattern, self.recovery) {
            (Some(pattern), Some(_)) => Ok(Regex::new(pattern)?.is_match(error)),
            _ => Ok(false),
        }
    }
}

/// Result of a phase that did not fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub rows: u64,
    pub recovered: bool,
}

/// Execute a cell, consulting `on_err` when it fails.
pub async fn run_with_fallback(
    db: &mut Database,
    ctx: &SqlContext<'_>,
    node: &Node,
    on_err: &OnError<'_>,
) -> Result<PhaseOutcome> {
    let error = match execute_node(db, ctx, node).await {
        Ok(rows) => {
            return Ok(PhaseOutcome {
                rows,
                recovered: false,
            })
        }
        Err(e) => e,
    };

    let matched = on_err.matches(&error.to_string()).unwrap_or_else(|e| {
        warn!("{e}");
        false
    });
    let (true, Some(recovery)) = (matched, on_err.recovery) else {
        return Err(error);
    };

    debug!("Error matched the recovery pattern: {error}");
    execute_node(db, ctx, recovery).await?;

    let rows = if on_err.retry_main {
        execute_node(db, ctx, node).await?
    } else {
        0
    };
    Ok(PhaseOutcome {
        rows,
        recovered: true,
    })
}

/// `true` when the first column of the first row is truthy.
pub async fn check_condition(db: &mut Database, ctx: &SqlContext<'_>, sql: &str) -> Result<bool> {
    let row = db.query_single_row(&ctx.resolve(sql)).await?;
    Ok(row
        .as_ref()
        .and_then(|r| r.values().next())
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

/// When a validation rule fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Fails when the query returns rows
    ThrowIfNotEmpty,
    /// Fails when the query returns nothing
    ThrowIfEmpty,
}

impl RuleKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.trim().to_lowercase().as_str() {
            "trow_if_not_empty" | "throw_if_not_empty" => Some(RuleKind::ThrowIfNotEmpty),
            "trow_if_empty" | "throw_if_empty" => Some(RuleKind::ThrowIfEmpty),
            _ => None,
        }
    }
}

/// An entry of a `{step}_validation` list.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRule<'n> {
    pub sql: &'n str,
    pub kind: RuleKind,
    pub msg: Option<&'n str>,
    pub active: bool,
}

impl<'n> ValidationRule<'n> {
    pub fn from_node(node: &'n Node) -> Option<Self> {
        Some(Self {
            sql: node.get_str("sql")?,
            kind: RuleKind::parse(node.get_str("type")?)?,
            msg: node.get_str("msg"),
            active: node.is_active(),
        })
    }

    /// Rules of a list; malformed entries are logged and dropped.
    pub fn list(node: Option<&'n Node>) -> Vec<Self> {
        node.and_then(Node::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|rule| {
                let parsed = Self::from_node(rule);
                if parsed.is_none() {
                    warn!("Ignoring validation rule without sql or a known type: {rule}");
                }
                parsed
            })
            .collect()
    }

    /// `Some(message)` when the rule is violated.
    pub async fn check(&self, db: &mut Database, ctx: &SqlContext<'_>) -> Result<Option<String>> {
        let rows = db.query_rows(&ctx.resolve(self.sql)).await?;
        let violated = match self.kind {
            RuleKind::ThrowIfNotEmpty => !rows.is_empty(),
            RuleKind::ThrowIfEmpty => rows.is_empty(),
        };
        Ok(violated.then(|| {
            self.msg
                .map(|m| ctx.render(m))
                .unwrap_or_else(|| format!("validation failed: {:?}", self.kind))
        }))
    }
}

/// Runs the phases of one item (or item step) and records each of them.
pub struct Phases<'r, 'a> {
    db: &'r mut Database,
    ctx: &'r SqlContext<'a>,
    book: &'r mut LogBook,
    name: String,
    key: String,
    item_key: Option<String>,
    reference: Option<String>,
}

impl<'r, 'a> Phases<'r, 'a> {
    /// `name` prefixes every record, e.g. `ETL->sales->load`.
    pub fn new(
        db: &'r mut Database,
        ctx: &'r SqlContext<'a>,
        book: &'r mut LogBook,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            db,
            ctx,
            book,
            name: name.into(),
            key: key.into(),
            item_key: None,
            reference: None,
        }
    }

    pub fn item(mut self, item_key: impl Into<String>) -> Self {
        self.item_key = Some(item_key.into());
        self
    }

    pub fn reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn db(&mut self) -> &mut Database {
        &mut *self.db
    }

    pub fn book(&mut self) -> &mut LogBook {
        &mut *self.book
    }

    /// An open record named `{name}:{suffix}`.
    pub fn record(&self, suffix: &str) -> LogRecord {
        let name = if suffix.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{suffix}", self.name)
        };
        let mut record = LogRecord::start(name, &self.key).reference(self.reference.clone());
        record.item_key = self.item_key.clone();
        record
    }

    async fn phase(&mut self, suffix: &str, node: Option<&Node>, on_err: &OnError<'_>) -> bool {
        let Some(node) = node else {
            return true;
        };
        let record = self.record(suffix);
        let result = run_with_fallback(self.db, self.ctx, node, on_err).await;
        let record = match result {
            Ok(outcome) => {
                let mut record = record.ok(if outcome.recovered {
                    "successful after recovery"
                } else {
                    "successful"
                });
                record.rows = i64::try_from(outcome.rows).ok();
                record
            }
            Err(e) => record.failed(e.to_string()),
        };
        let success = record.success;
        self.book.push(record);
        success
    }

    /// `BEFORE`; absent cells count as success.
    pub async fn before(&mut self, node: Option<&Node>, on_err: &OnError<'_>) -> bool {
        self.phase("Before", node, on_err).await
    }

    /// `AFTER`; absent cells count as success.
    pub async fn after(&mut self, node: Option<&Node>, on_err: &OnError<'_>) -> bool {
        self.phase("After", node, on_err).await
    }

    /// `MAIN`, returning the affected rows on success.
    pub async fn main(&mut self, node: &Node, on_err: &OnError<'_>) -> Option<u64> {
        let record = self.record("Main");
        match run_with_fallback(self.db, self.ctx, node, on_err).await {
            Ok(outcome) => {
                let mut record = record.ok(if outcome.recovered {
                    "recovered through the error handler"
                } else {
                    "successful"
                });
                record.rows = i64::try_from(outcome.rows).ok();
                self.book.push(record);
                Some(outcome.rows)
            }
            Err(e) => {
                self.book.push(record.failed(e.to_string()));
                None
            }
        }
    }

    /// `MAIN` diverted into a CSV file, returning the rows written.
    ///
    /// Leading statements of the cell run in order; the last one is the export query.
    pub async fn main_to_csv(&mut self, node: &Node, path: &Path) -> Option<u64> {
        let mut record = self.record("Main");
        record.fname = Some(path.display().to_string());

        let mut statements = Vec::new();
        for entry in entries(node) {
            match entry {
                SqlEntry::Sql(sql) => statements.push(self.ctx.resolve(sql)),
                SqlEntry::Dynamic(dq) => statements.extend(expand_dynamic(self.db, self.ctx, dq).await),
            }
        }
        let Some(export) = statements.pop() else {
            self.book
                .push(record.failed("a CSV extract needs at least one SQL statement"));
            return None;
        };
        for sql in &statements {
            if let Err(e) = self.db.execute(sql).await {
                self.book.push(record.failed(e.to_string()));
                return None;
            }
        }

        let time = Instant::now();
        match self.db.query_to_csv(&export, path).await {
            Ok(rows) => {
                debug!("Wrote {rows} rows to {}. Elapsed time: {:.2?}", path.display(), time.elapsed());
                let mut record = record.ok("successful");
                record.rows = i64::try_from(rows).ok();
                self.book.push(record);
                Some(rows)
            }
            Err(e) => {
                self.book.push(record.failed(e.to_string()));
                None
            }
        }
    }

    /// The condition gate. A missing condition passes.
    pub async fn condition(&mut self, sql: Option<&str>, msg: Option<&str>) -> bool {
        let Some(sql) = sql else {
            return true;
        };
        let record = self.record("Cond");
        let record = match check_condition(self.db, self.ctx, sql).await {
            Ok(true) => record.ok("condition met"),
            Ok(false) => match msg {
                Some(msg) => record.failed(format!("failed {}", self.ctx.render(msg))),
                None => record.failed(format!("failed the condition {sql} was not met!")),
            },
            Err(e) => record.failed(format!("failed {e}")),
        };
        let passed = record.success;
        self.book.push(record);
        passed
    }

    /// Validation rules in order. The first violated rule fails the gate and the
    /// rest are not evaluated; a rule that cannot run is recorded but does not.
    pub async fn validate(&mut self, rules: Option<&Node>) -> bool {
        for rule in ValidationRule::list(rules) {
            if !rule.active {
                continue;
            }
            let record = self.record("Valid");
            match rule.check(self.db, self.ctx).await {
                Ok(None) => self.book.push(record.ok("passed")),
                Ok(Some(msg)) => {
                    self.book.push(record.failed(msg));
                    return false;
                }
                Err(e) => {
                    warn!("{}: validation query failed: {e}", self.name);
                    self.book.push(record.failed(e.to_string()));
                }
            }
        }
        true
    }

    /// A single statement such as `CLEAN` or `DROP`.
    pub async fn statement(&mut self, suffix: &str, sql: &str) -> bool {
        let record = self.record(suffix);
        let record = match self.db.execute_rows_affected(&self.ctx.resolve(sql)).await {
            Ok(rows) => {
                let mut record = record.ok("successful");
                record.rows = i64::try_from(rows).ok();
                record
            }
            Err(e) => record.failed(e.to_string()),
        };
        let success = record.success;
        self.book.push(record);
        success
    }

    /// A counting query whose first matching column is stored as the record's `rows`.
    pub async fn count(&mut self, suffix: &str, sql: &str, columns: &[&str]) -> Option<i64> {
        let record = self.record(suffix);
        match self.db.query_single_row(&self.ctx.resolve(sql)).await {
            Ok(row) => {
                let rows = row.as_ref().and_then(|row| {
                    columns
                        .iter()
                        .find_map(|c| row.get(*c))
                        .and_then(Value::as_i64)
                });
                let mut record = record.ok("successful");
                record.rows = rows;
                self.book.push(record);
                rows
            }
            Err(e) => {
                self.book.push(record.failed(e.to_string()));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_keep_their_order() {
        let node = Node::List(vec![
            Node::from("LOAD json"),
            Node::Dynamic(DynamicQuery {
                name: "cols".into(),
                before: None,
                after: None,
            }),
            Node::from(3_i64),
            Node::from("SELECT 1"),
        ]);
        let entries = entries(&node);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], SqlEntry::Sql("LOAD json"));
        assert!(matches!(entries[1], SqlEntry::Dynamic(_)));
    }

    #[test]
    fn rule_kinds() {
        assert_eq!(RuleKind::parse("trow_if_empty"), Some(RuleKind::ThrowIfEmpty));
        assert_eq!(
            RuleKind::parse("throw_if_not_empty"),
            Some(RuleKind::ThrowIfNotEmpty)
        );
        assert_eq!(RuleKind::parse("warn"), None);
    }

    #[test]
    fn on_error_needs_pattern_and_recovery() {
        let mut meta = crate::config::NodeMap::new();
        meta.insert("load_on_err_match_patt".into(), Node::from("(?i)does not exist"));
        meta.insert("load_on_err_match_sql".into(), Node::from("CREATE TABLE t (id INT)"));
        let meta = Node::Map(meta);

        let policy = OnError::from_metadata(&meta, "load_on_err_match_patt", "load_on_err_match_sql", false);
        assert!(policy.matches("Table T Does Not Exist").unwrap());

        let missing = OnError::from_metadata(&meta, "load_on_err_match_patt", "nope", false);
        assert!(!missing.matches("Table t does not exist").unwrap());
    }
}
