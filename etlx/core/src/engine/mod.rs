//! Orchestration of a configuration document.
//!
//! The [`Engine`] walks the top-level sections in document order and hands each
//! one to the runner named by its key (or by `runs_as` in its metadata).
//! `REQUIRES` sections run first and merge their fragments into the document,
//! log sections run last over every record of the run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bon::Builder;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use etlx_db::{Database, DbError, DriverRegistry, Row};
use etlx_transport::Transports;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

pub mod log;
pub mod lookup;
pub mod phase;
pub mod runners;

pub use log::{LogBook, LogRecord};
pub use lookup::SqlContext;
pub use phase::{OnError, Phases};

use crate::config::{Config, ConfigError, Node, AUTO_LOGS_KEY};
use crate::env::{EnvResolver, ProcessEnv};
use crate::error::Error;
use crate::placeholders::{reference_from_filename, Placeholders};
use crate::progress_tracker::{ProgressEvent, ProgressTracker};
use crate::Result;

/// Overrides the tmp dir used for default file names and JSON logs
pub const TMP_DIR_ENV: &str = "ETL_TMPDIR";
/// Writes every resolved statement to a temp file when `true`
pub const DEBUG_QUERY_ENV: &str = "ETLX_DEBUG_QUERY";
/// Driver of the fallback connection
pub const DRIVER_ENV: &str = "DB_DRIVER_NAME";
/// DSN of the fallback connection
pub const DSN_ENV: &str = "DB_DSN";

/// Options of a single run.
#[derive(Debug, Clone, Default, PartialEq, Builder)]
pub struct RunOptions {
    /// Reference dates; the first one drives every single-date token
    #[builder(default)]
    pub dates: Vec<NaiveDateTime>,
    /// Item keys to run, empty for all
    #[builder(default)]
    pub only: Vec<String>,
    /// Item keys to leave out
    #[builder(default)]
    pub skip: Vec<String>,
    /// ETL steps to run, empty for all
    #[builder(default)]
    pub steps: Vec<String>,
    #[builder(default)]
    pub clean: bool,
    #[builder(default)]
    pub drop: bool,
    #[builder(default)]
    pub rows: bool,
    /// Input file loaded by the ETL `load` step
    #[builder(into)]
    pub file: Option<String>,
}

impl RunOptions {
    /// `clean`, `drop` or `rows` is set
    pub fn maintenance(&self) -> bool {
        self.clean || self.drop || self.rows
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutcome {
    pub records: Vec<LogRecord>,
    /// Rows returned by sections that query instead of execute, by section key
    pub data: IndexMap<String, Vec<Row>>,
}

impl RunOutcome {
    pub fn failures(&self) -> usize {
        self.records.iter().filter(|r| !r.success).count()
    }
}

/// The runner a top-level section is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerKind {
    Etl,
    DataQuality,
    Exports,
    Notify,
    Scripts,
    Actions,
    MultiQueries,
    Logs,
    Requires,
}

impl RunnerKind {
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name.trim().to_uppercase().as_str() {
            "ETL" => RunnerKind::Etl,
            "DATA_QUALITY" => RunnerKind::DataQuality,
            "EXPORTS" => RunnerKind::Exports,
            "NOTIFY" => RunnerKind::Notify,
            "SCRIPTS" => RunnerKind::Scripts,
            "ACTIONS" => RunnerKind::Actions,
            "MULTI_QUERIES" => RunnerKind::MultiQueries,
            "LOGS" => RunnerKind::Logs,
            "REQUIRES" => RunnerKind::Requires,
            _ => return None,
        };
        Some(kind)
    }

    /// `runs_as` of the section metadata, else the key itself.
    pub fn of(key: &str, section: &Node) -> Option<Self> {
        if let Some(runs_as) = section.metadata().and_then(|m| m.get_str("runs_as")) {
            return Self::parse(runs_as);
        }
        if key == AUTO_LOGS_KEY {
            return Some(RunnerKind::Logs);
        }
        Self::parse(key)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Etl => "ETL",
            RunnerKind::DataQuality => "DATA_QUALITY",
            RunnerKind::Exports => "EXPORTS",
            RunnerKind::Notify => "NOTIFY",
            RunnerKind::Scripts => "SCRIPTS",
            RunnerKind::Actions => "ACTIONS",
            RunnerKind::MultiQueries => "MULTI_QUERIES",
            RunnerKind::Logs => "LOGS",
            RunnerKind::Requires => "REQUIRES",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a runner hands back besides its records.
#[derive(Debug, Default)]
pub enum SectionOutput {
    #[default]
    Nothing,
    Rows(Vec<Row>),
    Configs(Vec<Config>),
}

/// Shared view of the engine handed to the runners.
pub struct Runtime<'a> {
    pub config: &'a Config,
    pub registry: &'a DriverRegistry,
    pub env: &'a dyn EnvResolver,
    pub transports: &'a Transports,
    pub tmp_dir: &'a Path,
    pub options: &'a RunOptions,
}

impl fmt::Debug for Runtime<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("tmp_dir", &self.tmp_dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<'a> Runtime<'a> {
    /// Run dates, or the `date_ref` (`YYYY-MM-DD`) of the given metadata.
    pub fn dates_for(&self, meta: Option<&Node>) -> Vec<NaiveDateTime> {
        let date_ref = meta
            .and_then(|m| m.get_str("date_ref"))
            .filter(|d| !d.trim().is_empty());
        match date_ref.map(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d")) {
            Some(Ok(date)) => vec![date.and_time(NaiveTime::MIN)],
            Some(Err(e)) => {
                warn!("Ignoring invalid date_ref: {e}");
                self.options.dates.clone()
            }
            None => self.options.dates.clone(),
        }
    }

    /// `ref` of the records: the first date as `YYYY-MM-DD`.
    pub fn reference(dates: &[NaiveDateTime]) -> Option<String> {
        dates.first().map(|d| d.format("%Y-%m-%d").to_string())
    }

    pub fn placeholders<'b>(&'b self, dates: &'b [NaiveDateTime]) -> Placeholders<'b> {
        Placeholders::new(self.env, dates).tmp(self.tmp_dir.to_str())
    }

    /// Resolution context for SQL of the item `scope`.
    pub fn sql_context<'b>(&'b self, scope: &'b Node, dates: &'b [NaiveDateTime]) -> SqlContext<'b> {
        let debug_dir = self.env.flag(DEBUG_QUERY_ENV).then_some(self.tmp_dir);
        SqlContext::new(self.config, scope, self.placeholders(dates)).debug_into(debug_dir)
    }

    /// The first configured connection string, else `DB_DRIVER_NAME:DB_DSN`.
    pub fn connection(&self, candidates: &[Option<&str>]) -> Option<String> {
        let configured = candidates
            .iter()
            .flatten()
            .map(|c| c.trim())
            .find(|c| !c.is_empty());
        if let Some(conn) = configured {
            return Some(crate::placeholders::replace_env(conn, self.env));
        }
        match (self.env.non_empty(DRIVER_ENV), self.env.non_empty(DSN_ENV)) {
            (Some(driver), Some(dsn)) => Some(format!("{driver}:{dsn}")),
            _ => None,
        }
    }

    /// Open `conn`, honouring a `timeout` in seconds from `meta`.
    pub async fn open(&self, conn: &str, meta: Option<&Node>) -> std::result::Result<Database, DbError> {
        let timeout = meta
            .and_then(|m| m.get("timeout"))
            .and_then(Node::as_i64)
            .and_then(|secs| u64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        self.registry.open_with_timeout(conn, timeout).await
    }

    /// Whether `only` / `skip` let the item run.
    pub fn selected(&self, item_key: &str) -> bool {
        let only = &self.options.only;
        if !only.is_empty() && !only.iter().any(|k| k == item_key) {
            return false;
        }
        !self.options.skip.iter().any(|k| k == item_key)
    }

    /// `path` as is when absolute, joined with `base` otherwise.
    pub fn resolve_path(base: Option<&Path>, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        match base {
            Some(base) if path.is_relative() && !base.as_os_str().is_empty() => base.join(path),
            _ => path,
        }
    }

    /// Active, selected items of a section with their metadata.
    ///
    /// Skipped items leave a record explaining why.
    pub fn items<'s>(&self, key: &str, section: &'s Node, book: &mut LogBook) -> Vec<(String, &'s Node, &'s Node)> {
        let mut items = Vec::new();
        for (item_key, item) in section.children() {
            let name = format!("{key}->{item_key}");
            let Some(meta) = item.metadata() else {
                book.push(LogRecord::start(name, key).item(&item_key).ok("Missing metadata in item"));
                continue;
            };
            if !meta.is_active() {
                book.push(LogRecord::start(name, key).item(&item_key).ok("Deactivated"));
                continue;
            }
            if !self.selected(&item_key) {
                book.push(LogRecord::start(name, key).item(&item_key).ok("Excluded"));
                continue;
            }
            book.progress(ProgressEvent::ItemStarted {
                key: key.to_string(),
                item: item_key.clone(),
            });
            items.push((item_key, item, meta));
        }
        items
    }
}

/// Runs the sections of a configuration document.
///
/// ```rust,no_run
/// use etlx_core::prelude::*;
///
/// # async fn run() -> etlx_core::Result<()> {
/// let config = Config::from_file("config.md")?;
/// let mut engine = Engine::builder().config(config).build();
/// let outcome = engine.run_all(&RunOptions::default()).await?;
/// println!("{} records", outcome.records.len());
/// # Ok(())
/// # }
/// ```
#[derive(Builder)]
pub struct Engine {
    config: Config,
    #[builder(default = DriverRegistry::with_defaults())]
    registry: DriverRegistry,
    #[builder(default = Arc::new(ProcessEnv) as Arc<dyn EnvResolver>)]
    env: Arc<dyn EnvResolver>,
    #[builder(default)]
    transports: Transports,
    tracker: Option<Arc<dyn ProgressTracker>>,
    #[builder(into)]
    tmp_dir: Option<PathBuf>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("sections", &self.config.order())
            .field("registry", &self.registry)
            .field("tmp_dir", &self.tmp_dir)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Engine tmp dir, else `ETL_TMPDIR`, else the system temp dir.
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .or_else(|| self.env.non_empty(TMP_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir)
    }

    fn runtime<'a>(&'a self, tmp_dir: &'a Path, options: &'a RunOptions) -> Runtime<'a> {
        Runtime {
            config: &self.config,
            registry: &self.registry,
            env: self.env.as_ref(),
            transports: &self.transports,
            tmp_dir,
            options,
        }
    }

    fn kind_of(&self, key: &str) -> Option<RunnerKind> {
        self.config.get(key).and_then(|s| RunnerKind::of(key, s))
    }

    /// Dates from the input file name when none were given.
    fn effective_options(options: &RunOptions) -> RunOptions {
        let mut options = options.clone();
        if options.dates.is_empty() {
            let from_file = options.file.as_deref().and_then(|f| {
                let name = Path::new(f).file_name()?.to_string_lossy().into_owned();
                reference_from_filename(&name)
            });
            if let Some(date) = from_file {
                debug!("Reference date {date} taken from the input file name");
                options.dates = vec![date.and_time(NaiveTime::MIN)];
            }
        }
        options
    }

    fn merge_configs(&mut self, configs: Vec<Config>, book: &mut LogBook, key: &str) {
        for config in configs {
            let conflicts = self.config.merge(config);
            if !conflicts.is_empty() {
                book.push(
                    LogRecord::start(format!("{key}:Merge"), key)
                        .failed(format!("keys already defined: {}", conflicts.join(", "))),
                );
            }
        }
    }

    /// Run every section of the document.
    ///
    /// Item and section failures become records; only an unusable tmp dir is an error.
    #[instrument(skip_all, err)]
    pub async fn run_all(&mut self, options: &RunOptions) -> Result<RunOutcome> {
        let start = Instant::now();
        let options = Self::effective_options(options);
        let tmp_dir = self.tmp_dir();
        std::fs::create_dir_all(&tmp_dir)?;

        let mut book = LogBook::new(self.tracker.clone());
        let mut outcome = RunOutcome::default();
        book.progress(ProgressEvent::Started {
            sections: self.config.order(),
        });

        let requires: Vec<String> = self
            .config
            .order()
            .into_iter()
            .filter(|k| self.kind_of(k) == Some(RunnerKind::Requires))
            .collect();
        for key in &requires {
            let output = {
                let rt = self.runtime(&tmp_dir, &options);
                run_guarded(&rt, key, RunnerKind::Requires, &mut book).await
            };
            if let Some(SectionOutput::Configs(configs)) = output {
                self.merge_configs(configs, &mut book, key);
            }
        }

        let mut logs = Vec::new();
        {
            let rt = self.runtime(&tmp_dir, &options);
            for key in self.config.order() {
                let Some(kind) = self.kind_of(&key) else {
                    debug!("No runner for section {key}");
                    continue;
                };
                match kind {
                    RunnerKind::Requires => continue,
                    RunnerKind::Logs => {
                        logs.push(key);
                        continue;
                    }
                    _ => {}
                }
                if let Some(SectionOutput::Rows(rows)) = run_guarded(&rt, &key, kind, &mut book).await {
                    outcome.data.insert(key, rows);
                }
            }

            for key in logs {
                run_guarded(&rt, &key, RunnerKind::Logs, &mut book).await;
            }
        }

        let elapsed = start.elapsed();
        book.progress(ProgressEvent::Completed {
            duration_ms: elapsed.as_millis() as u64,
            records: book.len(),
        });
        debug!("Finished the run ... Total time: {:.2?}", elapsed);

        outcome.records = book.into_records();
        Ok(outcome)
    }

    /// Run one section. Unlike [`Engine::run_all`], configuration problems are returned as errors.
    #[instrument(skip(self, options), err)]
    pub async fn run_section(&mut self, key: &str, options: &RunOptions) -> Result<RunOutcome> {
        let options = Self::effective_options(options);
        let kind = self
            .kind_of(key)
            .ok_or_else(|| ConfigError::invalid(key, "no runner handles this section"))?;
        let tmp_dir = self.tmp_dir();
        std::fs::create_dir_all(&tmp_dir)?;

        let mut book = LogBook::new(self.tracker.clone());
        let output = {
            let rt = self.runtime(&tmp_dir, &options);
            dispatch(&rt, key, kind, &mut book, &[]).await?
        };

        let mut outcome = RunOutcome::default();
        match output {
            SectionOutput::Rows(rows) => {
                outcome.data.insert(key.to_string(), rows);
            }
            SectionOutput::Configs(configs) => self.merge_configs(configs, &mut book, key),
            SectionOutput::Nothing => {}
        }
        outcome.records = book.into_records();
        Ok(outcome)
    }
}

async fn dispatch(
    rt: &Runtime<'_>,
    key: &str,
    kind: RunnerKind,
    book: &mut LogBook,
    history: &[LogRecord],
) -> Result<SectionOutput> {
    use runners::*;

    let output = match kind {
        RunnerKind::Etl => etl::run(rt, key, book).await.map(|_| SectionOutput::Nothing)?,
        RunnerKind::DataQuality => data_quality::run(rt, key, book)
            .await
            .map(|_| SectionOutput::Nothing)?,
        RunnerKind::Exports => exports::run(rt, key, book).await.map(|_| SectionOutput::Nothing)?,
        RunnerKind::Notify => notify::run(rt, key, book).await.map(|_| SectionOutput::Nothing)?,
        RunnerKind::Scripts => scripts::run(rt, key, book).await.map(|_| SectionOutput::Nothing)?,
        RunnerKind::Actions => actions::run(rt, key, book).await.map(|_| SectionOutput::Nothing)?,
        RunnerKind::MultiQueries => SectionOutput::Rows(multi_queries::run(rt, key, book).await?),
        RunnerKind::Logs => logs::run(rt, key, history, book)
            .await
            .map(|_| SectionOutput::Nothing)?,
        RunnerKind::Requires => SectionOutput::Configs(requires::run(rt, key, book).await?),
    };
    Ok(output)
}

/// Run a section, turning its errors into records.
async fn run_guarded(
    rt: &Runtime<'_>,
    key: &str,
    kind: RunnerKind,
    book: &mut LogBook,
) -> Option<SectionOutput> {
    let section = rt.config.get(key);
    if section.and_then(Node::metadata).is_some_and(|m| !m.is_active()) {
        info!("Section {key} is deactivated");
        book.push(LogRecord::start(key, key).ok("Deactivated"));
        return None;
    }

    let time = Instant::now();
    let failures = book.failures();
    book.progress(ProgressEvent::SectionStarted {
        key: key.to_string(),
        runner: kind.to_string(),
    });

    let history = if kind == RunnerKind::Logs {
        book.records().to_vec()
    } else {
        Vec::new()
    };
    let mark = book.open_section(key);
    let result = dispatch(rt, key, kind, book, &history).await;
    let description = section
        .and_then(Node::metadata)
        .and_then(|m| m.get_str("description"))
        .unwrap_or_default();
    book.close_section(mark, description);

    let output = match result {
        Ok(output) => Some(output),
        Err(Error::Config(e)) if matches!(*e, ConfigError::Deactivated(_)) => {
            info!("{e}");
            book.push(LogRecord::start(key, key).ok("Deactivated"));
            None
        }
        Err(e) => {
            error!("Section {key} failed: {e}");
            book.push(LogRecord::start(key, key).failed(e.to_string()));
            None
        }
    };

    book.progress(ProgressEvent::SectionCompleted {
        key: key.to_string(),
        duration_ms: time.elapsed().as_millis() as u64,
        failures: book.failures().saturating_sub(failures),
    });
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use rstest::rstest;

    #[rstest]
    #[case("ETL", None, Some(RunnerKind::Etl))]
    #[case("NIGHTLY", Some("runs_as: ETL"), Some(RunnerKind::Etl))]
    #[case("AUTO_LOGS", None, Some(RunnerKind::Logs))]
    #[case("QUERY_DOC", None, None)]
    fn runner_kinds(#[case] key: &str, #[case] meta: Option<&str>, #[case] expected: Option<RunnerKind>) {
        let md = match meta {
            Some(meta) => format!("# {key}\n\n```yaml\n{meta}\n```\n"),
            None => format!("# {key}\n"),
        };
        let config = Config::from_markdown_fragment(&md, "kinds.md").unwrap();
        assert_eq!(RunnerKind::of(key, config.get(key).unwrap()), expected);
    }

    #[test]
    fn fallback_connection_from_env() {
        let config = Config::default();
        let registry = DriverRegistry::new();
        let env = MapEnv::new().with(DRIVER_ENV, "sqlite3").with(DSN_ENV, ":memory:");
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

        assert_eq!(rt.connection(&[None, Some(" ")]), Some("sqlite3::memory:".to_string()));
        assert_eq!(rt.connection(&[Some("duckdb:")]), Some("duckdb:".to_string()));
    }

    #[test]
    fn only_and_skip() {
        let config = Config::default();
        let registry = DriverRegistry::new();
        let env = MapEnv::new();
        let transports = Transports::unsupported();
        let options = RunOptions::builder()
            .only(vec!["a".into(), "b".into()])
            .skip(vec!["b".into()])
            .build();
        let rt = Runtime {
            config: &config,
            registry: &registry,
            env: &env,
            transports: &transports,
            tmp_dir: Path::new("/tmp"),
            options: &options,
        };

        assert!(rt.selected("a"));
        assert!(!rt.selected("b"));
        assert!(!rt.selected("c"));
    }

    #[test]
    fn file_names_carry_the_reference_date() {
        let options = RunOptions::builder().file("/data/sales_20240131.csv").build();
        let effective = Engine::effective_options(&options);
        assert_eq!(
            Runtime::reference(&effective.dates),
            Some("2024-01-31".to_string())
        );
    }
}
