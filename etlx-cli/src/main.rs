use std::{path::PathBuf, str::FromStr, sync::Arc};

use chrono::{Days, Local, NaiveDate, NaiveDateTime, NaiveTime};
use clap::Parser;
use etlx::prelude::*;
use miette::{IntoDiagnostic, Result};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Run every section of an etlx configuration document
#[derive(Debug, Parser)]
#[command(name = "etlx", version, about, long_about = None)]
struct Cli {
    /// Markdown or notebook configuration
    #[arg(long, env = "ETLX_CONFIG", default_value = "config.md")]
    config: PathBuf,

    /// Reference dates as YYYY-MM-DD, comma separated (default: yesterday)
    #[arg(long, env = "ETLX_DATE", value_delimiter = ',', value_parser = parse_date)]
    date: Vec<NaiveDate>,

    /// Item keys to leave out
    #[arg(long, env = "ETLX_SKIP", value_delimiter = ',')]
    skip: Vec<String>,

    /// Item keys to run, all when empty
    #[arg(long, env = "ETLX_ONLY", value_delimiter = ',')]
    only: Vec<String>,

    /// ETL steps to run (extract, transform, load)
    #[arg(long, env = "ETLX_STEPS", value_delimiter = ',')]
    steps: Vec<String>,

    /// Run the `clean_sql` of each ETL item instead of its steps
    #[arg(long, env = "ETLX_CLEAN")]
    clean: bool,

    /// Run the `drop_sql` of each ETL item instead of its steps
    #[arg(long, env = "ETLX_DROP")]
    drop: bool,

    /// Count the rows of each ETL item table instead of running its steps
    #[arg(long, env = "ETLX_ROWS")]
    rows: bool,

    /// Input file for the load step
    #[arg(long, env = "ETLX_FILE")]
    file: Option<String>,

    /// Logging level (info, debug, trace)
    #[arg(long, env = "ETLX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Print the log records as JSON
    #[arg(long, env = "ETLX_JSON")]
    json: bool,
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("invalid date `{s}`: {e}"))
}

impl Cli {
    fn dates(&self) -> Vec<NaiveDateTime> {
        let dates = if self.date.is_empty() {
            let today = Local::now().date_naive();
            vec![today.checked_sub_days(Days::new(1)).unwrap_or(today)]
        } else {
            self.date.clone()
        };
        dates.into_iter().map(|d| d.and_time(NaiveTime::MIN)).collect()
    }

    fn options(&self) -> RunOptions {
        RunOptions::builder()
            .dates(self.dates())
            .only(self.only.clone())
            .skip(self.skip.clone())
            .steps(self.steps.clone())
            .clean(self.clean)
            .drop(self.drop)
            .rows(self.rows)
            .maybe_file(self.file.clone())
            .build()
    }
}

fn summary(record: &LogRecord) -> String {
    let status = if record.success { "ok" } else { "FAILED" };
    let mut line = format!(
        "{status:>6} {} ({:.2?}): {}",
        record.name,
        std::time::Duration::from_nanos(record.duration),
        record.msg
    );
    if let Some(rows) = record.rows {
        line.push_str(&format!(" [{rows} rows]"));
    }
    line
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }
    let cli = Cli::parse();

    let log_level = Level::from_str(cli.log_level.to_lowercase().as_str()).unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Loading configuration from {}", cli.config.display());
    let config = Config::from_file(&cli.config)?;
    for warning in config.warnings() {
        warn!("{}: {}", warning.section, warning.message);
    }
    debug!("Sections: {:?}", config.order());

    let mut engine = Engine::builder()
        .config(config)
        .tracker(Arc::new(LoggingProgressTracker) as Arc<dyn ProgressTracker>)
        .build();
    let outcome = engine.run_all(&cli.options()).await?;

    if cli.json {
        let json = serde_json::to_string_pretty(&outcome.records).into_diagnostic()?;
        println!("{json}");
    } else {
        for record in &outcome.records {
            println!("{}", summary(record));
        }
    }
    info!(
        "{} records, {} failures",
        outcome.records.len(),
        outcome.failures()
    );
    Ok(())
}
