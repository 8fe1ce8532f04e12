//! Shared helpers for the engine integration tests.
//!
//! [`MockDriver`] records every statement it receives and answers from a script
//! of canned results and failures matched by SQL substring.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use etlx_core::prelude::*;
use etlx_db::{Connection, DbError, Driver, DriverRegistry, QueryResult, Row, Value};
use etlx_transport::{Mail, Mailer, SpreadsheetJob, SpreadsheetWriter, Transports};

#[derive(Debug, Default)]
struct Script {
    statements: Vec<String>,
    results: Vec<(String, QueryResult)>,
    failures: Vec<(String, String, usize)>,
    opened: usize,
    closed: usize,
}

/// A scripted driver shared by every connection it opens.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    script: Arc<Mutex<Script>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries containing `needle` return `result`.
    pub fn returns(&self, needle: &str, result: QueryResult) -> &Self {
        self.script
            .lock()
            .unwrap()
            .results
            .push((needle.to_string(), result));
        self
    }

    /// Queries containing `needle` return one row with a single column.
    pub fn returns_value(&self, needle: &str, column: &str, value: Value) -> &Self {
        let row = Row::from_iter([(column.to_string(), value)]);
        self.returns(needle, QueryResult::new(vec![column.to_string()], vec![row]))
    }

    /// Statements containing `needle` fail with `message`, `times` times.
    pub fn fails(&self, needle: &str, message: &str, times: usize) -> &Self {
        self.script
            .lock()
            .unwrap()
            .failures
            .push((needle.to_string(), message.to_string(), times));
        self
    }

    /// Every statement received so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.script.lock().unwrap().statements.clone()
    }

    /// Index of the first statement containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.statements().iter().position(|s| s.contains(needle))
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    pub fn opened(&self) -> usize {
        self.script.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.script.lock().unwrap().closed
    }

    /// A registry answering `mock:` connections.
    pub fn registry(&self) -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register("mock", Arc::new(self.clone()));
        registry
    }

    fn record(&self, sql: &str) -> etlx_db::Result<()> {
        let mut script = self.script.lock().unwrap();
        script.statements.push(sql.to_string());
        let failure = script
            .failures
            .iter_mut()
            .find(|(needle, _, times)| *times > 0 && sql.contains(needle.as_str()));
        match failure {
            Some((_, message, times)) => {
                *times -= 1;
                Err(DbError::Query(message.clone()))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, _driver: &str, _dsn: &str) -> etlx_db::Result<Box<dyn Connection>> {
        self.script.lock().unwrap().opened += 1;
        Ok(Box::new(MockConnection {
            driver: self.clone(),
        }))
    }
}

struct MockConnection {
    driver: MockDriver,
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str) -> etlx_db::Result<u64> {
        self.driver.record(sql)?;
        Ok(1)
    }

    async fn query(&mut self, sql: &str) -> etlx_db::Result<QueryResult> {
        self.driver.record(sql)?;
        let script = self.driver.script.lock().unwrap();
        Ok(script
            .results
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default())
    }

    async fn close(self: Box<Self>) -> etlx_db::Result<()> {
        self.driver.script.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Keeps every mail instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Mail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &Mail) -> etlx_transport::Result<()> {
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

/// Keeps every spreadsheet job instead of writing it.
#[derive(Debug, Default)]
pub struct RecordingSpreadsheet {
    pub jobs: Mutex<Vec<SpreadsheetJob>>,
}

#[async_trait]
impl SpreadsheetWriter for RecordingSpreadsheet {
    async fn write(&self, job: &SpreadsheetJob) -> etlx_transport::Result<()> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}

/// An engine over `markdown` (parsed without `AUTO_LOGS`) wired to the mock driver.
pub fn engine(markdown: &str, driver: &MockDriver, tmp: &Path) -> Engine {
    engine_with(markdown, driver, tmp, Transports::unsupported())
}

pub fn engine_with(markdown: &str, driver: &MockDriver, tmp: &Path, transports: Transports) -> Engine {
    let config = Config::from_markdown_fragment(markdown, "test.md").unwrap();
    Engine::builder()
        .config(config)
        .registry(driver.registry())
        .env(Arc::new(MapEnv::new()) as Arc<dyn EnvResolver>)
        .transports(transports)
        .tmp_dir(tmp)
        .build()
}

/// The record named `name`, panicking with every record name when missing.
pub fn record<'a>(outcome: &'a RunOutcome, name: &str) -> &'a LogRecord {
    outcome
        .records
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| {
            let names: Vec<&str> = outcome.records.iter().map(|r| r.name.as_str()).collect();
            panic!("no record {name}, got {names:?}")
        })
}

pub fn has_record(outcome: &RunOutcome, name: &str) -> bool {
    outcome.records.iter().any(|r| r.name == name)
}

pub fn date(y: i32, m: u32, d: u32) -> chrono::NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}
