//! Execution log records.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::progress_tracker::{ProgressEvent, ProgressTracker};

/// One observable unit of a run: a connection, a phase, a check, a whole item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub name: String,
    pub description: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_key: Option<String>,
    pub start_at: DateTime<Local>,
    pub end_at: DateTime<Local>,
    /// Nanoseconds
    pub duration: u64,
    pub success: bool,
    pub msg: String,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_fixed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fname: Option<String>,
    /// Resident set size in bytes when the record closed
    pub mem_alloc: Option<u64>,
    /// Peak resident set size in bytes
    pub mem_total_alloc: Option<u64>,
    /// Virtual memory size in bytes
    pub mem_sys: Option<u64>,
    /// Always 0, kept for log tables that carry the column
    pub num_gc: u32,
    #[serde(skip)]
    started: Option<Instant>,
}

/// Process memory counters, read from `/proc/self/status` where it exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub resident: Option<u64>,
    pub peak_resident: Option<u64>,
    pub virtual_size: Option<u64>,
}

impl MemoryStats {
    pub fn snapshot() -> Self {
        std::fs::read_to_string("/proc/self/status")
            .map(|status| Self::parse(&status))
            .unwrap_or_default()
    }

    /// Parse the `VmRSS`, `VmHWM` and `VmSize` lines, given in kB.
    pub fn parse(status: &str) -> Self {
        let field = |name: &str| {
            status.lines().find_map(|line| {
                let rest = line.strip_prefix(name)?.strip_prefix(':')?;
                let kb = rest.trim().trim_end_matches("kB").trim();
                kb.parse::<u64>().ok().map(|kb| kb * 1024)
            })
        };
        Self {
            resident: field("VmRSS"),
            peak_resident: field("VmHWM"),
            virtual_size: field("VmSize"),
        }
    }
}

impl LogRecord {
    /// Open a record; the clock runs until [`LogRecord::finish`].
    pub fn start(name: impl Into<String>, key: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            name: name.into(),
            description: String::new(),
            key: key.into(),
            item_key: None,
            start_at: now,
            end_at: now,
            duration: 0,
            success: true,
            msg: String::new(),
            reference: None,
            rows: None,
            rows_fixed: None,
            content: None,
            fname: None,
            mem_alloc: None,
            mem_total_alloc: None,
            mem_sys: None,
            num_gc: 0,
            started: Some(Instant::now()),
        }
    }

    pub fn item(mut self, item_key: impl Into<String>) -> Self {
        self.item_key = Some(item_key.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    /// Stop the clock and set the outcome.
    pub fn finish(mut self, success: bool, msg: impl Into<String>) -> Self {
        self.end_at = Local::now();
        if let Some(started) = self.started.take() {
            self.duration = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        }
        let memory = MemoryStats::snapshot();
        self.mem_alloc = memory.resident;
        self.mem_total_alloc = memory.peak_resident;
        self.mem_sys = memory.virtual_size;
        self.success = success;
        self.msg = msg.into();
        self
    }

    pub fn ok(self, msg: impl Into<String>) -> Self {
        self.finish(true, msg)
    }

    pub fn failed(self, msg: impl Into<String>) -> Self {
        self.finish(false, msg)
    }
}

/// Marker of an open section summary, see [`LogBook::open_section`].
#[derive(Debug)]
pub struct SectionMark {
    index: usize,
}

/// Append-only list of the records of a run, forwarding each to the progress tracker.
#[derive(Default)]
pub struct LogBook {
    records: Vec<LogRecord>,
    tracker: Option<Arc<dyn ProgressTracker>>,
}

impl std::fmt::Debug for LogBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBook")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl LogBook {
    pub fn new(tracker: Option<Arc<dyn ProgressTracker>>) -> Self {
        Self {
            records: Vec::new(),
            tracker,
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        if let Some(tracker) = &self.tracker {
            tracker.on_progress(ProgressEvent::Record {
                record: Box::new(record.clone()),
            });
        }
        self.records.push(record);
    }

    pub(crate) fn progress(&self, event: ProgressEvent) {
        if let Some(tracker) = &self.tracker {
            tracker.on_progress(event);
        }
    }

    /// Reserve the leading summary record of a section.
    pub fn open_section(&mut self, key: &str) -> SectionMark {
        self.records.push(LogRecord::start(key, key));
        SectionMark {
            index: self.records.len() - 1,
        }
    }

    /// Complete the summary record of a section with its description and duration.
    pub fn close_section(&mut self, mark: SectionMark, description: &str) {
        let Some(record) = self.records.get_mut(mark.index) else {
            return;
        };
        let summary = record.clone().description(description).ok("");
        *record = summary.clone();
        if let Some(tracker) = &self.tracker {
            tracker.on_progress(ProgressEvent::Record {
                record: Box::new(summary),
            });
        }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.records.iter().filter(|r| !r.success).count()
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_like_the_log_table() {
        let record = LogRecord::start("ETL->sales", "ETL")
            .item("sales")
            .reference(Some("2024-01-15".into()))
            .ok("done");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["ref"], "2024-01-15");
        assert_eq!(json["item_key"], "sales");
        assert_eq!(json["success"], true);
        assert!(json.get("rows").is_none());
        assert!(json.get("started").is_none());
        for column in ["mem_alloc", "mem_total_alloc", "mem_sys", "num_gc"] {
            assert!(json.get(column).is_some(), "missing {column}");
        }
        assert_eq!(json["num_gc"], 0);
    }

    #[test]
    fn memory_counters_from_proc_status() {
        let status = "Name:\tetlx\nVmPeak:\t  20480 kB\nVmSize:\t  16384 kB\nVmHWM:\t    8192 kB\nVmRSS:\t    4096 kB\n";
        let stats = MemoryStats::parse(status);

        assert_eq!(stats.resident, Some(4096 * 1024));
        assert_eq!(stats.peak_resident, Some(8192 * 1024));
        assert_eq!(stats.virtual_size, Some(16384 * 1024));
        assert_eq!(MemoryStats::parse("Name:\tetlx\n"), MemoryStats::default());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finished_records_carry_the_resident_size() {
        let record = LogRecord::start("ETL", "ETL").ok("");
        assert!(record.mem_alloc.is_some_and(|rss| rss > 0));
        assert!(record.mem_total_alloc >= record.mem_alloc);
    }

    #[test]
    fn section_summary_keeps_its_slot() {
        let mut book = LogBook::new(None);
        let mark = book.open_section("ETL");
        book.push(LogRecord::start("ETL->a", "ETL").failed("boom"));
        book.close_section(mark, "Daily load");

        assert_eq!(book.records()[0].name, "ETL");
        assert_eq!(book.records()[0].description, "Daily load");
        assert_eq!(book.failures(), 1);
    }
}
