use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::engine::LogRecord;

/// Progress of a run, as seen by a [`ProgressTracker`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The run has begun
    Started { sections: Vec<String> },
    /// A top-level section is about to run
    SectionStarted { key: String, runner: String },
    /// An item of the running section is about to run
    ItemStarted { key: String, item: String },
    /// A log record was completed
    Record { record: Box<LogRecord> },
    /// A top-level section has finished
    SectionCompleted {
        key: String,
        duration_ms: u64,
        failures: usize,
    },
    /// The run has finished
    Completed { duration_ms: u64, records: usize },
}

/// A trait for handling progress events during a run.
///
/// Implement this trait to forward progress to a UI, a queue or a metrics system.
///
/// ```rust
/// use etlx_core::progress_tracker::{ProgressEvent, ProgressTracker};
///
/// struct FailureCounter(std::sync::atomic::AtomicUsize);
///
/// impl ProgressTracker for FailureCounter {
///     fn on_progress(&self, event: ProgressEvent) {
///         if let ProgressEvent::Record { record } = event {
///             if !record.success {
///                 self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///             }
///         }
///     }
/// }
/// ```
pub trait ProgressTracker: Send + Sync {
    /// Called when a progress event occurs during the run.
    fn on_progress(&self, event: ProgressEvent);
}

/// Logs every progress event with `tracing`.
#[derive(Debug)]
pub struct LoggingProgressTracker;

impl ProgressTracker for LoggingProgressTracker {
    #[instrument(skip_all)]
    fn on_progress(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { sections } => {
                info!("🚀 Run started: {}", sections.join(", "));
            }
            ProgressEvent::SectionStarted { key, runner } => {
                info!("📚 Section {key} ({runner})");
            }
            ProgressEvent::ItemStarted { key, item } => {
                info!("⚙️  Processing {key}->{item}");
            }
            ProgressEvent::Record { record } if record.success => {
                info!(
                    "✅ {} {} ({:.2}s)",
                    record.name,
                    record.msg,
                    record.duration as f64 / 1e9
                );
            }
            ProgressEvent::Record { record } => {
                error!("❗ {} {}", record.name, record.msg);
            }
            ProgressEvent::SectionCompleted {
                key,
                duration_ms,
                failures,
            } => {
                if failures > 0 {
                    warn!(
                        "📦 Section {key} finished with {failures} failures (took: {:.2}s)",
                        duration_ms as f64 / 1000.0
                    );
                } else {
                    info!(
                        "📦 Section {key} completed (took: {:.2}s)",
                        duration_ms as f64 / 1000.0
                    );
                }
            }
            ProgressEvent::Completed {
                duration_ms,
                records,
            } => {
                info!(
                    "🎉 Run completed with {records} records (total time: {:.2}s)",
                    duration_ms as f64 / 1000.0
                );
            }
        }
    }
}
