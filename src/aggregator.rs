//! Result aggregation and report output
//!
//! Workers complete records in any order. [`ResultAggregator::record`] counts
//! each result once, then holds it until every lower index has arrived so the
//! report lines come out in input order. Every `flush_every` completions the
//! in-order lines are written and durably flushed to the [`ReportSink`].
//!
//! At most `max_held` results wait behind a missing lower index. When that
//! bound is reached the held results are released in index order and the
//! missing indexes become stragglers: each is written as soon as it arrives,
//! after the lines already released. Every line starts with its line number.

use crate::error::Result;
use crate::types::{RecordIndex, ResultRecord, RunSummary};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

/// Separator line framing the header and summary blocks
const RULE: &str = "========================================================";

/// Timestamp format used in the report
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Results held behind a missing index before they are released anyway
pub const DEFAULT_MAX_HELD: usize = 1000;

/// Destination of report lines
#[async_trait]
pub trait ReportSink: Send {
    /// Append lines (without terminators)
    async fn write_lines(&mut self, lines: &[String]) -> Result<()>;

    /// Make everything written so far durable
    async fn flush(&mut self) -> Result<()>;
}

/// Report file, truncated on open
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
}

impl FileSink {
    /// Create (or truncate) the report file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Location of the report file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReportSink for FileSink {
    async fn write_lines(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        Ok(())
    }
}

/// In-memory report, readable through any clone
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    lines: Arc<StdMutex<Vec<String>>>,
    flushes: Arc<AtomicU64>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of flushes performed
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn write_lines(&mut self, lines: &[String]) -> Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(lines);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Monotonic run counters, readable without locking
#[derive(Debug, Default)]
pub struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    /// Records that reached a terminal outcome
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Records accepted by the remote service
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Records with any other outcome
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Context written at the top of a report
#[derive(Clone, Debug)]
pub struct ReportHeader {
    /// Free-form label (e.g. environment name)
    pub label: Option<String>,
    /// Dispatch endpoint
    pub endpoint: String,
    /// Client ID used for the token exchange
    pub client_id: String,
    /// Client secret, already masked
    pub masked_secret: String,
    /// Input file
    pub input: PathBuf,
    /// Worker count
    pub workers: usize,
    /// Total input lines, if known
    pub total: Option<u64>,
    /// When processing started
    pub started: DateTime<Local>,
}

impl ReportHeader {
    /// Header block lines
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![RULE.to_string(), "INPUT ARGUMENTS".to_string()];
        if let Some(label) = &self.label {
            lines.push(format!("- Label: {}", label));
        }
        lines.push(format!("- Endpoint: {}", self.endpoint));
        lines.push(format!(
            "- Credential: {}/{}",
            self.client_id, self.masked_secret
        ));
        lines.push(format!("- Input data path: {}", self.input.display()));
        lines.push(format!("- Total workers: {}", self.workers));
        lines.push(RULE.to_string());
        lines.push(format!(
            "Started processing requests at {}",
            self.started.format(TIMESTAMP_FORMAT)
        ));
        lines.push(match self.total {
            Some(total) => format!("Total requests: {}", total),
            None => "Total requests: unknown".to_string(),
        });
        lines.push(String::new());
        lines
    }
}

/// Summary block lines for a finished or aborted run
pub fn render_summary(summary: &RunSummary, finished: DateTime<Local>) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        RULE.to_string(),
        format!(
            "Finished at {}. Duration: {}",
            finished.format(TIMESTAMP_FORMAT),
            format_duration(summary.duration)
        ),
    ];
    if let Some(total) = summary.total {
        lines.push(format!("Total: {}", total));
    }
    lines.push(format!("Success: {}", summary.succeeded));
    lines.push(format!("Failed: {}", summary.failed));
    if let Some(reason) = &summary.aborted {
        lines.push(format!("Not processed: {}", summary.not_processed()));
        lines.push(format!("Aborted: {}", reason));
    }
    lines.push(RULE.to_string());
    lines
}

/// Render a duration as `H hours M minutes S seconds` (rounded to the second)
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64().round() as u64;
    let (hours, remainder) = (total / 3600, total % 3600);
    let (minutes, seconds) = (remainder / 60, remainder % 60);
    format!("{} hours {} minutes {} seconds", hours, minutes, seconds)
}

struct ReportState {
    sink: Box<dyn ReportSink>,
    next_index: RecordIndex,
    pending: BTreeMap<RecordIndex, ResultRecord>,
    stragglers: BTreeSet<RecordIndex>,
    ready: Vec<String>,
    since_flush: usize,
}

impl ReportState {
    fn is_duplicate(&self, index: RecordIndex) -> bool {
        if index < self.next_index {
            !self.stragglers.contains(&index)
        } else {
            self.pending.contains_key(&index)
        }
    }

    /// Move every record contiguous with `next_index` into the write buffer
    fn drain_in_order(&mut self) {
        while let Some(record) = self.pending.remove(&self.next_index) {
            self.ready.push(record.to_report_line());
            self.next_index = self.next_index.next();
        }
    }

    /// Release every held record, remembering the indexes still missing
    fn release_held(&mut self) {
        let held = std::mem::take(&mut self.pending);
        for record in held.into_values() {
            while self.next_index < record.index {
                self.stragglers.insert(self.next_index);
                self.next_index = self.next_index.next();
            }
            self.ready.push(record.to_report_line());
            self.next_index = record.index.next();
        }
    }

    async fn write_ready(&mut self) -> Result<()> {
        if !self.ready.is_empty() {
            self.sink.write_lines(&self.ready).await?;
            self.ready.clear();
        }
        self.sink.flush().await?;
        self.since_flush = 0;
        Ok(())
    }
}

/// Collects per-record results from all workers
pub struct ResultAggregator {
    counters: Arc<Counters>,
    flush_every: usize,
    max_held: usize,
    state: Mutex<ReportState>,
}

impl ResultAggregator {
    /// Create an aggregator writing to `sink`, flushing every `flush_every` results
    pub fn new(sink: Box<dyn ReportSink>, flush_every: usize) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            flush_every: flush_every.max(1),
            max_held: DEFAULT_MAX_HELD,
            state: Mutex::new(ReportState {
                sink,
                next_index: RecordIndex(0),
                pending: BTreeMap::new(),
                stragglers: BTreeSet::new(),
                ready: Vec::new(),
                since_flush: 0,
            }),
        }
    }

    /// Release held results once `max_held` of them wait behind a missing index
    pub fn with_max_held(mut self, max_held: usize) -> Self {
        self.max_held = max_held.max(1);
        self
    }

    /// Shared handle to the counters
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Write and flush the header block
    ///
    /// # Errors
    ///
    /// Returns an error if the sink fails.
    pub async fn write_header(&self, header: &ReportHeader) -> Result<()> {
        let mut state = self.state.lock().await;
        state.sink.write_lines(&header.render()).await?;
        state.sink.flush().await
    }

    /// Count a terminal result and queue its report line
    ///
    /// A second result for the same index is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a periodic flush to the sink fails.
    pub async fn record(&self, result: ResultRecord) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.is_duplicate(result.index) {
            tracing::warn!(
                line = result.index.line_number(),
                "Ignoring duplicate result for record"
            );
            return Ok(());
        }

        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        if result.kind.is_success() {
            self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
        }

        if result.index < state.next_index {
            tracing::debug!(
                line = result.index.line_number(),
                "Writing late result out of order"
            );
            state.stragglers.remove(&result.index);
            state.ready.push(result.to_report_line());
        } else {
            state.pending.insert(result.index, result);
            state.drain_in_order();
            if state.pending.len() >= self.max_held {
                tracing::warn!(
                    held = state.pending.len(),
                    waiting_for = state.next_index.line_number(),
                    "Releasing results held behind an unfinished record"
                );
                state.release_held();
            }
        }
        state.since_flush += 1;

        if state.since_flush >= self.flush_every {
            tracing::debug!(
                written = state.ready.len(),
                held = state.pending.len(),
                "Flushing report"
            );
            state.write_ready().await?;
        }
        Ok(())
    }

    /// Write every remaining result in index order, then the summary block
    ///
    /// Results held behind a gap (records never processed in an aborted run)
    /// are written in order with the gap skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink fails.
    pub async fn finish(&self, summary: &RunSummary) -> Result<()> {
        let mut state = self.state.lock().await;
        let held = std::mem::take(&mut state.pending);
        if !held.is_empty() {
            tracing::debug!(held = held.len(), "Writing results held behind unprocessed records");
        }
        for record in held.into_values() {
            state.ready.push(record.to_report_line());
            state.next_index = record.index.next();
        }
        state.ready.extend(render_summary(summary, Local::now()));
        state.write_ready().await
    }
}
