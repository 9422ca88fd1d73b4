//! Streaming input feeder with a bounded in-memory window
//!
//! The feeder reads the input once, line by line, and hands each record to the
//! worker queue. A queue slot is reserved *before* the next line is read, so at
//! most `chunk_size` records wait in the queue and at most one more record per
//! worker is being processed. Every record carries an [`InFlightLease`] that is
//! released when its task is dropped, which lets callers observe the bound.

use crate::error::Result;
use crate::schema::RecordSchema;
use crate::types::{RecordIndex, RequestTask};
use encoding_rs::Encoding;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Read buffer size used when pre-scanning the input for its line count
const COUNT_BUFFER_SIZE: usize = 64 * 1024;

/// Tracks how many records are alive between the reader and the workers
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    /// Create a new gauge wrapped in [`Arc`]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one live record; the returned lease unregisters it on drop
    pub fn lease(self: &Arc<Self>) -> InFlightLease {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightLease {
            gauge: Arc::clone(self),
        }
    }

    /// Records currently alive
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest number of records alive at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Keeps one record counted in its [`InFlightGauge`] until dropped
#[derive(Debug)]
pub struct InFlightLease {
    gauge: Arc<InFlightGauge>,
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How a feed ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    /// Records handed to the queue
    pub fed: u64,
    /// True if the input was read to its end
    pub exhausted: bool,
}

/// Create the bounded queue between a feeder and the worker pool
pub fn task_queue(chunk_size: usize) -> (mpsc::Sender<RequestTask>, mpsc::Receiver<RequestTask>) {
    mpsc::channel(chunk_size.max(1))
}

/// Reads records from a line-oriented source into the worker queue
#[derive(Debug, Clone)]
pub struct StreamingInputFeeder {
    schema: Arc<RecordSchema>,
    encoding: &'static Encoding,
    gauge: Arc<InFlightGauge>,
}

impl StreamingInputFeeder {
    /// Create a feeder that parses UTF-8 lines with `schema`
    pub fn new(schema: Arc<RecordSchema>) -> Self {
        Self {
            schema,
            encoding: encoding_rs::UTF_8,
            gauge: InFlightGauge::shared(),
        }
    }

    /// Decode input lines from `encoding` instead of UTF-8
    ///
    /// The encoding must be ASCII-compatible; lines are split on the `\n` byte.
    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Gauge of records alive between this feeder and the workers
    pub fn gauge(&self) -> Arc<InFlightGauge> {
        Arc::clone(&self.gauge)
    }

    /// Feed every line of the file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub async fn feed_file(
        &self,
        path: &Path,
        tx: mpsc::Sender<RequestTask>,
        cancel: CancellationToken,
    ) -> Result<FeedStats> {
        let file = tokio::fs::File::open(path).await?;
        self.feed(BufReader::new(file), tx, cancel).await
    }

    /// Feed every line of `reader` into `tx`, in input order
    ///
    /// Blocks while the queue is full. Stops early when `cancel` fires or all
    /// receivers are gone. Dropping `tx` on return closes the queue once the
    /// workers have drained it.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from `reader` fails.
    pub async fn feed<R>(
        &self,
        mut reader: R,
        tx: mpsc::Sender<RequestTask>,
        cancel: CancellationToken,
    ) -> Result<FeedStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        let mut next_index = RecordIndex(0);

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(fed = next_index.get(), "Feeder stopped by shutdown");
                    return Ok(FeedStats { fed: next_index.get(), exhausted: false });
                }
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::debug!(fed = next_index.get(), "Worker queue closed, feeder stopping");
                        return Ok(FeedStats { fed: next_index.get(), exhausted: false });
                    }
                },
            };

            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            strip_line_terminator(&mut buf);
            let (line, had_errors) = self.encoding.decode_without_bom_handling(&buf);
            if had_errors {
                tracing::warn!(
                    line = next_index.line_number(),
                    encoding = self.encoding.name(),
                    "Replaced undecodable bytes in input line"
                );
            }
            let line = line.into_owned();

            let record = self.schema.parse_line(next_index, line);
            permit.send(RequestTask::with_lease(record, self.gauge.lease()));
            next_index = next_index.next();
        }

        tracing::debug!(fed = next_index.get(), "Input exhausted");
        Ok(FeedStats {
            fed: next_index.get(),
            exhausted: true,
        })
    }
}

fn strip_line_terminator(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

/// Count the lines in a file without holding it in memory
///
/// A final line without a trailing newline is counted.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn count_lines(path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; COUNT_BUFFER_SIZE];
    let mut lines = 0u64;
    let mut last_byte = None;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        last_byte = Some(buf[n - 1]);
    }

    if matches!(last_byte, Some(b) if b != b'\n') {
        lines += 1;
    }
    Ok(lines)
}
