//! Core types for batch-dispatch

use serde::Serialize;
use std::time::Duration;

use crate::error::AbortReason;
use crate::feeder::InFlightLease;
use crate::retry::AttemptState;

/// Zero-based position of a record in the input
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RecordIndex(pub u64);

impl RecordIndex {
    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }

    /// 1-based line number, as shown in reports and logs
    pub fn line_number(&self) -> u64 {
        self.0 + 1
    }

    /// The index that follows this one
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for RecordIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

impl std::fmt::Display for RecordIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed content of one input line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordBody {
    /// Ordered field values, validated against the record schema
    Fields(Vec<String>),
    /// Empty line; forwarded so the report stays aligned, never dispatched
    Blank,
    /// Line that does not match the record schema; never dispatched
    Malformed(String),
}

/// One record read from the input source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputRecord {
    /// Position in the input
    pub index: RecordIndex,
    /// The line as read, without its line terminator
    pub raw: String,
    /// Parsed body
    pub body: RecordBody,
}

impl InputRecord {
    /// Field values, if this record is dispatchable
    pub fn fields(&self) -> Option<&[String]> {
        match &self.body {
            RecordBody::Fields(fields) => Some(fields),
            _ => None,
        }
    }
}

/// A record in flight through the retry state machine
///
/// Owned by exactly one worker at a time. Dropping the task releases its
/// in-flight lease on the feeder's memory window.
#[derive(Debug)]
pub struct RequestTask {
    /// The record being dispatched
    pub record: InputRecord,
    /// Total sends performed so far
    pub attempts: u32,
    /// Transient failures retried so far (bounded by the retry policy)
    pub transient_retries: u32,
    /// Token refreshes triggered by this record (unbounded)
    pub auth_refreshes: u32,
    /// Current state in the retry state machine
    pub state: AttemptState,
    /// Detail of the most recent failed attempt
    pub last_error: Option<String>,
    pub(crate) _lease: Option<InFlightLease>,
}

impl RequestTask {
    /// Create a pending task for a record
    pub fn new(record: InputRecord) -> Self {
        Self {
            record,
            attempts: 0,
            transient_retries: 0,
            auth_refreshes: 0,
            state: AttemptState::Pending,
            last_error: None,
            _lease: None,
        }
    }

    pub(crate) fn with_lease(record: InputRecord, lease: InFlightLease) -> Self {
        let mut task = Self::new(record);
        task._lease = Some(lease);
        task
    }

    /// Index of the underlying record
    pub fn index(&self) -> RecordIndex {
        self.record.index
    }
}

/// Classification of one remote response (or transport failure)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Request accepted
    Succeeded,
    /// Bearer token no longer valid; refresh and resend
    AuthExpired,
    /// Transient failure (timeout / gateway unavailable class)
    RetryableFailure(String),
    /// Client-side rejection the caller cannot resolve
    PermanentFailure(String),
    /// Credential is valid but lacks authorization; aborts the run
    AuthorizationDenied(String),
    /// Unrecoverable transport or protocol error; aborts the run
    Fatal(String),
}

/// Terminal outcome of one record, as written to the report
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Remote service accepted the record
    Succeeded,
    /// Permanent or exhausted-transient failure
    Failed,
    /// Blank input line
    Skipped,
    /// Input line did not match the record schema
    Malformed,
    /// Record was in hand when the run was aborted
    Aborted,
}

impl OutcomeKind {
    /// Label used in report lines
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Succeeded => "OK",
            OutcomeKind::Failed => "NOK",
            OutcomeKind::Skipped => "SKIPPED",
            OutcomeKind::Malformed => "MALFORMED",
            OutcomeKind::Aborted => "ABORTED",
        }
    }

    /// Whether this outcome counts toward `succeeded`
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Succeeded)
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result for one input line
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    /// Position of the source record
    pub index: RecordIndex,
    /// Terminal outcome
    pub kind: OutcomeKind,
    /// Number of sends performed (0 for records never dispatched)
    pub attempts: u32,
    /// Free-form detail (response status, error message, skip reason)
    pub detail: String,
}

impl ResultRecord {
    /// Create a result record
    pub fn new(
        index: RecordIndex,
        kind: OutcomeKind,
        attempts: u32,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            index,
            kind,
            attempts,
            detail: detail.into(),
        }
    }

    /// Tab-delimited report line: `<line>\t<OUTCOME>\t<attempts>\t<detail>`
    pub fn to_report_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.index.line_number(),
            self.kind,
            self.attempts,
            self.detail.replace(['\n', '\r', '\t'], " ")
        )
    }
}

/// Counters and timing for a finished (or aborted) run
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Total input lines, if a pre-scan determined it
    pub total: Option<u64>,
    /// Records that reached a terminal outcome
    pub processed: u64,
    /// Records accepted by the remote service
    pub succeeded: u64,
    /// Records with any non-success outcome
    pub failed: u64,
    /// Successful token refreshes after the initial exchange
    pub token_refreshes: u64,
    /// Wall time of the run
    pub duration: Duration,
    /// Set when the run stopped early
    pub aborted: Option<AbortReason>,
}

impl RunSummary {
    /// Records never processed because the run stopped early
    pub fn not_processed(&self) -> u64 {
        self.total
            .map(|total| total.saturating_sub(self.processed))
            .unwrap_or(0)
    }
}

/// Event emitted during a run
///
/// Subscribe via [`Runner::subscribe`](crate::Runner::subscribe).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Workers are about to start
    RunStarted {
        /// Total records, if known
        total: Option<u64>,
        /// Number of workers
        workers: usize,
    },
    /// Periodic progress update
    Progress {
        /// Records processed so far
        processed: u64,
        /// Total records, if known
        total: Option<u64>,
        /// Percentage complete, if total is known
        percent: Option<f64>,
    },
    /// A new bearer token was obtained
    TokenRefreshed {
        /// Generation of the new token
        generation: u64,
    },
    /// A worker waited for the rate window to roll over
    RateLimited {
        /// How long the worker waited
        waited: Duration,
    },
    /// A record reached its terminal outcome
    RecordCompleted {
        /// Record position
        index: RecordIndex,
        /// Outcome
        kind: OutcomeKind,
    },
    /// The run is stopping early
    RunAborted {
        /// Why
        reason: AbortReason,
    },
    /// The run finished (normally or after an abort) and the report is flushed
    RunFinished {
        /// Final counters
        summary: RunSummary,
    },
}
