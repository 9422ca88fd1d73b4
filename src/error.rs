//! Error types for batch-dispatch
//!
//! This module provides error handling for the library, split into:
//! - Run-level errors ([`Error`]) returned from configuration, startup and aborted runs
//! - Remote call failures ([`TransportError`]) classified per attempt
//! - Run abort reasons ([`AbortReason`]) recorded when the whole batch is stopped

use crate::types::{RecordIndex, RunSummary};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for batch-dispatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for batch-dispatch
///
/// Per-record failures never surface here; they become
/// [`ResultRecord`](crate::types::ResultRecord) outcomes. This type carries
/// failures that stop a run from starting or force it to stop early.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "dispatch.workers")
        key: Option<String>,
    },

    /// I/O error (input file, report sink)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client-id/secret exchange for a bearer token failed
    #[error("credential exchange failed: {0}")]
    CredentialExchange(String),

    /// A record could not be turned into a request payload
    #[error("invalid record at line {line}: {reason}")]
    InvalidRecord {
        /// 1-based line number of the record
        line: u64,
        /// Why the record was rejected
        reason: String,
    },

    /// The run was stopped before every record was processed
    ///
    /// The partial report and the summary have already been flushed to the
    /// sink when this is returned.
    #[error("run aborted: {reason}")]
    RunAborted {
        /// What stopped the run
        reason: AbortReason,
        /// Counters at the moment the run stopped
        summary: Box<RunSummary>,
    },

    /// Shutdown in progress - no further records are dispatched
    #[error("shutdown in progress: not dispatching further records")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::CredentialExchange(_) => "credential_exchange_failed",
            Error::InvalidRecord { .. } => "invalid_record",
            Error::RunAborted { reason, .. } => reason.error_code(),
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "internal_error",
        }
    }

    /// Process exit status a command-line front end should use for this error
    ///
    /// Configuration problems map to `2` (usage error), everything else to `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config { .. } => 2,
            _ => 1,
        }
    }

    pub(crate) fn config(message: impl Into<String>, key: &str) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Why a run was stopped before the input was exhausted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// The remote service rejected the credential's authorization (not its validity)
    AuthorizationDenied {
        /// Record whose response triggered the abort
        index: RecordIndex,
        /// Response detail
        detail: String,
    },
    /// Unrecoverable transport or protocol error
    TransportFatal {
        /// Record whose dispatch triggered the abort
        index: RecordIndex,
        /// Error detail
        detail: String,
    },
    /// The bearer token could not be refreshed mid-run
    CredentialRefresh {
        /// Error detail from the exchange
        detail: String,
    },
    /// The report could not be written
    ReportWrite {
        /// Error detail from the sink
        detail: String,
    },
    /// Shutdown requested from outside (signal or caller)
    Interrupted,
}

impl AbortReason {
    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            AbortReason::AuthorizationDenied { .. } => "authorization_denied",
            AbortReason::TransportFatal { .. } => "transport_fatal",
            AbortReason::CredentialRefresh { .. } => "credential_refresh_failed",
            AbortReason::ReportWrite { .. } => "report_write_failed",
            AbortReason::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::AuthorizationDenied { index, detail } => write!(
                f,
                "authorization denied at line {}: {}",
                index.line_number(),
                detail
            ),
            AbortReason::TransportFatal { index, detail } => write!(
                f,
                "fatal transport error at line {}: {}",
                index.line_number(),
                detail
            ),
            AbortReason::CredentialRefresh { detail } => {
                write!(f, "token refresh failed: {}", detail)
            }
            AbortReason::ReportWrite { detail } => write!(f, "report write failed: {}", detail),
            AbortReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Failure of a single remote call, before any response was classified
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request did not complete within the configured timeout
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// Established connection was closed or reset before the response completed
    #[error("connection dropped: {0}")]
    Dropped(String),

    /// Request could not be built or the response could not be decoded
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Returns true if the failure is transient and the call may be repeated
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Dropped(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let message = e.to_string();
        if e.is_timeout() {
            TransportError::Timeout(message)
        } else if e.is_connect() {
            TransportError::Connect(message)
        } else if e.is_builder() || e.is_decode() || e.is_redirect() {
            TransportError::Protocol(message)
        } else if e.is_request() || e.is_body() {
            // Peer reset, stale keep-alive, truncated body
            TransportError::Dropped(message)
        } else {
            TransportError::Protocol(message)
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_exit_with_usage_status() {
        let err = Error::config("workers must be between 1 and 8", "dispatch.workers");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.error_code(), "config_error");
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("dispatch.workers")),
            other => panic!("expected Config, got {:?}", other),
        }
    }

    #[test]
    fn credential_exchange_exits_with_failure_status() {
        let err = Error::CredentialExchange("401 Unauthorized".into());
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.error_code(), "credential_exchange_failed");
        assert_eq!(
            err.to_string(),
            "credential exchange failed: 401 Unauthorized"
        );
    }

    #[test]
    fn run_aborted_reports_reason_code() {
        let err = Error::RunAborted {
            reason: AbortReason::AuthorizationDenied {
                index: RecordIndex(4),
                detail: "403 Forbidden".into(),
            },
            summary: Box::default(),
        };
        assert_eq!(err.error_code(), "authorization_denied");
        assert_eq!(
            err.to_string(),
            "run aborted: authorization denied at line 5: 403 Forbidden"
        );
    }

    #[test]
    fn only_protocol_errors_are_not_retryable() {
        assert!(TransportError::Timeout("90s".into()).is_retryable());
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(
            TransportError::Dropped("connection closed before message completed".into())
                .is_retryable()
        );
        assert!(!TransportError::Protocol("bad header".into()).is_retryable());
    }


    #[test]
    fn abort_reason_serializes_with_tag() {
        let json = serde_json::to_value(AbortReason::CredentialRefresh {
            detail: "503".into(),
        })
        .unwrap();
        assert_eq!(json["reason"], "credential_refresh");
        assert_eq!(json["detail"], "503");
    }
}
