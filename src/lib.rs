//! # batch-dispatch
//!
//! Streaming batch dispatcher for token-authenticated HTTP APIs.
//!
//! Given a large file of delimited records, batch-dispatch turns every line
//! into a request, sends it under controlled concurrency, refreshes the bearer
//! token when it expires, retries transient failures, honors an optional rate
//! limit, and writes a per-line result report, all without loading the input
//! into memory.
//!
//! ## Design Philosophy
//!
//! - **Bounded memory** - the input is streamed; at most `chunk_size + workers` records are alive
//! - **Never lose a line** - every input line gets exactly one report line, in input order
//! - **Library-first** - no CLI, purely a Rust crate for embedding
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use batch_dispatch::{Config, FileSink, RecordSchema, Runner};
//! use batch_dispatch::config::{CredentialConfig, EndpointConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         credentials: CredentialConfig {
//!             token_url: "https://auth.example.com/v1.0".to_string(),
//!             client_id: "Admin".to_string(),
//!             client_secret: "secret".to_string(),
//!             ..Default::default()
//!         },
//!         endpoint: EndpointConfig {
//!             url: "https://api.example.com/v1.0/person".to_string(),
//!             ..Default::default()
//!         },
//!         schema: RecordSchema::new('\t', ["OBJECT_ID", "FIRST_NAME", "LAST_NAME"]),
//!         ..Default::default()
//!     };
//!
//!     let runner = Runner::new(config)?;
//!
//!     // Subscribe to events
//!     let mut events = runner.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let sink = FileSink::create("report.txt").await?;
//!     let summary = runner.run(Path::new("persons.txt"), Box::new(sink)).await?;
//!     println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Result aggregation and report sinks
pub mod aggregator;
/// Configuration types
pub mod config;
/// Bearer token management
pub mod credential;
/// Error types
pub mod error;
/// Streaming input
pub mod feeder;
/// Progress reporting
pub mod progress;
/// Dispatch rate limiting
pub mod rate_limiter;
/// Retry state machine with exponential backoff
pub mod retry;
/// Run orchestration and worker pool
pub mod runner;
/// Record schema and payload construction
pub mod schema;
/// Remote call boundary
pub mod transport;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use aggregator::{FileSink, MemorySink, ReportSink, ResultAggregator};
pub use config::Config;
pub use credential::{CredentialManager, OAuthTokenSource, TokenSource};
pub use error::{AbortReason, Error, Result, TransportError};
pub use feeder::StreamingInputFeeder;
pub use progress::ProgressReporter;
pub use rate_limiter::RateLimiter;
pub use retry::{AttemptState, Decision, RetryPolicy};
pub use runner::{Runner, RunnerParts};
pub use schema::{JsonPayloadBuilder, PayloadBuilder, RecordSchema};
pub use transport::{Classifier, Dispatcher, HttpDispatcher, Response, http_status_classifier};
pub use types::{Event, InputRecord, Outcome, OutcomeKind, RecordIndex, ResultRecord, RunSummary};

use std::path::Path;

/// Helper function to run a batch with graceful signal handling.
///
/// Races the run against a termination signal. On a signal the runner's
/// shutdown token is cancelled: no further records are dispatched, records in
/// hand are finished as aborted, and the partial report is flushed before the
/// run returns [`Error::RunAborted`] with [`AbortReason::Interrupted`].
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use batch_dispatch::{Config, FileSink, Runner, run_with_signal_handling};
/// use std::path::Path;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runner = Runner::new(Config::default())?;
///     let sink = FileSink::create("report.txt").await?;
///
///     // Run with automatic signal handling
///     run_with_signal_handling(&runner, Path::new("input.txt"), Box::new(sink)).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_signal_handling(
    runner: &Runner,
    input: &Path,
    sink: Box<dyn ReportSink>,
) -> Result<RunSummary> {
    let shutdown = runner.shutdown_token();
    let signal_task = tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("Stopping dispatch after termination signal");
        shutdown.cancel();
    });

    let result = runner.run(input, sink).await;
    signal_task.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
