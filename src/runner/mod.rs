//! Run orchestration
//!
//! A [`Runner`] owns the collaborators of a batch (dispatcher, token source,
//! payload builder, classifier). Each call to [`Runner::run`] builds a fresh
//! [`RunContext`] holding the shared state of that run and wires the feeder,
//! the worker pool and the aggregator together.

mod pool;

use crate::aggregator::{ReportHeader, ReportSink, ResultAggregator};
use crate::config::Config;
use crate::credential::{CredentialManager, OAuthTokenSource, TokenSource};
use crate::error::{AbortReason, Error, Result};
use crate::feeder::{self, StreamingInputFeeder};
use crate::progress::{ProgressReporter, spawn_progress_reporter};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::schema::{JsonPayloadBuilder, PayloadBuilder};
use crate::transport::{Classifier, Dispatcher, HttpDispatcher, http_status_classifier};
use crate::types::{Event, RunSummary};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Pluggable collaborators of a [`Runner`]
pub struct RunnerParts {
    /// Sends one payload to the remote service
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Obtains bearer tokens
    pub token_source: Arc<dyn TokenSource>,
    /// Turns records into payloads
    pub payload_builder: Arc<dyn PayloadBuilder>,
    /// Turns responses into outcomes
    pub classifier: Classifier,
}

/// Shared state of one run
pub(crate) struct RunContext {
    pub(crate) credential: CredentialManager,
    pub(crate) limiter: RateLimiter,
    pub(crate) policy: RetryPolicy,
    pub(crate) aggregator: ResultAggregator,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) payload_builder: Arc<dyn PayloadBuilder>,
    pub(crate) classifier: Classifier,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) cancel: CancellationToken,
    abort_reason: OnceLock<AbortReason>,
}

impl RunContext {
    /// Stop the run; the first reason recorded wins
    pub(crate) fn abort(&self, reason: AbortReason) {
        if self.abort_reason.set(reason.clone()).is_ok() {
            tracing::error!(reason = %reason, "Aborting run");
            self.event_tx.send(Event::RunAborted { reason }).ok();
        }
        self.cancel.cancel();
    }

    pub(crate) fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason.get().cloned()
    }
}

/// Dispatches every record of an input file against the configured service
pub struct Runner {
    config: Config,
    parts: RunnerParts,
    event_tx: broadcast::Sender<Event>,
    shutdown: CancellationToken,
}

impl Runner {
    /// Create a runner that POSTs JSON records over HTTP with an OAuth token
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let parts = RunnerParts {
            dispatcher: Arc::new(HttpDispatcher::new(&config.endpoint)),
            token_source: Arc::new(OAuthTokenSource::new(&config.credentials)),
            payload_builder: Arc::new(JsonPayloadBuilder::new(config.schema.clone())),
            classifier: http_status_classifier(),
        };
        Self::with_parts(config, parts)
    }

    /// Create a runner with custom collaborators
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn with_parts(config: Config, parts: RunnerParts) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            parts,
            event_tx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that stops every current and future run when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop dispatching; records in hand are finished as aborted
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// The configuration this runner was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dispatch every line of `input` and write the report to `sink`
    ///
    /// The report and summary are flushed before this returns, whether the
    /// run completed or was aborted.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] if shutdown was already requested
    /// - [`Error::CredentialExchange`] if the first token cannot be obtained
    /// - [`Error::Io`] if the input cannot be read or the report cannot be written
    /// - [`Error::RunAborted`] if the run stopped early
    pub async fn run(&self, input: &Path, sink: Box<dyn ReportSink>) -> Result<RunSummary> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let started = std::time::Instant::now();
        let started_at = chrono::Local::now();
        let cancel = self.shutdown.child_token();
        let encoding = self.config.input.resolve_encoding()?;

        let credential = CredentialManager::new(Arc::clone(&self.parts.token_source))
            .with_events(self.event_tx.clone());
        credential.initialize().await?;

        let total = feeder::count_lines(input).await?;
        let workers = self.config.dispatch.workers;

        let aggregator = ResultAggregator::new(sink, self.config.report.flush_every)
            .with_max_held(self.config.report.max_held);
        aggregator
            .write_header(&ReportHeader {
                label: self.config.report.label.clone(),
                endpoint: self.config.endpoint.url.clone(),
                client_id: self.config.credentials.client_id.clone(),
                masked_secret: self.config.credentials.masked_secret(),
                input: input.to_path_buf(),
                workers,
                total: Some(total),
                started: started_at,
            })
            .await?;

        let progress = Arc::new(ProgressReporter::new(aggregator.counters()));
        progress.set_total(total);

        let ctx = Arc::new(RunContext {
            credential,
            limiter: RateLimiter::new(
                self.config.dispatch.rate_limit_per_window,
                self.config.dispatch.rate_window,
            ),
            policy: RetryPolicy::new(self.config.retry.clone()),
            aggregator,
            dispatcher: Arc::clone(&self.parts.dispatcher),
            payload_builder: Arc::clone(&self.parts.payload_builder),
            classifier: Arc::clone(&self.parts.classifier),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
            abort_reason: OnceLock::new(),
        });

        tracing::info!(
            input = %input.display(),
            total,
            workers,
            rate_limit = ?self.config.dispatch.rate_limit_per_window,
            "Starting dispatch run"
        );
        self.event_tx
            .send(Event::RunStarted {
                total: Some(total),
                workers,
            })
            .ok();

        let progress_cancel = CancellationToken::new();
        let progress_task = spawn_progress_reporter(
            Arc::clone(&progress),
            self.config.report.progress_interval,
            self.event_tx.clone(),
            progress_cancel.clone(),
        );

        let (tx, rx) = feeder::task_queue(self.config.dispatch.chunk_size);
        let input_feeder = StreamingInputFeeder::new(Arc::new(self.config.schema.clone()))
            .with_encoding(encoding);
        let feed_task = {
            let input = input.to_path_buf();
            let cancel = cancel.clone();
            tokio::spawn(async move { input_feeder.feed_file(&input, tx, cancel).await })
        };

        let handles = pool::spawn_workers(Arc::clone(&ctx), rx, workers);
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        let feed_result = match feed_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("feeder task failed: {}", e))),
        };

        progress_cancel.cancel();
        if let Err(e) = progress_task.await {
            tracing::warn!(error = %e, "Progress reporter task failed");
        }
        self.event_tx.send(progress.snapshot()).ok();

        let counters = ctx.aggregator.counters();
        if self.shutdown.is_cancelled() && ctx.abort_reason().is_none() {
            let complete = matches!(
                &feed_result,
                Ok(stats) if stats.exhausted && stats.fed == counters.processed()
            );
            if !complete {
                ctx.abort(AbortReason::Interrupted);
            }
        }

        let summary = RunSummary {
            total: Some(total),
            processed: counters.processed(),
            succeeded: counters.succeeded(),
            failed: counters.failed(),
            token_refreshes: ctx.credential.exchange_count().saturating_sub(1),
            duration: started.elapsed(),
            aborted: ctx.abort_reason(),
        };
        ctx.aggregator.finish(&summary).await?;

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            token_refreshes = summary.token_refreshes,
            duration_secs = summary.duration.as_secs_f64(),
            "Dispatch run finished"
        );
        self.event_tx
            .send(Event::RunFinished {
                summary: summary.clone(),
            })
            .ok();

        feed_result?;
        match summary.aborted.clone() {
            Some(reason) => Err(Error::RunAborted {
                reason,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}
