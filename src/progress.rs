//! Progress reporting for a running batch

use crate::aggregator::Counters;
use crate::types::Event;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Sentinel stored while the total is unknown
const TOTAL_UNKNOWN: u64 = u64::MAX;

/// Percentage of `total` that `processed` represents
///
/// An empty input counts as complete.
pub fn percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (processed as f64 / total as f64 * 100.0).min(100.0)
}

/// Derives completion from the run counters
#[derive(Debug)]
pub struct ProgressReporter {
    counters: Arc<Counters>,
    total: AtomicU64,
}

impl ProgressReporter {
    /// Create a reporter over `counters`, total not yet known
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            total: AtomicU64::new(TOTAL_UNKNOWN),
        }
    }

    /// Set the total once the pre-scan has counted the input
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Total records, if known
    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::SeqCst) {
            TOTAL_UNKNOWN => None,
            total => Some(total),
        }
    }

    /// Records processed so far
    pub fn processed(&self) -> u64 {
        self.counters.processed()
    }

    /// Percentage complete, if the total is known
    pub fn percent(&self) -> Option<f64> {
        self.total().map(|total| percent(self.processed(), total))
    }

    /// Current progress as an event
    pub fn snapshot(&self) -> Event {
        Event::Progress {
            processed: self.processed(),
            total: self.total(),
            percent: self.percent(),
        }
    }
}

/// Spawn a background task that periodically reports progress
///
/// Runs until `cancel_token` fires. Reporting never blocks the workers: it
/// only reads atomics and sends on a broadcast channel.
pub(crate) fn spawn_progress_reporter(
    reporter: Arc<ProgressReporter>,
    interval: Duration,
    event_tx: broadcast::Sender<Event>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_processed = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let processed = reporter.processed();
                    if last_processed == Some(processed) {
                        continue;
                    }
                    last_processed = Some(processed);

                    match reporter.percent() {
                        Some(percent) => tracing::info!(processed, "DONE {:.3}%", percent),
                        None => tracing::info!(processed, "Processed {} records", processed),
                    }
                    event_tx.send(reporter.snapshot()).ok();
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{MemorySink, ResultAggregator};
    use crate::types::{OutcomeKind, RecordIndex, ResultRecord};

    #[test]
    fn percent_of_empty_input_is_complete() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(4, 4), 100.0);
    }

    #[tokio::test]
    async fn total_can_be_set_after_creation() {
        let aggregator = ResultAggregator::new(Box::new(MemorySink::new()), 10);
        let reporter = ProgressReporter::new(aggregator.counters());
        assert_eq!(reporter.percent(), None);

        aggregator
            .record(ResultRecord::new(RecordIndex(0), OutcomeKind::Succeeded, 1, "200"))
            .await
            .unwrap();
        reporter.set_total(8);

        assert_eq!(reporter.total(), Some(8));
        assert_eq!(reporter.percent(), Some(12.5));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_emits_progress_until_cancelled() {
        let aggregator = ResultAggregator::new(Box::new(MemorySink::new()), 10);
        let reporter = Arc::new(ProgressReporter::new(aggregator.counters()));
        reporter.set_total(2);
        let (tx, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();

        let handle = spawn_progress_reporter(
            Arc::clone(&reporter),
            Duration::from_millis(500),
            tx,
            cancel.clone(),
        );

        match rx.recv().await.unwrap() {
            Event::Progress {
                processed, percent, ..
            } => {
                assert_eq!(processed, 0);
                assert_eq!(percent, Some(0.0));
            }
            other => panic!("Expected Progress, got {:?}", other),
        }

        aggregator
            .record(ResultRecord::new(RecordIndex(0), OutcomeKind::Succeeded, 1, "200"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::Progress { percent, .. } => assert_eq!(percent, Some(50.0)),
            other => panic!("Expected Progress, got {:?}", other),
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
