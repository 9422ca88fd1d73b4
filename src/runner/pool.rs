//! Fixed-size worker pool
//!
//! Each worker pulls the next task from the shared queue, drives it through
//! the retry state machine, and hands the terminal result to the aggregator.

use super::RunContext;
use crate::error::AbortReason;
use crate::retry::{AbortKind, Decision};
use crate::transport::classify_transport_error;
use crate::types::{Event, OutcomeKind, RecordBody, RequestTask, ResultRecord};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

type SharedQueue = Arc<Mutex<mpsc::Receiver<RequestTask>>>;

/// Spawn `workers` tasks consuming `queue` until it closes or the run is cancelled
pub(crate) fn spawn_workers(
    ctx: Arc<RunContext>,
    queue: mpsc::Receiver<RequestTask>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let queue: SharedQueue = Arc::new(Mutex::new(queue));
    (0..workers)
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            let queue = Arc::clone(&queue);
            tokio::spawn(worker_loop(worker, ctx, queue))
        })
        .collect()
}

async fn next_task(queue: &SharedQueue, ctx: &RunContext) -> Option<RequestTask> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        task = async { queue.lock().await.recv().await } => task,
    }
}

async fn worker_loop(worker: usize, ctx: Arc<RunContext>, queue: SharedQueue) {
    tracing::debug!(worker, "Worker started");
    let mut handled = 0u64;

    while let Some(task) = next_task(&queue, &ctx).await {
        let result = process(&ctx, task).await;
        let (index, kind) = (result.index, result.kind);
        handled += 1;

        if let Err(e) = ctx.aggregator.record(result).await {
            tracing::error!(worker, error = %e, "Failed to write report");
            ctx.abort(AbortReason::ReportWrite {
                detail: e.to_string(),
            });
        }
        ctx.event_tx.send(Event::RecordCompleted { index, kind }).ok();
    }

    tracing::debug!(worker, handled, "Worker finished");
}

fn aborted(task: &RequestTask) -> ResultRecord {
    let detail = match &task.last_error {
        Some(error) => format!("run aborted ({})", error),
        None => "run aborted".to_string(),
    };
    ResultRecord::new(task.index(), OutcomeKind::Aborted, task.attempts, detail)
}

/// Drive one task to its terminal result
async fn process(ctx: &RunContext, mut task: RequestTask) -> ResultRecord {
    let index = task.index();
    let line = index.line_number();

    match &task.record.body {
        RecordBody::Blank => {
            tracing::warn!(line, "Skipping blank line");
            return ResultRecord::new(index, OutcomeKind::Skipped, 0, "blank line");
        }
        RecordBody::Malformed(reason) => {
            tracing::warn!(line, reason = %reason, "Skipping malformed line");
            return ResultRecord::new(index, OutcomeKind::Malformed, 0, reason.clone());
        }
        RecordBody::Fields(_) => {}
    }

    let payload = match ctx.payload_builder.build(&task.record) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(line, error = %e, "Could not build request payload");
            return ResultRecord::new(index, OutcomeKind::Malformed, 0, e.to_string());
        }
    };

    loop {
        if ctx.cancel.is_cancelled() {
            return aborted(&task);
        }

        let waited = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return aborted(&task),
            waited = ctx.limiter.acquire() => waited,
        };
        if !waited.is_zero() {
            ctx.event_tx.send(Event::RateLimited { waited }).ok();
        }

        let token = match ctx.credential.token().await {
            Ok(token) => token,
            Err(e) => {
                ctx.abort(AbortReason::CredentialRefresh {
                    detail: e.to_string(),
                });
                return aborted(&task);
            }
        };

        ctx.policy.mark_sent(&mut task);
        tracing::debug!(
            line,
            attempt = task.attempts,
            generation = token.generation,
            "Dispatching record"
        );
        let (outcome, detail) = match ctx.dispatcher.send(&payload, &token.value).await {
            Ok(response) => ((ctx.classifier)(&response), response.detail()),
            Err(e) => (classify_transport_error(&e), e.to_string()),
        };

        match ctx.policy.decide(&mut task, outcome) {
            Decision::Complete => {
                return ResultRecord::new(index, OutcomeKind::Succeeded, task.attempts, detail);
            }
            Decision::RefreshAndRetry => {
                tracing::warn!(
                    line,
                    generation = token.generation,
                    "Access token expired, refreshing"
                );
                if let Err(e) = ctx.credential.refresh(token.generation).await {
                    ctx.abort(AbortReason::CredentialRefresh {
                        detail: e.to_string(),
                    });
                    return aborted(&task);
                }
            }
            Decision::RetryAfter(delay) => {
                tracing::warn!(
                    line,
                    attempt = task.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %detail,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return aborted(&task),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Decision::Fail(detail) => {
                tracing::debug!(line, attempts = task.attempts, error = %detail, "Record failed");
                return ResultRecord::new(index, OutcomeKind::Failed, task.attempts, detail);
            }
            Decision::Abort(kind, detail) => {
                let reason = match kind {
                    AbortKind::AuthorizationDenied => AbortReason::AuthorizationDenied {
                        index,
                        detail: detail.clone(),
                    },
                    AbortKind::Fatal => AbortReason::TransportFatal {
                        index,
                        detail: detail.clone(),
                    },
                };
                ctx.abort(reason);
                return ResultRecord::new(index, OutcomeKind::Failed, task.attempts, detail);
            }
        }

        ctx.policy.mark_pending(&mut task);
    }
}
