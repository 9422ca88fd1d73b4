//! Two-tier retry state machine
//!
//! Every send moves a [`RequestTask`] from `Pending` to `Sent`; the classified
//! [`Outcome`] then moves it to one of the result states and yields a
//! [`Decision`] for the worker:
//!
//! | Outcome             | State               | Decision                          |
//! |---------------------|---------------------|-----------------------------------|
//! | Succeeded           | Succeeded           | `Complete`                        |
//! | AuthExpired         | AuthExpired         | `RefreshAndRetry` (unbounded)     |
//! | RetryableFailure    | RetryableFailure    | `RetryAfter` while under the cap  |
//! | RetryableFailure    | PermanentFailure    | `Fail` once the cap is exhausted  |
//! | PermanentFailure    | PermanentFailure    | `Fail`                            |
//! | AuthorizationDenied | AuthorizationDenied | `Abort` the whole run             |
//! | Fatal               | Fatal               | `Abort` the whole run             |
//!
//! Token expiry never consumes the transient budget.

use crate::config::RetryConfig;
use crate::types::{Outcome, RequestTask};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// Position of a task in the retry state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Waiting to be sent
    Pending,
    /// Sent, response not yet classified
    Sent,
    /// Accepted by the remote service (terminal)
    Succeeded,
    /// Token expired; will be resent after a refresh
    AuthExpired,
    /// Transient failure; will be resent after a backoff
    RetryableFailure,
    /// Rejected or out of transient retries (terminal)
    PermanentFailure,
    /// Credential lacks authorization (terminal, aborts the run)
    AuthorizationDenied,
    /// Unrecoverable transport error (terminal, aborts the run)
    Fatal,
}

impl AttemptState {
    /// Whether no further sends follow this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded
                | AttemptState::PermanentFailure
                | AttemptState::AuthorizationDenied
                | AttemptState::Fatal
        )
    }
}

/// Which run-level failure a task hit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortKind {
    /// The credential is valid but not authorized
    AuthorizationDenied,
    /// Transport or protocol failure
    Fatal,
}

/// What the worker does next with a task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Record succeeded
    Complete,
    /// Refresh the token, then resend
    RefreshAndRetry,
    /// Wait, then resend
    RetryAfter(Duration),
    /// Record failed; the run continues
    Fail(String),
    /// Record failed and the whole run must stop
    Abort(AbortKind, String),
}

/// Decides retry behavior for each classified outcome
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from retry settings
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total sends a record gets when every response is transient
    pub fn max_transient_attempts(&self) -> u32 {
        self.config.max_transient_retries + 1
    }

    /// Move a pending task to `Sent` and count the attempt
    pub fn mark_sent(&self, task: &mut RequestTask) {
        debug_assert!(
            !task.state.is_terminal(),
            "terminal task {:?} must not be resent",
            task.state
        );
        task.attempts += 1;
        task.state = AttemptState::Sent;
    }

    /// Return a retrying task to `Pending` before its next send
    pub fn mark_pending(&self, task: &mut RequestTask) {
        if !task.state.is_terminal() {
            task.state = AttemptState::Pending;
        }
    }

    /// Apply a classified outcome to a sent task
    pub fn decide(&self, task: &mut RequestTask, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Succeeded => {
                task.state = AttemptState::Succeeded;
                Decision::Complete
            }
            Outcome::AuthExpired => {
                task.state = AttemptState::AuthExpired;
                task.auth_refreshes += 1;
                task.last_error = Some("token expired".to_string());
                Decision::RefreshAndRetry
            }
            Outcome::RetryableFailure(detail) => {
                if task.transient_retries < self.config.max_transient_retries {
                    task.transient_retries += 1;
                    task.state = AttemptState::RetryableFailure;
                    task.last_error = Some(detail);
                    Decision::RetryAfter(self.backoff_delay(task.transient_retries))
                } else {
                    task.state = AttemptState::PermanentFailure;
                    let detail = format!(
                        "{} (gave up after {} attempts)",
                        detail,
                        task.transient_retries + 1
                    );
                    task.last_error = Some(detail.clone());
                    Decision::Fail(detail)
                }
            }
            Outcome::PermanentFailure(detail) => {
                task.state = AttemptState::PermanentFailure;
                task.last_error = Some(detail.clone());
                Decision::Fail(detail)
            }
            Outcome::AuthorizationDenied(detail) => {
                task.state = AttemptState::AuthorizationDenied;
                task.last_error = Some(detail.clone());
                Decision::Abort(AbortKind::AuthorizationDenied, detail)
            }
            Outcome::Fatal(detail) => {
                task.state = AttemptState::Fatal;
                task.last_error = Some(detail.clone());
                Decision::Abort(AbortKind::Fatal, detail)
            }
        }
    }

    /// Delay before the n-th transient retry (1-based), with backoff and optional jitter
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let secs = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(secs.min(self.config.max_delay.as_secs_f64()));

        if self.config.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputRecord, RecordBody, RecordIndex};

    fn task() -> RequestTask {
        RequestTask::new(InputRecord {
            index: RecordIndex(0),
            raw: "1\tAlice".to_string(),
            body: RecordBody::Fields(vec!["1".into(), "Alice".into()]),
        })
    }

    fn policy(max_transient_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_transient_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    /// Drive a task through the policy with a fixed outcome per send
    fn run(policy: &RetryPolicy, task: &mut RequestTask, outcomes: &[Outcome]) -> Decision {
        let mut last = None;
        for outcome in outcomes {
            policy.mark_sent(task);
            let decision = policy.decide(task, outcome.clone());
            if !task.state.is_terminal() {
                policy.mark_pending(task);
            }
            last = Some(decision);
        }
        last.unwrap()
    }

    #[test]
    fn success_completes_on_first_attempt() {
        let policy = policy(2);
        let mut task = task();

        let decision = run(&policy, &mut task, &[Outcome::Succeeded]);

        assert_eq!(decision, Decision::Complete);
        assert_eq!(task.state, AttemptState::Succeeded);
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn auth_expiry_is_never_permanent() {
        let policy = policy(2);
        let mut task = task();

        for _ in 0..50 {
            policy.mark_sent(&mut task);
            assert_eq!(
                policy.decide(&mut task, Outcome::AuthExpired),
                Decision::RefreshAndRetry
            );
            policy.mark_pending(&mut task);
        }

        assert_eq!(task.auth_refreshes, 50);
        assert_eq!(task.transient_retries, 0, "auth expiry must not consume the transient budget");
        assert_eq!(task.state, AttemptState::Pending);
    }

    #[test]
    fn transient_failure_gives_up_after_cap_plus_one_attempts() {
        let policy = policy(2);
        let mut task = task();
        let transient = Outcome::RetryableFailure("502 Bad Gateway".into());

        policy.mark_sent(&mut task);
        assert!(matches!(
            policy.decide(&mut task, transient.clone()),
            Decision::RetryAfter(_)
        ));
        policy.mark_pending(&mut task);
        policy.mark_sent(&mut task);
        assert!(matches!(
            policy.decide(&mut task, transient.clone()),
            Decision::RetryAfter(_)
        ));
        policy.mark_pending(&mut task);
        policy.mark_sent(&mut task);
        let decision = policy.decide(&mut task, transient);

        assert_eq!(
            decision,
            Decision::Fail("502 Bad Gateway (gave up after 3 attempts)".into())
        );
        assert_eq!(task.attempts, policy.max_transient_attempts());
        assert_eq!(task.state, AttemptState::PermanentFailure);
    }

    #[test]
    fn zero_cap_fails_on_first_transient_error() {
        let policy = policy(0);
        let mut task = task();

        let decision = run(&policy, &mut task, &[Outcome::RetryableFailure("408".into())]);

        assert!(matches!(decision, Decision::Fail(_)));
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn auth_expiry_between_transient_failures_keeps_budget() {
        let policy = policy(1);
        let mut task = task();

        let decision = run(
            &policy,
            &mut task,
            &[
                Outcome::RetryableFailure("408".into()),
                Outcome::AuthExpired,
                Outcome::AuthExpired,
                Outcome::Succeeded,
            ],
        );

        assert_eq!(decision, Decision::Complete);
        assert_eq!(task.attempts, 4);
        assert_eq!(task.transient_retries, 1);
        assert_eq!(task.auth_refreshes, 2);
    }

    #[test]
    fn permanent_failure_is_terminal_without_retry() {
        let policy = policy(2);
        let mut task = task();

        let decision = run(&policy, &mut task, &[Outcome::PermanentFailure("400".into())]);

        assert_eq!(decision, Decision::Fail("400".into()));
        assert!(task.state.is_terminal());
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn authorization_denied_and_fatal_abort() {
        let policy = policy(2);

        let mut task_a = task();
        assert_eq!(
            run(&policy, &mut task_a, &[Outcome::AuthorizationDenied("403".into())]),
            Decision::Abort(AbortKind::AuthorizationDenied, "403".into())
        );

        let mut task_b = task();
        assert_eq!(
            run(&policy, &mut task_b, &[Outcome::Fatal("invalid header".into())]),
            Decision::Abort(AbortKind::Fatal, "invalid header".into())
        );
        assert_eq!(task_b.state, AttemptState::Fatal);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(8), Duration::from_secs(1), "capped at max_delay");
    }

    #[test]
    fn jitter_stays_within_one_to_two_times_delay() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_delay: Duration::from_millis(100),
            jitter: true,
            ..RetryConfig::default()
        });

        for _ in 0..100 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(100), "delay {:?} below base", delay);
            assert!(delay <= Duration::from_millis(200), "delay {:?} above 2x", delay);
        }
    }
}
