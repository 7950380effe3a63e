//! Invocation of external units of work.
//!
//! A stage is implemented by a [`StageUnit`]: JSON in, JSON out, or an error.
//! The [`StageInvoker`] runs it under a time budget, classifies what came
//! back and applies the shared [`RetryPolicy`].

pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AppError, ErrorKind, Result};
use crate::models::RetryConfig;
use crate::pipeline::AbortSignal;

pub use retry::{RetryDecision, RetryPolicy};

/// An external unit of work.
#[async_trait]
pub trait StageUnit: Send + Sync {
    /// Name used in logs and failure reasons.
    fn name(&self) -> &str;

    async fn call(&self, input: Value) -> Result<Value>;
}

/// Why a stage did not produce output.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub reason: String,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Classified result of one stage invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    RetryableFailure(StageFailure),
    TerminalFailure(StageFailure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::RetryableFailure(f) | Outcome::TerminalFailure(f) => Some(f),
        }
    }
}

/// Final outcome of a stage after retries, with the number of attempts made.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub outcome: Outcome,
    pub attempts: u32,
}

/// Time and cancellation limits for one stage.
#[derive(Debug, Clone)]
pub struct Budget {
    /// Limit for a single attempt
    pub timeout: Duration,
    /// Hard stop shared by every attempt (the execution deadline)
    pub deadline: Option<Instant>,
    pub abort: AbortSignal,
}

impl Budget {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
            abort: AbortSignal::never(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Timeout for the next attempt, or `None` once the deadline has passed.
    fn attempt_timeout(&self) -> Option<Duration> {
        match self.deadline {
            None => Some(self.timeout),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                (!remaining.is_zero()).then(|| self.timeout.min(remaining))
            }
        }
    }
}

/// Runs stage units with timeout, classification and retry.
///
/// Holds no state between calls besides the per-invocation attempt counter.
#[derive(Debug, Clone)]
pub struct StageInvoker {
    policy: RetryPolicy,
    transient_codes: Vec<String>,
}

impl StageInvoker {
    pub fn new(policy: RetryPolicy, transient_codes: Vec<String>) -> Self {
        Self {
            policy,
            transient_codes,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(RetryPolicy::from_config(config), config.transient_codes.clone())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify an error returned by a unit of work.
    pub fn classify(&self, err: &AppError) -> Outcome {
        let kind = err.classify(&self.transient_codes);
        let failure = StageFailure::new(kind, err.to_string());
        if kind.is_retryable() {
            Outcome::RetryableFailure(failure)
        } else {
            Outcome::TerminalFailure(failure)
        }
    }

    /// One attempt with a timeout; no retry.
    pub async fn invoke_once(&self, unit: &dyn StageUnit, input: Value, timeout: Duration) -> Outcome {
        let started = Instant::now();
        match tokio::time::timeout(timeout, unit.call(input)).await {
            Ok(Ok(output)) => Outcome::Success(output),
            Ok(Err(err)) => self.classify(&err),
            Err(_) => self.classify(&AppError::Timeout {
                stage: unit.name().to_string(),
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Invoke `unit` with a per-attempt timeout, retrying retryable failures.
    pub async fn invoke(&self, unit: &dyn StageUnit, input: Value, timeout: Duration) -> Invocation {
        self.invoke_within(unit, input, &Budget::new(timeout)).await
    }

    /// Invoke `unit` within `budget`.
    ///
    /// Retryable failures are retried until the attempt bound, after which
    /// they are escalated to terminal. Retrying also stops when the deadline
    /// passes or the execution is aborted.
    pub async fn invoke_within(
        &self,
        unit: &dyn StageUnit,
        input: Value,
        budget: &Budget,
    ) -> Invocation {
        let mut attempt = 0;

        loop {
            let Some(timeout) = budget.attempt_timeout() else {
                return self.give_up(unit, attempt, ErrorKind::TransientInfra, "execution deadline reached");
            };

            attempt += 1;
            debug!(stage = unit.name(), attempt, "Invoking stage");

            let failure = match self.invoke_once(unit, input.clone(), timeout).await {
                Outcome::RetryableFailure(failure) => failure,
                outcome => {
                    return Invocation {
                        outcome,
                        attempts: attempt,
                    };
                }
            };

            match self.policy.decide(attempt) {
                RetryDecision::Exhausted => {
                    warn!(
                        stage = unit.name(),
                        attempts = attempt,
                        "Retries exhausted: {}",
                        failure.reason
                    );
                    let reason = format!("gave up after {attempt} attempts: {}", failure.reason);
                    return self.give_up(unit, attempt, failure.kind, &reason);
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        stage = unit.name(),
                        attempt,
                        "Retrying in {:?}: {}",
                        delay,
                        failure.reason
                    );
                    let deadline = budget.deadline.unwrap_or_else(Instant::now);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = tokio::time::sleep_until(deadline), if budget.deadline.is_some() => {
                            return self.give_up(unit, attempt, failure.kind, "execution deadline reached during backoff");
                        }
                        _ = budget.abort.aborted() => {
                            return self.give_up(unit, attempt, ErrorKind::Cancelled, "execution aborted");
                        }
                    }
                }
            }
        }
    }

    fn give_up(&self, unit: &dyn StageUnit, attempts: u32, kind: ErrorKind, reason: &str) -> Invocation {
        Invocation {
            outcome: Outcome::TerminalFailure(StageFailure::new(
                kind,
                format!("{}: {reason}", unit.name()),
            )),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AbortHandle;
    use crate::test_support::ScriptedUnit;
    use serde_json::json;

    fn invoker(max_attempts: u32) -> StageInvoker {
        StageInvoker::new(
            RetryPolicy::immediate(max_attempts),
            vec!["ThrottlingException".into()],
        )
    }

    #[tokio::test]
    async fn test_success_passes_output_through() {
        let unit = ScriptedUnit::new("echo", vec![Ok(json!({ "ok": true }))]);
        let result = invoker(3).invoke(&unit, json!({}), Duration::from_secs(1)).await;

        assert_eq!(result.outcome, Outcome::Success(json!({ "ok": true })));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_always_transient_is_attempted_exactly_three_times() {
        let unit = ScriptedUnit::always("flaky", || AppError::transient("throttled"));
        let result = invoker(3).invoke(&unit, json!({}), Duration::from_secs(1)).await;

        assert_eq!(unit.calls(), 3);
        assert_eq!(result.attempts, 3);
        match result.outcome {
            Outcome::TerminalFailure(failure) => {
                assert_eq!(failure.kind, ErrorKind::TransientInfra);
                assert!(failure.reason.contains("gave up after 3 attempts"));
            }
            other => panic!("expected terminal failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let unit = ScriptedUnit::new(
            "flaky",
            vec![
                Err(AppError::remote("ThrottlingException", "slow down")),
                Ok(json!(1)),
            ],
        );
        let result = invoker(3).invoke(&unit, json!({}), Duration::from_secs(1)).await;

        assert_eq!(result.outcome, Outcome::Success(json!(1)));
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        for err in [
            AppError::input("bad row"),
            AppError::permission("denied"),
            AppError::rejected("no"),
            AppError::remote("ValidationException", "bad"),
        ] {
            let unit = ScriptedUnit::new("strict", vec![Err(err)]);
            let result = invoker(3).invoke(&unit, json!({}), Duration::from_secs(1)).await;

            assert_eq!(unit.calls(), 1);
            assert!(matches!(result.outcome, Outcome::TerminalFailure(_)));
        }
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let unit = ScriptedUnit::new("slow", vec![Ok(json!(1))]).with_delay(Duration::from_millis(200));
        let outcome = invoker(1)
            .invoke_once(&unit, json!({}), Duration::from_millis(10))
            .await;

        match outcome {
            Outcome::RetryableFailure(failure) => {
                assert_eq!(failure.kind, ErrorKind::TransientInfra);
                assert!(failure.reason.contains("timed out"));
            }
            other => panic!("expected retryable failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_stops_backoff() {
        let (handle, signal) = AbortHandle::new();
        handle.abort();

        let invoker = StageInvoker::new(
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                multiplier: 1.0,
                jitter: false,
            },
            Vec::new(),
        );
        let unit = ScriptedUnit::always("flaky", || AppError::transient("busy"));
        let budget = Budget::new(Duration::from_secs(1)).with_abort(signal);
        let result = invoker.invoke_within(&unit, json!({}), &budget).await;

        assert_eq!(unit.calls(), 1);
        assert_eq!(
            result.outcome.failure().map(|f| f.kind),
            Some(ErrorKind::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_deadline_cuts_backoff_short() {
        let invoker = StageInvoker::new(
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                multiplier: 1.0,
                jitter: false,
            },
            Vec::new(),
        );
        let unit = ScriptedUnit::always("flaky", || AppError::transient("busy"));
        let budget = Budget::new(Duration::from_secs(1))
            .with_deadline(Instant::now() + Duration::from_millis(50));

        let started = Instant::now();
        let result = invoker.invoke_within(&unit, json!({}), &budget).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(unit.calls(), 1);
        match result.outcome {
            Outcome::TerminalFailure(failure) => {
                assert_eq!(failure.kind, ErrorKind::TransientInfra);
                assert!(failure.reason.contains("deadline"));
            }
            other => panic!("expected terminal failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_prevents_attempts() {
        let unit = ScriptedUnit::new("late", vec![Ok(json!(1))]);
        let budget = Budget::new(Duration::from_secs(1)).with_deadline(Instant::now());
        let result = invoker(3).invoke_within(&unit, json!({}), &budget).await;

        assert_eq!(unit.calls(), 0);
        assert_eq!(result.attempts, 0);
        assert!(matches!(result.outcome, Outcome::TerminalFailure(_)));
    }
}
