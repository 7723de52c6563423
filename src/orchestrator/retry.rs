//! Retry, timeout, and cancellation wrapper around step execution.
//!
//! Each attempt runs under a fresh deadline. Cancellation takes
//! precedence over the deadline, and backoff sleeps are interruptible by
//! cancellation. Progress resets to zero at the start of every attempt.

use crate::errors::StepError;
use crate::operation::SharedOperation;
use crate::orchestrator::config::RetryPolicy;
use crate::step::{RunContext, Step};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delay before the given attempt (1-based). Attempt 1 is immediate.
pub(crate) fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    if policy.multiplier <= 0.0 {
        return Duration::ZERO;
    }
    let scaled =
        policy.initial_delay.as_secs_f64() * policy.multiplier.powi(attempt as i32 - 2);
    Duration::from_secs_f64(scaled.min(policy.max_delay.as_secs_f64()))
}

/// Run a step to a terminal result under the retry policy and the given
/// per-attempt timeout.
pub(crate) async fn run_with_policy(
    step: &Arc<dyn Step>,
    ctx: &RunContext,
    op: &SharedOperation,
    policy: &RetryPolicy,
    step_timeout: Duration,
) -> Result<(), StepError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;

    loop {
        let delay = backoff_delay(policy, attempt);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if ctx.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        op.begin_attempt(step.id(), attempt).await;

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(StepError::Cancelled),
            attempt_result = tokio::time::timeout(step_timeout, step.execute(ctx, op)) => {
                match attempt_result {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(StepError::Timeout {
                        timeout_ms: step_timeout.as_millis() as u64,
                    }),
                }
            }
        };

        match result {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < max_attempts && !ctx.is_cancelled() => {
                debug!(
                    step = step.id(),
                    attempt,
                    error = %err,
                    "step attempt failed, retrying"
                );
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
