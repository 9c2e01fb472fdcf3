// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry engine with exponential backoff + jitter for downloads and cloud
// status updates.
//
// Only `ErrorClass::Transient` errors are retried; everything else gives up
// immediately with its class so the caller can record why.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use cloudspool_core::ConnectorConfig;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::ErrorClass;

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay between attempts (exponential backoff).
    pub base_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn downloads(config: &ConnectorConfig) -> Self {
        Self {
            max_attempts: config.download_max_attempts,
            base_delay: Duration::from_millis(config.download_backoff_base_ms),
            max_delay: Duration::from_secs(config.download_backoff_max_secs),
        }
    }

    pub fn status_updates(config: &ConnectorConfig) -> Self {
        Self {
            max_attempts: config.status_update_max_attempts,
            base_delay: Duration::from_millis(config.status_update_backoff_base_ms),
            max_delay: Duration::from_secs(config.status_update_backoff_max_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Result of evaluating whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after this delay.
    RetryAfter(Duration),
    /// The error is not transient.
    GiveUp(ErrorClass),
    /// Attempt budget spent.
    Exhausted,
}

/// Decide whether to retry after `attempts` failed attempts.
pub fn should_retry(err: &CloudspoolError, attempts: u32, policy: &RetryPolicy) -> RetryDecision {
    match err.class() {
        ErrorClass::Transient => {
            if attempts >= policy.max_attempts {
                warn!(attempts, max = policy.max_attempts, "retry limit exhausted");
                RetryDecision::Exhausted
            } else {
                let delay = compute_delay(attempts.saturating_sub(1), policy);
                debug!(attempts, delay_ms = delay.as_millis() as u64, "scheduling retry");
                RetryDecision::RetryAfter(delay)
            }
        }
        class => {
            info!(?class, "non-transient error, not retrying");
            RetryDecision::GiveUp(class)
        }
    }
}

/// Compute exponential backoff delay with jitter.
///
/// delay = min(base * 2^attempt + jitter, max_delay)
pub fn compute_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base_ms = policy.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(10));
    let total_ms = exp_ms.saturating_add(jitter(base_ms, attempt));
    Duration::from_millis(total_ms.min(policy.max_delay.as_millis() as u64))
}

/// Deterministic jitter in `[0, base/2)`, spread by attempt number.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64 + 1).wrapping_mul(6364136223846793005) >> 33;
    hash % (base_ms / 2).max(1)
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match should_retry(&err, attempts, policy) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(what, attempts, error = %err, "attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(_) | RetryDecision::Exhausted => return Err(err),
            },
        }
    }
}
