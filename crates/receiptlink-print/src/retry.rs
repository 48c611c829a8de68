// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bounded retry with backoff, shared by connect, delivery and reconnect.
//
// Errors are classified (see `receiptlink_core::error::classify_error`):
// Transient and LinkLost failures are retried, UserAction and Permanent give
// up at once.  Cancellation ends the loop and is never retried.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use receiptlink_core::error::{ReceiptError, Result, classify_error};
use receiptlink_core::{EngineConfig, ErrorClass};

/// Delay function between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `step * n` after the n-th failure.
    Linear(Duration),
    /// `base * 2^(n-1)` after the n-th failure, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after `failures` consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let n = failures.max(1);
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => d,
            Self::Linear(step) => step.saturating_mul(n),
            Self::Exponential { base, max } => {
                base.saturating_mul(1u32 << (n - 1).min(16)).min(max)
            }
        }
    }
}

/// Attempt budget plus delay function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn connect(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.connect_attempts.max(1),
            backoff: Backoff::Linear(config.connect_backoff()),
        }
    }

    pub fn delivery(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.delivery_attempts.max(1),
            backoff: Backoff::Fixed(config.delivery_backoff()),
        }
    }
}

/// Context handed to each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Class of the previous attempt's failure.
    pub previous: Option<ErrorClass>,
}

/// Run `op` until it succeeds, the budget runs out, or retrying cannot help.
///
/// The last error is returned on failure.  `Cancelled` is returned as soon as
/// `cancel` fires between attempts or during a backoff sleep.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = Attempt {
        number: 1,
        previous: None,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(ReceiptError::Cancelled);
        }

        let err = match op(attempt).await {
            Ok(value) => {
                if attempt.number > 1 {
                    info!(what, attempt = attempt.number, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(ReceiptError::Cancelled) => return Err(ReceiptError::Cancelled),
            Err(e) => e,
        };

        let class = classify_error(&err);
        if matches!(class, ErrorClass::Permanent | ErrorClass::UserAction) {
            info!(what, error = %err, ?class, "not retrying");
            return Err(err);
        }
        if attempt.number >= policy.max_attempts {
            warn!(what, attempts = attempt.number, error = %err, "retry budget exhausted");
            return Err(err);
        }

        let delay = policy.backoff.delay(attempt.number);
        warn!(
            what,
            attempt = attempt.number,
            max = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(what, "cancelled during backoff");
                return Err(ReceiptError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt = Attempt {
            number: attempt.number + 1,
            previous: Some(class),
        };
    }
}
