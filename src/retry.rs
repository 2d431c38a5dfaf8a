//! Bounded retry with exponential backoff
//!
//! Every remote action goes through [`retry`]. The wrapper
//!
//! - refuses to start while the pause gate is closed, without spending a try
//! - re-checks the gate before every attempt and cancels the derived token
//!   if provisioning was paused in between
//! - sleeps `base * 2^(attempt-1)` (clamped to `max`, plus up to 25% jitter)
//!   between attempts, waking early on cancellation
//! - times each action class and counts it as failed exactly once, when the
//!   budget is exhausted

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{Observer, Timer, RPC_ERRORS, RPC_TIME};
use crate::pause::PauseGate;
use crate::types::{ProvisionerError, Result};

/// Retry budget and backoff schedule for one action class
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub tries: u32,
    /// Delay before the second attempt
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 3,
            base: Duration::from_millis(500),
            max: Duration::from_secs(20),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(tries: u32) -> Self {
        Self {
            tries,
            ..Default::default()
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after a failed `attempt` (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let spread = delay.as_millis() as u64 / 4;
        let extra = rand::thread_rng().gen_range(0..=spread);
        delay + Duration::from_millis(extra)
    }
}

/// Run `op` under `policy`, labelled `action` for metrics and errors.
///
/// `op` receives a child of `cancel` that is cancelled when the gate closes
/// or the wrapper gives up, so outstanding requests can unwind.
pub async fn retry<T, F, Fut>(
    gate: &PauseGate,
    observer: &dyn Observer,
    cancel: &CancellationToken,
    action: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    gate.check(action)?;

    let ctx = cancel.child_token();
    let _guard = ctx.clone().drop_guard();
    let _timer = Timer::start(observer, RPC_TIME, Some(action));
    let tries = policy.tries.max(1);
    let mut last = None;

    for attempt in 1..=tries {
        if attempt > 1 {
            let delay = policy.delay_for(attempt - 1);
            debug!(action = %action, attempt, ?delay, "Backing off before retry");
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(ProvisionerError::Cancelled(action.to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if gate.paused() {
            ctx.cancel();
            return Err(ProvisionerError::Paused(action.to_string()));
        }

        match op(ctx.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_paused() || e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(action = %action, attempt, tries, "Attempt failed: {}", e);
                last = Some(e);
            }
        }
    }

    observer.incr(RPC_ERRORS, Some(action));

    Err(ProvisionerError::Exhausted {
        action: action.to_string(),
        tries,
        source: Box::new(
            last.unwrap_or_else(|| ProvisionerError::Internal("no attempt was made".into())),
        ),
    })
}
