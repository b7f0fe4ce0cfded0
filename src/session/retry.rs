//! Deadline-bounded retry engine for web service calls.
//!
//! Only [`DrmError::WebServiceRetryable`] failures are retried. While the
//! deadline is far away the engine waits the long period between attempts;
//! once less than a long period remains it switches to the short period so
//! the final attempts still fit before the deadline. All waiting is
//! cooperative: a stop request aborts the call with [`DrmError::Exit`].

use super::signal::StopSignal;
use crate::error::{DrmError, Result};
use crate::ws::LicenseService;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::warn;

/// Two-tier retry timing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    /// Delay used close to the deadline. Zero disables retrying entirely.
    pub short_period: Duration,
    /// Delay used while the deadline is still far away. Zero means the
    /// short period is always used.
    pub long_period: Duration,
}

impl RetryPolicy {
    pub fn short_only(short_period: Duration) -> Self {
        Self {
            short_period,
            long_period: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or the deadline passes.
///
/// `what` names the request in log and timeout messages ("Authentication",
/// "License").
pub(crate) fn call_with_retry<T>(
    what: &str,
    deadline: Instant,
    policy: RetryPolicy,
    stop: &StopSignal,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        let message = match op() {
            Ok(value) => return Ok(value),
            Err(DrmError::WebServiceRetryable(message)) => message,
            Err(other) => return Err(other),
        };

        attempt += 1;
        if Instant::now() > deadline {
            return Err(DrmError::WebService(format!(
                "Timeout on {what} request after {attempt} attempts"
            )));
        }
        if policy.short_period.is_zero() {
            // Retrying is disabled; the transient kind stays internal.
            return Err(DrmError::WebService(message));
        }

        let wait = if policy.long_period.is_zero() {
            policy.short_period
        } else if deadline.saturating_duration_since(Instant::now()) < policy.long_period {
            policy.short_period
        } else {
            policy.long_period
        };
        warn!(
            attempt,
            error = %message,
            wait_secs = wait.as_secs_f64(),
            "{what} request failed; retrying"
        );
        stop.sleep_or_exit(wait)?;
    }
}

/// One full license round-trip: obtain a token, then exchange the request
/// for a license, both under the same deadline and retry policy.
pub(crate) fn fetch_license(
    service: &dyn LicenseService,
    request: &Value,
    deadline: Instant,
    policy: RetryPolicy,
    stop: &StopSignal,
) -> Result<Value> {
    call_with_retry("Authentication", deadline, policy, stop, || {
        service.request_token(deadline)
    })?;
    call_with_retry("License", deadline, policy, stop, || {
        service.request_license(request, deadline)
    })
}
