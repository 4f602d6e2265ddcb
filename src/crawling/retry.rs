//! Bounded retry with fixed backoff
//!
//! Every navigator call goes through `fetch_once`, which enforces the
//! per-call timeout and honours cancellation. `fetch_with_retry` adds the
//! bounded retry loop used for navigation errors.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::NavError;
use super::navigator::{PageContent, PageNavigator};
use crate::domain::Locator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, the first one included
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sleeps one backoff. Returns `false` when cancelled meanwhile.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        pause(self.backoff, cancel).await
    }
}

/// Cancellable sleep. Returns `false` when cancelled.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

/// One navigator call bounded by `timeout`.
pub async fn fetch_once(
    navigator: &dyn PageNavigator,
    locator: &Locator,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PageContent, NavError> {
    if cancel.is_cancelled() {
        return Err(NavError::Cancelled);
    }
    tokio::select! {
        result = tokio::time::timeout(timeout, navigator.fetch(locator, timeout)) => {
            result.unwrap_or_else(|_| Err(NavError::Timeout { locator: locator.clone(), after: timeout }))
        }
        () = cancel.cancelled() => Err(NavError::Cancelled),
    }
}

/// Retries navigation errors up to `policy.max_attempts` tries.
/// Fatal and cancellation errors are returned immediately.
pub async fn fetch_with_retry(
    navigator: &dyn PageNavigator,
    locator: &Locator,
    timeout: Duration,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<PageContent, NavError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetch_once(navigator, locator, timeout, cancel).await {
            Ok(content) => {
                if attempt > 1 {
                    debug!(%locator, attempt, "Fetch succeeded after retry");
                }
                return Ok(content);
            }
            Err(e @ (NavError::Cancelled | NavError::Unreachable(_))) => return Err(e),
            Err(e) => {
                if !policy.allows(attempt) {
                    warn!(%locator, attempt, error = %e, "Giving up after navigation retries");
                    return Err(e);
                }
                debug!(%locator, attempt, error = %e, "Navigation failed, retrying");
                if !policy.pause(cancel).await {
                    return Err(NavError::Cancelled);
                }
            }
        }
    }
}
