//! Fixed-interval polling with an overall timeout.
//!
//! Timeouts fail open: the loop logs a warning and hands back the last
//! observed value so callers can continue as if the target was reached.
//! Errors from the probe fail closed and end the loop immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Delay between two probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Overall time allowed before failing open.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval and timeout for one polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// Delay between two probes.
    pub interval: Duration,
    /// Overall time allowed before failing open.
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// How a polling loop ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollOutcome<T> {
    /// The predicate accepted `value`.
    Reached {
        /// Accepted probe result.
        value: T,
        /// Time spent polling.
        elapsed: Duration,
    },
    /// The timeout passed first; `last` is the final observation.
    TimedOut {
        /// Last probe result.
        last: T,
        /// Time spent polling.
        elapsed: Duration,
    },
}

impl<T> PollOutcome<T> {
    /// Returns the final observed value regardless of how the loop ended.
    pub fn into_value(self) -> T {
        match self {
            Self::Reached { value, .. } => value,
            Self::TimedOut { last, .. } => last,
        }
    }

    /// Returns `true` when the loop hit its timeout.
    #[must_use]
    pub const fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Probes until `done` accepts a result or `settings.timeout` passes.
///
/// # Errors
///
/// Propagates the first error returned by `probe`.
pub async fn poll_until<T, E, F, Fut, P>(
    settings: PollSettings,
    label: &str,
    mut probe: F,
    done: P,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        let value = probe().await?;
        let elapsed = started.elapsed();
        if done(&value) {
            debug!(operation = label, attempt, elapsed_ms = elapsed.as_millis(), "poll reached target");
            return Ok(PollOutcome::Reached { value, elapsed });
        }
        if elapsed >= settings.timeout {
            warn!(
                operation = label,
                attempt,
                elapsed_ms = elapsed.as_millis(),
                "poll timed out; continuing as if the target was reached"
            );
            return Ok(PollOutcome::TimedOut {
                last: value,
                elapsed,
            });
        }
        debug!(operation = label, attempt, "target not reached yet");
        sleep(settings.interval).await;
    }
}
