//! SSH readiness polling.
//!
//! After a lifecycle change the engine waits until an instance accepts a
//! trivial `ssh … true` round trip. Attempts repeat at a fixed delay with no
//! overall limit unless the caller sets a deadline; each attempt is bounded
//! both by the client's `ConnectTimeout` and by a local timeout so a wedged
//! client cannot stall the loop.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

use crate::dispatch::{InstanceTask, TaskContext, TaskFuture};
use crate::exec::{
    CommandRunner, ExecError, ExecutionOutcome, OutputPrefixer, OutputStream, SshSettings,
};
use crate::fleet::Instance;

/// Delay between two attempts.
pub const DEFAULT_READINESS_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on one attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote command used as the no-op probe.
const PROBE_COMMAND: &str = "true";

/// Result of a successful wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Readiness {
    /// Time from the first attempt until one succeeded.
    pub elapsed: Duration,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Errors raised while waiting for SSH.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReadinessError {
    /// Raised when the caller's deadline passes first.
    #[error("{instance} did not accept SSH within {waited:?} ({attempts} attempts)")]
    DeadlineExceeded {
        /// Instance name.
        instance: String,
        /// Time spent waiting.
        waited: Duration,
        /// Attempts made.
        attempts: u32,
    },
    /// Raised when the SSH client cannot be run at all.
    #[error("readiness probe for {instance} failed: {source}")]
    Exec {
        /// Instance name.
        instance: String,
        /// Underlying spawn error.
        #[source]
        source: ExecError,
    },
}

/// Repeats an SSH no-op until the instance answers.
#[derive(Debug)]
pub struct ReadinessPoller<R: CommandRunner> {
    runner: Arc<R>,
    ssh: SshSettings,
    delay: Duration,
    attempt_timeout: Duration,
    deadline: Option<Duration>,
}

impl<R: CommandRunner> ReadinessPoller<R> {
    /// Creates a poller with the default delay and attempt timeout.
    #[must_use]
    pub const fn new(runner: Arc<R>, ssh: SshSettings) -> Self {
        Self {
            runner,
            ssh,
            delay: DEFAULT_READINESS_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            deadline: None,
        }
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Gives up after `deadline` instead of waiting forever.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Waits until `instance` completes an SSH round trip.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::DeadlineExceeded`] when a deadline is set
    /// and passes, or [`ReadinessError::Exec`] when ssh cannot be spawned.
    pub async fn wait(&self, instance: &Instance) -> Result<Readiness, ReadinessError> {
        let invocation = self
            .ssh
            .with_connect_timeout(self.attempt_timeout)
            .ssh_invocation(instance, PROBE_COMMAND);
        let silent = OutputPrefixer::silent();
        let started = Instant::now();
        let mut attempts = 0_u32;

        loop {
            attempts = attempts.saturating_add(1);
            let probe = timeout(self.attempt_timeout, self.runner.run(&invocation, &silent)).await;
            match probe {
                Ok(Ok(output)) if output.is_success() => {
                    let elapsed = started.elapsed();
                    info!(
                        instance = %instance.name,
                        attempt = attempts,
                        elapsed_ms = elapsed.as_millis(),
                        "instance accepts SSH"
                    );
                    return Ok(Readiness { elapsed, attempts });
                }
                Ok(Ok(output)) => {
                    debug!(instance = %instance.name, attempt = attempts, code = ?output.code, "SSH not ready");
                }
                Ok(Err(source)) => {
                    return Err(ReadinessError::Exec {
                        instance: instance.name.clone(),
                        source,
                    });
                }
                Err(_) => {
                    debug!(instance = %instance.name, attempt = attempts, "SSH attempt timed out");
                }
            }

            let waited = started.elapsed();
            if let Some(limit) = self.deadline
                && waited.saturating_add(self.delay) > limit
            {
                return Err(ReadinessError::DeadlineExceeded {
                    instance: instance.name.clone(),
                    waited,
                    attempts,
                });
            }
            sleep(self.delay).await;
        }
    }
}

impl<R: CommandRunner + 'static> InstanceTask for ReadinessPoller<R> {
    fn execute<'a>(&'a self, instance: &'a Instance, ctx: &'a TaskContext) -> TaskFuture<'a> {
        Box::pin(async move {
            if ctx.dry_run {
                ctx.output
                    .line(OutputStream::Stdout, "would wait for SSH");
                return ExecutionOutcome::Success;
            }
            match self.wait(instance).await {
                Ok(readiness) => {
                    ctx.output.line(
                        OutputStream::Stdout,
                        &format!(
                            "ready after {:.1}s ({} attempts)",
                            readiness.elapsed.as_secs_f64(),
                            readiness.attempts
                        ),
                    );
                    ExecutionOutcome::Success
                }
                Err(err) => ExecutionOutcome::Errored(err.to_string()),
            }
        })
    }
}
