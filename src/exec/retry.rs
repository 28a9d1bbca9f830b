//! Retry policy for transient SSH connection failures.
//!
//! OpenSSH exits with status 255 both when the connection fails and when the
//! remote side reports its own failure, so a retry requires the exit code AND
//! one of a small set of connection-level messages on stderr. Retries happen
//! immediately; the remote command may run more than once when a failure
//! occurs after it started.

use tracing::{error, warn};

use super::{CommandOutput, CommandRunner, ExecError, Invocation, OutputPrefixer};

/// Exit status OpenSSH uses for connection-level failures.
pub const SSH_CONNECTION_FAILURE_CODE: i32 = 255;

/// Retries allowed after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Stderr fragments that mark a 255 exit as transient.
pub const TRANSIENT_MARKERS: [&str; 3] = ["Operation timed out", "No route to host", "Host is down"];

/// When to repeat a failed invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Exit code that may signal a transient failure.
    pub exit_code: i32,
    /// Stderr fragments, one of which must be present.
    pub markers: Vec<String>,
}

impl RetryPolicy {
    /// Policy for ssh: status 255 plus a connection failure message.
    #[must_use]
    pub fn ssh_transient() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            exit_code: SSH_CONNECTION_FAILURE_CODE,
            markers: TRANSIENT_MARKERS.iter().map(|m| (*m).to_owned()).collect(),
        }
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns `true` when `output` is a transient failure under this policy.
    #[must_use]
    pub fn is_retryable(&self, output: &CommandOutput) -> bool {
        output.code == Some(self.exit_code)
            && self
                .markers
                .iter()
                .any(|marker| output.stderr.contains(marker.as_str()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ssh_transient()
    }
}

/// Output of the last attempt plus how it was reached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attempted {
    /// Output of the final attempt.
    pub output: CommandOutput,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// `true` when the final attempt was still retryable.
    pub exhausted: bool,
}

/// Runs `invocation` until it succeeds, fails terminally, or the policy's
/// budget is spent. Every attempt writes through the same `output`, so the
/// instance keeps its color across retries.
///
/// # Errors
///
/// Propagates [`ExecError`] from the runner without retrying.
pub async fn run_with_retry<R>(
    runner: &R,
    policy: &RetryPolicy,
    invocation: &Invocation,
    output: &OutputPrefixer,
) -> Result<Attempted, ExecError>
where
    R: CommandRunner + ?Sized,
{
    let mut attempts = 0_u32;
    loop {
        attempts = attempts.saturating_add(1);
        let result = runner.run(invocation, output).await?;
        if !policy.is_retryable(&result) {
            return Ok(Attempted {
                output: result,
                attempts,
                exhausted: false,
            });
        }
        if attempts > policy.max_retries {
            error!(
                program = %invocation.program,
                attempts,
                "connection failed after max retries"
            );
            return Ok(Attempted {
                output: result,
                attempts,
                exhausted: true,
            });
        }
        warn!(
            program = %invocation.program,
            attempt = attempts,
            stderr = %result.stderr.trim(),
            "transient connection failure, retrying"
        );
    }
}
