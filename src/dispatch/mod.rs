//! Fan-out of one logical operation across matched instances.
//!
//! The dispatcher owns the per-operation [`DispatchContext`] (mode,
//! continue-on-error, output style, dry run, color counter) and drives an
//! [`InstanceTask`] over the instance list either one at a time or all at
//! once on the tokio runtime. Reports always follow matcher order.

use std::fmt::{self, Write as _};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::exec::{ColorCounter, ExecutionOutcome, OutputPrefixer};
use crate::fleet::Instance;

mod work;

pub use work::{WorkUnit, WorkUnitTask};

/// How instances are driven.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FleetMode {
    /// One instance at a time, in matcher order.
    #[default]
    Sequential,
    /// Every instance concurrently, joined before reporting.
    Parallel,
}

/// Lifecycle of one fleet operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FleetState {
    /// Created, nothing started.
    Pending,
    /// Work in flight.
    Running,
    /// Every scheduled instance ran (failures may still be recorded).
    Completed,
    /// A failure stopped the operation.
    Aborted,
}

impl fmt::Display for FleetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Settings shared by every instance of one fleet operation.
#[derive(Debug, Default)]
pub struct DispatchContext {
    /// Sequential or parallel.
    pub mode: FleetMode,
    /// Record failures and keep going instead of aborting.
    pub continue_on_error: bool,
    /// Print raw output lines without instance prefixes.
    pub machine_readable: bool,
    /// Print what would run instead of running it.
    pub dry_run: bool,
    colors: ColorCounter,
}

impl DispatchContext {
    /// Creates a context for `mode` with every toggle off.
    #[must_use]
    pub fn new(mode: FleetMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Sets continue-on-error.
    #[must_use]
    pub const fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Sets machine-readable output.
    #[must_use]
    pub const fn machine_readable(mut self, enabled: bool) -> Self {
        self.machine_readable = enabled;
        self
    }

    /// Sets dry run.
    #[must_use]
    pub const fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Builds the per-instance task context, drawing the next color.
    #[must_use]
    pub fn task_context(&self, instance: &Instance) -> TaskContext {
        let output = if self.machine_readable {
            OutputPrefixer::raw()
        } else {
            OutputPrefixer::prefixed(instance.name.clone(), self.colors.next_slot())
        };
        TaskContext {
            output,
            dry_run: self.dry_run,
        }
    }
}

/// Per-instance view of the dispatch context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskContext {
    /// Where the instance's output lines go.
    pub output: OutputPrefixer,
    /// Print instead of running.
    pub dry_run: bool,
}

/// Future returned by [`InstanceTask::execute`].
pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = ExecutionOutcome> + Send + 'a>>;

/// Work performed against one instance.
pub trait InstanceTask: Send + Sync + 'static {
    /// Runs the work and classifies the result. Local failures are reported
    /// as [`ExecutionOutcome::Errored`].
    fn execute<'a>(&'a self, instance: &'a Instance, ctx: &'a TaskContext) -> TaskFuture<'a>;
}

/// Result for one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceOutcome {
    /// Instance name.
    pub instance: String,
    /// What happened.
    pub outcome: ExecutionOutcome,
}

/// Aggregated result of a fleet operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FleetReport {
    /// Terminal state.
    pub state: FleetState,
    /// Outcomes of instances that ran, in matcher order.
    pub outcomes: Vec<InstanceOutcome>,
    /// Instances never started because the operation aborted.
    pub skipped: Vec<String>,
}

impl FleetReport {
    /// Returns `true` when the operation completed with no failures.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == FleetState::Completed && self.failures().next().is_none()
    }

    /// Iterates failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.outcome.is_success())
    }

    /// Renders a per-instance failure summary, empty on success.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for failure in self.failures() {
            writeln!(out, "{}: {}", failure.instance, failure.outcome).ok();
        }
        if !self.skipped.is_empty() {
            writeln!(out, "not run: {}", self.skipped.join(", ")).ok();
        }
        out
    }
}

/// Drives [`InstanceTask`]s across an instance list.
#[derive(Debug)]
pub struct FleetDispatcher {
    ctx: DispatchContext,
}

impl FleetDispatcher {
    /// Creates a dispatcher owning `ctx`.
    #[must_use]
    pub const fn new(ctx: DispatchContext) -> Self {
        Self { ctx }
    }

    /// Runs `task` against every instance according to the context's mode.
    pub async fn dispatch<T: InstanceTask>(&self, instances: Vec<Instance>, task: Arc<T>) -> FleetReport {
        let mut state = FleetState::Pending;
        debug!(%state, count = instances.len(), mode = ?self.ctx.mode, "fleet operation created");
        state = FleetState::Running;
        debug!(%state, "fleet operation started");

        let report = match self.ctx.mode {
            FleetMode::Sequential => self.run_sequential(instances, task.as_ref()).await,
            FleetMode::Parallel => self.run_parallel(instances, task).await,
        };
        debug!(state = %report.state, failures = report.failures().count(), "fleet operation finished");
        report
    }

    async fn run_sequential<T: InstanceTask>(&self, instances: Vec<Instance>, task: &T) -> FleetReport {
        let mut outcomes = Vec::with_capacity(instances.len());
        let mut remaining = instances.into_iter();
        let mut state = FleetState::Completed;

        for instance in remaining.by_ref() {
            let ctx = self.ctx.task_context(&instance);
            let outcome = task.execute(&instance, &ctx).await;
            let failed = !outcome.is_success();
            if failed {
                warn!(instance = %instance.name, %outcome, "instance failed");
            }
            outcomes.push(InstanceOutcome {
                instance: instance.name,
                outcome,
            });
            if failed && !self.ctx.continue_on_error {
                state = FleetState::Aborted;
                break;
            }
        }

        FleetReport {
            state,
            outcomes,
            skipped: remaining.map(|instance| instance.name).collect(),
        }
    }

    async fn run_parallel<T: InstanceTask>(&self, instances: Vec<Instance>, task: Arc<T>) -> FleetReport {
        let mut outcomes: Vec<InstanceOutcome> = instances
            .iter()
            .map(|instance| InstanceOutcome {
                instance: instance.name.clone(),
                outcome: ExecutionOutcome::Errored(String::from("task did not complete")),
            })
            .collect();

        let mut set = JoinSet::new();
        for (index, instance) in instances.into_iter().enumerate() {
            let ctx = self.ctx.task_context(&instance);
            let shared = Arc::clone(&task);
            set.spawn(async move {
                let outcome = shared.execute(&instance, &ctx).await;
                (index, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        slot.outcome = outcome;
                    }
                }
                Err(err) => warn!(error = %err, "instance task did not complete"),
            }
        }

        let any_failed = outcomes.iter().any(|entry| !entry.outcome.is_success());
        for failure in outcomes.iter().filter(|entry| !entry.outcome.is_success()) {
            warn!(instance = %failure.instance, outcome = %failure.outcome, "instance failed");
        }
        let state = if any_failed && !self.ctx.continue_on_error {
            FleetState::Aborted
        } else {
            FleetState::Completed
        };
        FleetReport {
            state,
            outcomes,
            skipped: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests;
