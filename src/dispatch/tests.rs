//! Unit tests for sequential and parallel dispatch.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::exec::{
    ColorSlot, RemoteCommand, RemoteCommandRunner, RetryPolicy, SshSettings, TransferRunner,
};
use crate::test_support::ScriptedRunner;

/// Task that records start/finish events and fails scripted instances.
#[derive(Debug, Default)]
struct RecordingTask {
    failing: HashSet<String>,
    events: Mutex<Vec<String>>,
    slots: Mutex<Vec<(String, Option<ColorSlot>)>>,
}

impl RecordingTask {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|name| (*name).to_owned()).collect(),
            ..Self::default()
        }
    }

    fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn slots(&self) -> Vec<(String, Option<ColorSlot>)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: String) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl InstanceTask for RecordingTask {
    fn execute<'a>(&'a self, instance: &'a Instance, ctx: &'a TaskContext) -> TaskFuture<'a> {
        Box::pin(async move {
            self.slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((instance.name.clone(), ctx.output.slot()));
            self.record(format!("start {}", instance.name));
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.record(format!("end {}", instance.name));
            if self.failing.contains(&instance.name) {
                ExecutionOutcome::NonZeroExit(Some(1))
            } else {
                ExecutionOutcome::Success
            }
        })
    }
}

#[fixture]
fn instances() -> Vec<Instance> {
    ["web-1", "web-2", "web-3"]
        .iter()
        .enumerate()
        .map(|(index, name)| Instance::new(*name, format!("10.0.0.{index}")))
        .collect()
}

fn names(report: &FleetReport) -> Vec<&str> {
    report
        .outcomes
        .iter()
        .map(|entry| entry.instance.as_str())
        .collect()
}

#[rstest]
#[tokio::test]
async fn sequential_runs_in_order_without_overlap(instances: Vec<Instance>) {
    let task = Arc::new(RecordingTask::default());
    let dispatcher = FleetDispatcher::new(DispatchContext::new(FleetMode::Sequential));
    let report = dispatcher.dispatch(instances, Arc::clone(&task)).await;

    assert!(report.is_success());
    assert_eq!(
        task.events(),
        [
            "start web-1",
            "end web-1",
            "start web-2",
            "end web-2",
            "start web-3",
            "end web-3",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn sequential_failure_aborts_remaining_instances(instances: Vec<Instance>) {
    let task = Arc::new(RecordingTask::failing(&["web-2"]));
    let dispatcher = FleetDispatcher::new(DispatchContext::new(FleetMode::Sequential));
    let report = dispatcher.dispatch(instances, Arc::clone(&task)).await;

    assert_eq!(report.state, FleetState::Aborted);
    assert_eq!(names(&report), ["web-1", "web-2"]);
    assert_eq!(report.skipped, ["web-3"]);
    assert!(!task.events().contains(&String::from("start web-3")));
    assert!(report.summary().contains("web-2: exited with status 1"));
}

#[rstest]
#[tokio::test]
async fn continue_on_error_runs_everything_but_reports_failure(instances: Vec<Instance>) {
    let task = Arc::new(RecordingTask::failing(&["web-1"]));
    let ctx = DispatchContext::new(FleetMode::Sequential).continue_on_error(true);
    let report = FleetDispatcher::new(ctx)
        .dispatch(instances, Arc::clone(&task))
        .await;

    assert_eq!(report.state, FleetState::Completed);
    assert_eq!(names(&report), ["web-1", "web-2", "web-3"]);
    assert!(!report.is_success());
    assert_eq!(report.failures().count(), 1);
}

#[rstest]
#[tokio::test]
async fn parallel_runs_all_instances_concurrently(instances: Vec<Instance>) {
    let task = Arc::new(RecordingTask::default());
    let dispatcher = FleetDispatcher::new(DispatchContext::new(FleetMode::Parallel));
    let report = dispatcher.dispatch(instances, Arc::clone(&task)).await;

    assert!(report.is_success());
    assert_eq!(names(&report), ["web-1", "web-2", "web-3"]);
    let events = task.events();
    let first_end = events
        .iter()
        .position(|event| event.starts_with("end"))
        .expect("some instance finished");
    assert_eq!(first_end, 3, "all instances start before any finishes: {events:?}");
}

#[rstest]
#[tokio::test]
async fn parallel_assigns_distinct_cyclic_colors() {
    let fleet: Vec<Instance> = (0..8)
        .map(|index| Instance::new(format!("node-{index}"), "10.0.0.1"))
        .collect();
    let task = Arc::new(RecordingTask::default());
    FleetDispatcher::new(DispatchContext::new(FleetMode::Parallel))
        .dispatch(fleet, Arc::clone(&task))
        .await;

    let by_name: BTreeMap<String, Option<ColorSlot>> = task.slots().into_iter().collect();
    let slots: Vec<usize> = (0..8)
        .filter_map(|index| by_name.get(&format!("node-{index}")).copied().flatten())
        .map(ColorSlot::index)
        .collect();
    assert_eq!(slots, [0, 1, 2, 3, 4, 5, 0, 1]);
}

#[rstest]
#[tokio::test]
async fn parallel_failure_does_not_cancel_siblings(instances: Vec<Instance>) {
    let task = Arc::new(RecordingTask::failing(&["web-1"]));
    let report = FleetDispatcher::new(DispatchContext::new(FleetMode::Parallel))
        .dispatch(instances, Arc::clone(&task))
        .await;

    assert_eq!(report.state, FleetState::Aborted);
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(
        task.events()
            .iter()
            .filter(|event| event.starts_with("end"))
            .count(),
        3
    );
}

#[rstest]
#[tokio::test]
async fn machine_readable_output_is_unprefixed(instances: Vec<Instance>) {
    let task = Arc::new(RecordingTask::default());
    let ctx = DispatchContext::new(FleetMode::Sequential).machine_readable(true);
    FleetDispatcher::new(ctx)
        .dispatch(instances, Arc::clone(&task))
        .await;
    assert!(task.slots().iter().all(|(_, slot)| slot.is_none()));
}

fn work_task(runner: &Arc<ScriptedRunner>, unit: WorkUnit) -> Arc<WorkUnitTask<ScriptedRunner>> {
    Arc::new(WorkUnitTask::new(
        unit,
        RemoteCommandRunner::new(
            Arc::clone(runner),
            SshSettings::default(),
            RetryPolicy::ssh_transient(),
        ),
        TransferRunner::new(Arc::clone(runner), SshSettings::default(), "/work"),
    ))
}

fn steps(commands: &[&str]) -> WorkUnit {
    WorkUnit::Commands {
        steps: commands
            .iter()
            .map(|command| RemoteCommand::Literal((*command).to_owned()))
            .collect(),
        env: BTreeMap::new(),
    }
}

#[rstest]
#[tokio::test]
async fn first_failing_step_ends_the_instance(instances: Vec<Instance>) {
    let runner = Arc::new(ScriptedRunner::new());
    runner.push_success();
    runner.push_exit_code(2);
    let task = work_task(&runner, steps(&["apt-get update", "apt-get upgrade", "reboot"]));

    let single: Vec<Instance> = instances.into_iter().take(1).collect();
    let report = FleetDispatcher::new(DispatchContext::new(FleetMode::Sequential))
        .dispatch(single, task)
        .await;

    assert_eq!(
        report.outcomes.first().map(|entry| entry.outcome.clone()),
        Some(ExecutionOutcome::NonZeroExit(Some(2)))
    );
    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
#[tokio::test]
async fn dry_run_spawns_nothing(instances: Vec<Instance>) {
    let runner = Arc::new(ScriptedRunner::new());
    let task = work_task(&runner, steps(&["uptime"]));
    let ctx = DispatchContext::new(FleetMode::Parallel).dry_run(true);
    let report = FleetDispatcher::new(ctx).dispatch(instances, task).await;

    assert!(report.is_success());
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn spawn_errors_become_errored_outcomes(instances: Vec<Instance>) {
    let runner = Arc::new(ScriptedRunner::new());
    let task = work_task(&runner, steps(&["uptime"]));
    let report = FleetDispatcher::new(DispatchContext::new(FleetMode::Sequential))
        .dispatch(instances, task)
        .await;

    assert_eq!(report.state, FleetState::Aborted);
    assert!(matches!(
        report.outcomes.first().map(|entry| &entry.outcome),
        Some(ExecutionOutcome::Errored(_))
    ));
}
