//! BDD step definitions for fleet dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use overcast::exec::{CommandOutput, SSH_CONNECTION_FAILURE_CODE};
use overcast::{
    DispatchContext, Engine, EngineError, FleetMode, FleetState, FleetStore, ProviderRegistry,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    DispatchResult, DispatchTestError, DispatchWorld, contacted, target_for, web_fleet,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] DispatchTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a web cluster of three instances")]
fn web_cluster(dispatch_world: &DispatchWorld) -> Result<(), StepError> {
    dispatch_world
        .store
        .save_clusters(&web_fleet())
        .map_err(|err| StepError::Assertion(format!("seed fleet: {err}")))
}

#[given("\"{name}\" exits with status \"{code}\"")]
fn instance_exits_with(
    dispatch_world: &DispatchWorld,
    name: String,
    code: i32,
) -> Result<(), StepError> {
    let target = target_for(&name)?;
    dispatch_world.runner.push_for(
        &target,
        CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
        },
    );
    Ok(())
}

#[given("\"{name}\" is unreachable")]
fn instance_unreachable(dispatch_world: &DispatchWorld, name: String) -> Result<(), StepError> {
    let target = target_for(&name)?;
    for _ in 0..8 {
        dispatch_world.runner.push_for(
            &target,
            CommandOutput {
                code: Some(SSH_CONNECTION_FAILURE_CODE),
                stdout: String::new(),
                stderr: format!("ssh: connect to host {target} port 22: No route to host"),
            },
        );
    }
    Ok(())
}

#[given("continue-on-error is enabled")]
fn continue_on_error(dispatch_world: &DispatchWorld) {
    dispatch_world.continue_on_error.set(true);
}

#[given("parallel mode is enabled")]
fn parallel_mode(dispatch_world: &DispatchWorld) {
    dispatch_world.mode.set(FleetMode::Parallel);
}

#[when("I run \"{command}\" on \"{token}\"")]
fn run_command(
    dispatch_world: &DispatchWorld,
    command: String,
    token: String,
) -> Result<(), StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let engine = Engine::new(
        Arc::clone(&dispatch_world.store),
        Arc::clone(&dispatch_world.runner),
        ProviderRegistry::new(),
        "/work",
    );
    let ctx = DispatchContext::new(dispatch_world.mode.get())
        .continue_on_error(dispatch_world.continue_on_error.get());
    let steps = [command];
    let result = runtime.block_on(async { engine.run(&token, &steps, BTreeMap::new(), ctx).await });
    let outcome = match result {
        Ok(report) => DispatchResult::Finished(report),
        Err(EngineError::TerminalInstance {
            state,
            failed,
            summary,
        }) => DispatchResult::Failed {
            state,
            failed,
            summary,
        },
        Err(other) => DispatchResult::Rejected(other.to_string()),
    };
    dispatch_world.outcome.replace(Some(outcome));
    Ok(())
}

#[then("the operation succeeds")]
fn operation_succeeds(dispatch_world: &DispatchWorld) -> Result<(), StepError> {
    match *dispatch_world.outcome.borrow() {
        Some(DispatchResult::Finished(ref report)) if report.is_success() => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected success, got {other:?}"
        ))),
    }
}

#[then("the operation is aborted")]
fn operation_aborted(dispatch_world: &DispatchWorld) -> Result<(), StepError> {
    match *dispatch_world.outcome.borrow() {
        Some(DispatchResult::Failed {
            state: FleetState::Aborted,
            ..
        }) => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected an aborted operation, got {other:?}"
        ))),
    }
}

#[then("the operation completes with \"{count}\" failure")]
fn operation_completes_with_failures(
    dispatch_world: &DispatchWorld,
    count: usize,
) -> Result<(), StepError> {
    match *dispatch_world.outcome.borrow() {
        Some(DispatchResult::Failed {
            state: FleetState::Completed,
            failed,
            ..
        }) if failed == count => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected completion with {count} failure(s), got {other:?}"
        ))),
    }
}

#[then("the operation is rejected mentioning \"{text}\"")]
fn operation_rejected(dispatch_world: &DispatchWorld, text: String) -> Result<(), StepError> {
    match *dispatch_world.outcome.borrow() {
        Some(DispatchResult::Rejected(ref message)) if message.contains(text.as_str()) => Ok(()),
        ref other => Err(StepError::Assertion(format!(
            "expected rejection mentioning {text}, got {other:?}"
        ))),
    }
}

#[then("the instances were contacted in order \"{names}\"")]
fn contacted_in_order(dispatch_world: &DispatchWorld, names: String) -> Result<(), StepError> {
    let expected: Vec<String> = names.split(',').map(|name| name.trim().to_owned()).collect();
    let actual = contacted(&dispatch_world.runner);
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected contact order {expected:?}, got {actual:?}"
        )))
    }
}

#[then("the peak concurrency is \"{count}\"")]
fn peak_concurrency(dispatch_world: &DispatchWorld, count: usize) -> Result<(), StepError> {
    let peak = dispatch_world.runner.max_concurrency();
    if peak == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} concurrent command(s), observed {peak}"
        )))
    }
}

#[then("the summary mentions \"{text}\"")]
fn summary_mentions(dispatch_world: &DispatchWorld, text: String) -> Result<(), StepError> {
    let outcome = dispatch_world.outcome.borrow();
    let Some(DispatchResult::Failed { ref summary, .. }) = *outcome else {
        return Err(StepError::Assertion(String::from(
            "expected a failed operation with a summary",
        )));
    };
    if summary.contains(text.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "summary {summary:?} does not mention {text:?}"
        )))
    }
}

#[then("\"{name}\" was attempted \"{count}\" times")]
fn attempted_times(
    dispatch_world: &DispatchWorld,
    name: String,
    count: usize,
) -> Result<(), StepError> {
    let attempts = contacted(&dispatch_world.runner)
        .iter()
        .filter(|contact| **contact == name)
        .count();
    if attempts == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} attempts against {name}, observed {attempts}"
        )))
    }
}

#[then("no command ran")]
fn no_command_ran(dispatch_world: &DispatchWorld) -> Result<(), StepError> {
    let invocations = dispatch_world.runner.invocations();
    if invocations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no invocations, got {}",
            invocations.len()
        )))
    }
}
