//! BDD scenarios for fleet dispatch.

use rstest_bdd_macros::scenario;

use super::test_helpers::{DispatchWorld, dispatch_world};

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Visit cluster members one at a time in order"
)]
fn scenario_sequential_order(dispatch_world: DispatchWorld) {
    drop(dispatch_world);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Abort the operation at the first failure"
)]
fn scenario_abort_on_failure(dispatch_world: DispatchWorld) {
    drop(dispatch_world);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Record failures and keep going"
)]
fn scenario_continue_on_error(dispatch_world: DispatchWorld) {
    drop(dispatch_world);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Drive every instance at once in parallel mode"
)]
fn scenario_parallel(dispatch_world: DispatchWorld) {
    drop(dispatch_world);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Give up on an unreachable instance after the retry budget"
)]
fn scenario_retry_budget(dispatch_world: DispatchWorld) {
    drop(dispatch_world);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Report the fleet listing when nothing matches"
)]
fn scenario_not_found(dispatch_world: DispatchWorld) {
    drop(dispatch_world);
}
