//! Shared fixtures for fleet dispatch BDD scenarios.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;

use overcast::test_support::{MemoryStore, ScriptedRunner, fleet_of};
use overcast::{Clusters, FleetMode, FleetReport, FleetState, Instance};
use rstest::fixture;
use thiserror::Error;

/// Simulated round trip for every scripted command, long enough for parallel
/// invocations to overlap.
pub const COMMAND_DELAY: Duration = Duration::from_millis(20);

pub const WEB_INSTANCES: [(&str, &str); 3] = [
    ("web-1", "10.0.2.1"),
    ("web-2", "10.0.2.2"),
    ("web-3", "10.0.2.3"),
];

#[derive(Clone, Debug)]
pub enum DispatchResult {
    Finished(FleetReport),
    Failed {
        state: FleetState,
        failed: usize,
        summary: String,
    },
    Rejected(String),
}

/// Scenario state shared by reference between steps. Fields that steps
/// change sit behind cells.
#[derive(Debug)]
pub struct DispatchWorld {
    pub runner: Arc<ScriptedRunner>,
    pub store: Arc<MemoryStore>,
    pub mode: Cell<FleetMode>,
    pub continue_on_error: Cell<bool>,
    pub outcome: RefCell<Option<DispatchResult>>,
}

#[derive(Clone, Debug, Error)]
pub enum DispatchTestError {
    #[error("invalid dispatch fixture: {0}")]
    Fixture(String),
}

#[fixture]
pub fn dispatch_world() -> DispatchWorld {
    DispatchWorld {
        runner: Arc::new(ScriptedRunner::new().with_delay(COMMAND_DELAY).succeeding()),
        store: Arc::new(MemoryStore::default()),
        mode: Cell::new(FleetMode::Sequential),
        continue_on_error: Cell::new(false),
        outcome: RefCell::new(None),
    }
}

/// Builds the `web` cluster in declaration order.
pub fn web_fleet() -> Clusters {
    fleet_of(WEB_INSTANCES.map(|(name, ip)| ("web", Instance::new(name, ip))))
}

/// Returns the ssh target used for `name`.
pub fn target_for(name: &str) -> Result<String, DispatchTestError> {
    WEB_INSTANCES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, ip)| format!("root@{ip}"))
        .ok_or_else(|| DispatchTestError::Fixture(format!("unknown instance {name}")))
}

/// Maps recorded ssh targets back to instance names, in invocation order.
pub fn contacted(runner: &ScriptedRunner) -> Vec<String> {
    runner
        .invocations()
        .iter()
        .filter_map(|invocation| {
            invocation.args.iter().find_map(|arg| {
                let rendered = arg.to_string_lossy();
                WEB_INSTANCES
                    .iter()
                    .find(|(_, ip)| rendered == format!("root@{ip}"))
                    .map(|(name, _)| (*name).to_owned())
            })
        })
        .collect()
}
