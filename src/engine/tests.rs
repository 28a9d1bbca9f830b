//! Tests for the engine facade.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::dispatch::{FleetMode, FleetState};
use crate::exec::{CommandOutput, Direction, TransferMethod};
use crate::provider::{Capabilities, Capability, Provider};
use crate::test_support::{FakeProvider, MemoryStore, ScriptedRunner, fleet_of};

const QUICK: PollSettings = PollSettings {
    interval: Duration::from_secs(1),
    timeout: Duration::from_secs(5),
};

struct Fixture {
    provider: Arc<FakeProvider>,
    store: Arc<MemoryStore>,
    runner: Arc<ScriptedRunner>,
    engine: Engine<MemoryStore, ScriptedRunner>,
}

#[fixture]
fn fixture() -> Fixture {
    let provider = Arc::new(FakeProvider::new("fake"));
    let store = Arc::new(MemoryStore::with_clusters(fleet_of([
        ("db", provider.managed("db.01", "10.0.0.1")),
        ("db", provider.managed("db.02", "10.0.0.2")),
        ("web", Instance::new("web-1", "10.0.1.1")),
    ])));
    let runner = Arc::new(ScriptedRunner::new());
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::clone(&provider) as Arc<dyn Provider>);
    let engine = Engine::new(Arc::clone(&store), Arc::clone(&runner), registry, "/work")
        .with_poll(QUICK);
    Fixture {
        provider,
        store,
        runner,
        engine,
    }
}

fn targets(runner: &ScriptedRunner) -> Vec<String> {
    runner
        .invocations()
        .iter()
        .filter_map(|invocation| {
            invocation
                .args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .find(|arg| arg.starts_with("root@"))
        })
        .collect()
}

#[rstest]
fn unknown_token_reports_listing(fixture: Fixture) {
    let err = fixture.engine.resolve("cache").expect_err("nothing matches");
    let EngineError::NotFound { token, listing } = err else {
        panic!("expected NotFound, got {err:?}");
    };
    assert_eq!(token, "cache");
    assert!(listing.contains("db.01"), "{listing}");
    assert!(listing.contains("web-1"), "{listing}");
}

#[rstest]
#[tokio::test]
async fn run_visits_cluster_members_in_order(fixture: Fixture) {
    fixture.runner.push_success();
    fixture.runner.push_success();

    let report = fixture
        .engine
        .run(
            "db",
            &[String::from("uptime")],
            BTreeMap::new(),
            DispatchContext::new(FleetMode::Sequential),
        )
        .await
        .expect("both succeed");

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(targets(&fixture.runner), ["root@10.0.0.1", "root@10.0.0.2"]);
}

#[rstest]
#[tokio::test]
async fn run_rejects_invalid_variable_names_before_connecting(fixture: Fixture) {
    let env = BTreeMap::from([(String::from("BAD-NAME"), String::from("x"))]);
    let err = fixture
        .engine
        .run(
            "all",
            &[String::from("env")],
            env,
            DispatchContext::new(FleetMode::Sequential),
        )
        .await
        .expect_err("invalid key");

    assert!(matches!(err, EngineError::Configuration(ref message) if message.contains("BAD-NAME")));
    assert!(fixture.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_instance_becomes_terminal_error_with_summary(fixture: Fixture) {
    fixture.runner.push_exit_code(3);

    let err = fixture
        .engine
        .run(
            "db",
            &[String::from("false")],
            BTreeMap::new(),
            DispatchContext::new(FleetMode::Sequential),
        )
        .await
        .expect_err("first instance fails");

    let EngineError::TerminalInstance {
        state,
        failed,
        summary,
    } = err
    else {
        panic!("expected TerminalInstance, got {err:?}");
    };
    assert_eq!(state, FleetState::Aborted);
    assert_eq!(failed, 1);
    assert!(summary.contains("db.01: exited with status 3"), "{summary}");
    assert!(summary.contains("not run: db.02"), "{summary}");
}

#[rstest]
#[tokio::test]
async fn pull_substitutes_instance_name_locally(fixture: Fixture) {
    fixture.runner.push_success();
    let transfer = FileTransfer {
        method: TransferMethod::Scp,
        direction: Direction::Pull,
        source: String::from("/var/log/syslog"),
        dest: String::from("logs/{instance}.log"),
        excludes: Vec::new(),
    };

    fixture
        .engine
        .transfer("web-1", transfer, DispatchContext::new(FleetMode::Sequential))
        .await
        .expect("pull succeeds");

    let invocations = fixture.runner.invocations();
    let args: Vec<String> = invocations
        .first()
        .expect("one transfer")
        .args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert!(
        args.ends_with(&[
            String::from("root@10.0.1.1:/var/log/syslog"),
            String::from("/work/logs/web-1.log"),
        ]),
        "{args:?}"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn reboot_cluster_then_wait_for_ssh(fixture: Fixture) {
    fixture.runner.push_success();
    fixture.runner.push_success();

    let report = fixture
        .engine
        .lifecycle(
            "db",
            LifecycleOperation::Reboot,
            true,
            DispatchContext::new(FleetMode::Sequential),
        )
        .await
        .expect("reboots succeed");

    assert_eq!(report.state, FleetState::Completed);
    assert_eq!(
        fixture.provider.calls(),
        [
            "reboot db.01",
            "describe db.01",
            "reboot db.02",
            "describe db.02"
        ]
    );
    assert_eq!(targets(&fixture.runner), ["root@10.0.0.1", "root@10.0.0.2"]);
}

#[rstest]
#[tokio::test]
async fn lifecycle_checks_every_instance_before_dispatch(fixture: Fixture) {
    let err = fixture
        .engine
        .lifecycle(
            "all",
            LifecycleOperation::Shutdown,
            false,
            DispatchContext::new(FleetMode::Parallel),
        )
        .await
        .expect_err("web-1 is not provider managed");

    assert!(matches!(err, EngineError::Configuration(ref message) if message.contains("web-1")));
    assert!(fixture.provider.calls().is_empty());
}

#[tokio::test]
async fn missing_capability_is_rejected_up_front() {
    let provider = Arc::new(
        FakeProvider::new("local").with_capabilities(Capabilities::all().without(Capability::Resize)),
    );
    let store = Arc::new(MemoryStore::with_clusters(fleet_of([(
        "dev",
        provider.managed("vm-1", "10.0.2.1"),
    )])));
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::clone(&provider) as Arc<dyn Provider>);
    let engine = Engine::new(store, Arc::new(ScriptedRunner::new()), registry, "/work");

    let err = engine
        .lifecycle(
            "vm-1",
            LifecycleOperation::Resize {
                size: String::from("8G"),
                skip_boot: false,
            },
            false,
            DispatchContext::new(FleetMode::Sequential),
        )
        .await
        .expect_err("resize unsupported");

    assert_eq!(
        err,
        EngineError::Configuration(String::from("provider local does not support resize"))
    );
    assert!(provider.calls().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_stores_the_instance_and_reports_readiness(fixture: Fixture) {
    fixture
        .runner
        .push_output(Some(255), "", "ssh: connect to host 192.0.2.10 port 22: Connection refused");
    fixture.runner.push_success();
    let spec = InstanceSpec {
        name: String::from("web-2"),
        cluster: String::from("web"),
        ..InstanceSpec::default()
    };

    let created = fixture
        .engine
        .create("fake", &spec, true)
        .await
        .expect("create succeeds");

    assert_eq!(created.instance.ip, "192.0.2.10");
    let readiness = created.readiness.expect("waited");
    assert_eq!(readiness.attempts, 2);
    assert_eq!(readiness.elapsed, DEFAULT_READINESS_DELAY);
    let snapshot = fixture.store.snapshot();
    let (cluster, stored) = snapshot.find("web-2").expect("stored");
    assert_eq!(cluster, "web");
    assert_eq!(stored.provider_name(), Some("fake"));
}

#[rstest]
#[tokio::test]
async fn create_rejects_taken_names_before_calling_provider(fixture: Fixture) {
    let spec = InstanceSpec {
        name: String::from("db.01"),
        cluster: String::from("web"),
        ..InstanceSpec::default()
    };
    let err = fixture
        .engine
        .create("fake", &spec, false)
        .await
        .expect_err("duplicate");
    assert!(matches!(err, EngineError::Configuration(_)));
    assert!(fixture.provider.calls().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn wait_ready_fails_when_deadline_passes(fixture: Fixture) {
    for _ in 0..4 {
        fixture.runner.push_for(
            "root@10.0.1.1",
            CommandOutput {
                code: Some(255),
                stdout: String::new(),
                stderr: String::from("Connection refused"),
            },
        );
    }

    let err = fixture
        .engine
        .wait_ready(
            "web-1",
            Some(Duration::from_secs(3)),
            DispatchContext::new(FleetMode::Sequential),
        )
        .await
        .expect_err("never ready");

    assert!(matches!(err, EngineError::TerminalInstance { failed: 1, .. }));
}

#[rstest]
fn import_and_remove_round_trip_through_the_store(fixture: Fixture) {
    fixture
        .engine
        .import("cache", Instance::new("redis-1", "10.0.3.1"))
        .expect("new name");
    assert!(fixture.engine.listing().expect("listing").contains("redis-1"));

    let duplicate = fixture
        .engine
        .import("cache", Instance::new("web-1", "10.0.3.2"))
        .expect_err("name taken");
    assert!(matches!(duplicate, EngineError::Configuration(_)));

    let removed = fixture.engine.remove("redis-1").expect("known");
    assert_eq!(removed.ip, "10.0.3.1");
    assert!(fixture.store.snapshot().cluster("cache").is_none());
    assert!(matches!(
        fixture.engine.remove("redis-1"),
        Err(EngineError::Configuration(_))
    ));
}

#[rstest]
#[tokio::test]
async fn bundled_scripts_are_streamed_to_bash(fixture: Fixture) {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let scripts = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    std::fs::write(scripts.join("deploy.sh"), "echo deployed\n").expect("write script");
    fixture.runner.push_success();
    let Fixture { runner, engine, .. } = fixture;
    let bundled = engine.with_scripts_dir(Some(scripts.clone()));

    bundled
        .run(
            "web-1",
            &[String::from("deploy.sh")],
            BTreeMap::new(),
            DispatchContext::new(FleetMode::Sequential),
        )
        .await
        .expect("script runs");

    let invocations = runner.invocations();
    let invocation = invocations.first().expect("one invocation");
    assert_eq!(invocation.stdin, Some(scripts.join("deploy.sh")));
    assert_eq!(
        invocation.args.last().map(|arg| arg.to_string_lossy().into_owned()),
        Some(String::from("bash -s"))
    );
}
