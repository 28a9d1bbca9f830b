//! Unit tests for the `overcast` CLI binary implementation.

use clap::Parser;
use rstest::rstest;

use super::*;
use overcast::dispatch::FleetState;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).expect("arguments parse")
}

#[test]
fn global_flags_build_the_dispatch_context() {
    let cli = parse(&["overcast", "run", "db", "uptime", "--parallel", "--continue", "--dry-run"]);
    let ctx = dispatch_context(&cli.fleet);
    assert_eq!(ctx.mode, FleetMode::Parallel);
    assert!(ctx.continue_on_error);
    assert!(ctx.dry_run);
    assert!(!ctx.machine_readable);
}

#[test]
fn run_collects_steps_and_env_pairs() {
    let cli = parse(&[
        "overcast", "run", "all", "setup.sh", "systemctl restart app", "--env", "MODE=prod",
        "--env", "EMPTY=",
    ]);
    let Command::Run(args) = cli.command else {
        panic!("expected run");
    };
    assert_eq!(args.commands, ["setup.sh", "systemctl restart app"]);
    assert_eq!(
        args.env,
        [
            (String::from("MODE"), String::from("prod")),
            (String::from("EMPTY"), String::new())
        ]
    );
}

#[rstest]
#[case("novalue")]
#[case("=value")]
fn malformed_env_pairs_are_rejected(#[case] raw: &str) {
    assert!(Cli::try_parse_from(["overcast", "run", "all", "env", "--env", raw]).is_err());
}

#[test]
fn exclude_requires_rsync() {
    assert!(Cli::try_parse_from(["overcast", "push", "web", "a", "b", "--exclude", ".git"]).is_err());
}

#[test]
fn pull_builds_rsync_transfer() {
    let cli = parse(&[
        "overcast", "pull", "db", "/var/backups", "backups/{instance}", "--rsync", "--exclude", "*.tmp",
    ]);
    let Command::Pull(args) = cli.command else {
        panic!("expected pull");
    };
    let transfer = file_transfer(args, Direction::Pull);
    assert_eq!(transfer.method, TransferMethod::Rsync);
    assert_eq!(transfer.source, "/var/backups");
    assert_eq!(transfer.dest, "backups/{instance}");
    assert_eq!(transfer.excludes, ["*.tmp"]);
}

#[test]
fn import_maps_connection_details() {
    let cli = parse(&[
        "overcast", "import", "legacy", "203.0.113.7", "--cluster", "old", "--port", "2222", "--user",
        "admin", "--ssh-key", "/keys/id_ed25519",
    ]);
    let Command::Import(args) = cli.command else {
        panic!("expected import");
    };
    let instance = imported_instance(args);
    assert_eq!(instance.ssh_port, 2222);
    assert_eq!(instance.user, "admin");
    assert_eq!(instance.ssh_key.as_deref().map(|path| path.as_str()), Some("/keys/id_ed25519"));
    assert!(instance.password.is_none());
}

#[test]
fn create_defaults_to_default_cluster() {
    let cli = parse(&["overcast", "create", "scaleway", "web-9", "--size", "DEV1-M"]);
    let Command::Create(args) = cli.command else {
        panic!("expected create");
    };
    assert!(!args.no_wait);
    let spec = instance_spec(args);
    assert_eq!(spec.cluster, "default");
    assert_eq!(spec.size.as_deref(), Some("DEV1-M"));
}

#[test]
fn write_error_appends_listing_and_summary() {
    let mut buf = Vec::new();
    write_error(
        &mut buf,
        &EngineError::NotFound {
            token: String::from("cache"),
            listing: String::from("db\n  db.01 (root@10.0.0.1:22, -)\n"),
        },
    );
    let rendered = String::from_utf8(buf).expect("utf8");
    assert!(rendered.starts_with("no instance or cluster matches cache\n"), "{rendered}");
    assert!(rendered.contains("db.01"), "{rendered}");

    let mut failures = Vec::new();
    write_error(
        &mut failures,
        &EngineError::TerminalInstance {
            state: FleetState::Aborted,
            failed: 1,
            summary: String::from("web-2: exited with status 1\n"),
        },
    );
    let summary = String::from_utf8(failures).expect("utf8");
    assert!(summary.contains("web-2: exited with status 1"), "{summary}");
}
