//! Binary entry point for the overcast CLI.

use std::collections::BTreeMap;
use std::env;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use overcast::config::EngineConfig;
use overcast::dispatch::{DispatchContext, FleetMode};
use overcast::engine::Engine;
use overcast::error::EngineError;
use overcast::exec::{Direction, FileTransfer, ProcessCommandRunner, TransferMethod, expand_tilde};
use overcast::fleet::Instance;
use overcast::lifecycle::LifecycleOperation;
use overcast::provider::multipass::MultipassProvider;
use overcast::provider::scaleway::{self, ScalewayConfig, ScalewayProvider, ScalewayProviderError};
use overcast::provider::{InstanceSpec, ProviderRegistry};
use overcast::store::{FleetStore, JsonFleetStore};

mod cli;

use cli::{Cli, Command, CreateCommand, FleetFlags, ImportCommand, TransferCommand};

/// Environment variable consulted before `RUST_LOG` for the log filter.
const LOG_ENV: &str = "OVERCAST_LOG";

type CliEngine = Engine<JsonFleetStore, ProcessCommandRunner>;

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr().lock(), &err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = env::var(LOG_ENV)
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), EngineError> {
    let config = EngineConfig::load_without_cli_args()?;
    config.validate()?;
    let engine = build_engine(&config)?;
    let ctx = dispatch_context(&cli.fleet);

    match cli.command {
        Command::Run(args) => {
            let env: BTreeMap<String, String> = args.env.into_iter().collect();
            engine.run(&args.name, &args.commands, env, ctx).await?;
        }
        Command::Push(args) => {
            let name = args.name.clone();
            engine
                .transfer(&name, file_transfer(args, Direction::Push), ctx)
                .await?;
        }
        Command::Pull(args) => {
            let name = args.name.clone();
            engine
                .transfer(&name, file_transfer(args, Direction::Pull), ctx)
                .await?;
        }
        Command::Boot(args) => {
            engine
                .lifecycle(&args.name, LifecycleOperation::Boot, args.wait, ctx)
                .await?;
        }
        Command::Shutdown(args) => {
            engine
                .lifecycle(&args.name, LifecycleOperation::Shutdown, false, ctx)
                .await?;
        }
        Command::Reboot(args) => {
            engine
                .lifecycle(&args.name, LifecycleOperation::Reboot, args.wait, ctx)
                .await?;
        }
        Command::Destroy(args) => {
            engine
                .lifecycle(&args.name, LifecycleOperation::Destroy, false, ctx)
                .await?;
        }
        Command::Resize(args) => {
            let operation = LifecycleOperation::Resize {
                size: args.size,
                skip_boot: args.skip_boot,
            };
            engine
                .lifecycle(&args.name, operation, args.wait, ctx)
                .await?;
        }
        Command::Create(args) => create(&engine, args, ctx.dry_run).await?,
        Command::Import(args) => {
            let cluster = args.cluster.clone();
            engine.import(&cluster, imported_instance(args))?;
        }
        Command::Remove(args) => {
            let removed = engine.remove(&args.name)?;
            writeln!(io::stdout().lock(), "removed {}", removed.name).ok();
        }
        Command::Wait(args) => {
            engine
                .wait_ready(&args.name, args.timeout.map(Duration::from_secs), ctx)
                .await?;
        }
        Command::List => {
            write!(io::stdout().lock(), "{}", engine.listing()?).ok();
        }
    }
    Ok(())
}

async fn create(engine: &CliEngine, args: CreateCommand, dry_run: bool) -> Result<(), EngineError> {
    let provider = args.provider.clone();
    let wait = !args.no_wait;
    let spec = instance_spec(args);
    if dry_run {
        writeln!(
            io::stdout().lock(),
            "would create {} in {} via {provider}",
            spec.name,
            spec.cluster
        )
        .ok();
        return Ok(());
    }

    let created = engine.create(&provider, &spec, wait).await?;
    let mut out = io::stdout().lock();
    writeln!(
        out,
        "created {} ({})",
        created.instance.name,
        created.instance.ssh_target()
    )
    .ok();
    if let Some(readiness) = created.readiness {
        writeln!(
            out,
            "ready after {:.1}s ({} attempts)",
            readiness.elapsed.as_secs_f64(),
            readiness.attempts
        )
        .ok();
    }
    Ok(())
}

fn build_engine(config: &EngineConfig) -> Result<CliEngine, EngineError> {
    let store = Arc::new(JsonFleetStore::new(config.config_dir()));
    let runner = Arc::new(ProcessCommandRunner);
    let registry = build_registry(&store, &runner, config)?;
    let cwd = env::current_dir()
        .map_err(|err| EngineError::Configuration(format!("cannot read working directory: {err}")))?;
    let cwd_utf8 = Utf8PathBuf::from_path_buf(cwd).map_err(|path| {
        EngineError::Configuration(format!("working directory is not UTF-8: {}", path.display()))
    })?;
    Ok(Engine::new(store, runner, registry, cwd_utf8).with_config(config))
}

fn build_registry(
    store: &JsonFleetStore,
    runner: &Arc<ProcessCommandRunner>,
    config: &EngineConfig,
) -> Result<ProviderRegistry, EngineError> {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(MultipassProvider::new(
        Arc::clone(runner),
        config.multipass_bin.clone(),
        config.config_dir(),
    )));

    let variables = store.variables()?;
    let scaleway = ScalewayConfig::load_without_cli_args()
        .map(|loaded| loaded.with_variables(&variables))
        .map_err(ScalewayProviderError::from)
        .and_then(ScalewayProvider::new);
    match scaleway {
        Ok(provider) => registry.register(Arc::new(provider)),
        Err(err) => {
            debug!(error = %err, "scaleway provider unavailable");
            registry.mark_unavailable(scaleway::PROVIDER_NAME, err.to_string());
        }
    }
    Ok(registry)
}

fn dispatch_context(flags: &FleetFlags) -> DispatchContext {
    let mode = if flags.parallel {
        FleetMode::Parallel
    } else {
        FleetMode::Sequential
    };
    DispatchContext::new(mode)
        .continue_on_error(flags.continue_on_error)
        .machine_readable(flags.machine_readable)
        .dry_run(flags.dry_run)
}

fn file_transfer(args: TransferCommand, direction: Direction) -> FileTransfer {
    FileTransfer {
        method: if args.rsync {
            TransferMethod::Rsync
        } else {
            TransferMethod::Scp
        },
        direction,
        source: args.source,
        dest: args.dest,
        excludes: args.exclude,
    }
}

fn instance_spec(args: CreateCommand) -> InstanceSpec {
    InstanceSpec {
        name: args.name,
        cluster: args.cluster,
        size: args.size,
        image: args.image,
        region: args.region,
        ssh_key: args.ssh_key.as_deref().map(expanded_path),
        ssh_public_key: args.ssh_pub_key.as_deref().map(expanded_path),
        user: args.user,
    }
}

fn imported_instance(args: ImportCommand) -> Instance {
    let mut instance = Instance::new(args.name, args.ip);
    instance.ssh_port = args.port;
    instance.user = args.user;
    instance.ssh_key = args.ssh_key.as_deref().map(expanded_path);
    instance.password = args.password;
    instance
}

fn expanded_path(raw: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(expand_tilde(raw))
}

fn write_error(mut target: impl Write, err: &EngineError) {
    writeln!(target, "{err}").ok();
    match err {
        EngineError::NotFound { listing, .. } => {
            write!(target, "{listing}").ok();
        }
        EngineError::TerminalInstance { summary, .. } => {
            write!(target, "{summary}").ok();
        }
        _ => {}
    }
}

#[cfg(test)]
mod main_tests;
