//! Work units: what the dispatcher runs on each instance.

use std::collections::BTreeMap;

use crate::exec::{
    CommandRunner, ExecutionOutcome, FileTransfer, Invocation, OutputPrefixer, OutputStream,
    RemoteCommand, RemoteCommandRunner, TransferRunner,
};
use crate::fleet::Instance;

use super::{InstanceTask, TaskContext, TaskFuture};

/// Immutable description of the work for one fleet operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkUnit {
    /// Remote commands or scripts executed in order.
    Commands {
        /// Steps run strictly in order; the first failure ends the instance.
        steps: Vec<RemoteCommand>,
        /// Variables exported before each step.
        env: BTreeMap<String, String>,
    },
    /// One file transfer.
    Transfer(FileTransfer),
}

/// Executes a [`WorkUnit`] on each instance it is dispatched to.
#[derive(Debug)]
pub struct WorkUnitTask<R: CommandRunner + 'static> {
    unit: WorkUnit,
    commands: RemoteCommandRunner<R>,
    transfers: TransferRunner<R>,
}

impl<R: CommandRunner + 'static> WorkUnitTask<R> {
    /// Binds `unit` to the runners that execute it.
    #[must_use]
    pub const fn new(
        unit: WorkUnit,
        commands: RemoteCommandRunner<R>,
        transfers: TransferRunner<R>,
    ) -> Self {
        Self {
            unit,
            commands,
            transfers,
        }
    }

    async fn run(&self, instance: &Instance, ctx: &TaskContext) -> ExecutionOutcome {
        match self.unit {
            WorkUnit::Commands { ref steps, ref env } => {
                for step in steps {
                    let outcome = if ctx.dry_run {
                        announce(&ctx.output, &self.commands.invocation(instance, step, env))
                    } else {
                        self.commands
                            .execute(instance, step, env, &ctx.output)
                            .await
                            .unwrap_or_else(|err| ExecutionOutcome::Errored(err.to_string()))
                    };
                    if !outcome.is_success() {
                        return outcome;
                    }
                }
                ExecutionOutcome::Success
            }
            WorkUnit::Transfer(ref transfer) => {
                if ctx.dry_run {
                    return announce(&ctx.output, &self.transfers.invocation(instance, transfer));
                }
                self.transfers
                    .execute(instance, transfer, &ctx.output)
                    .await
                    .unwrap_or_else(|err| ExecutionOutcome::Errored(err.to_string()))
            }
        }
    }
}

fn announce(output: &OutputPrefixer, invocation: &Invocation) -> ExecutionOutcome {
    output.line(
        OutputStream::Stdout,
        &format!("would run: {}", invocation.command_line()),
    );
    ExecutionOutcome::Success
}

impl<R: CommandRunner + 'static> InstanceTask for WorkUnitTask<R> {
    fn execute<'a>(&'a self, instance: &'a Instance, ctx: &'a TaskContext) -> TaskFuture<'a> {
        Box::pin(self.run(instance, ctx))
    }
}
