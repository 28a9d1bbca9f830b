//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::exec::{
    CommandOutput, CommandRunner, ExecError, Invocation, OutputPrefixer, OutputStream,
    RunnerFuture,
};
use crate::fleet::{Clusters, FleetError, Instance, ProviderMetadata};
use crate::provider::{
    Capabilities, InstanceSpec, InstanceStatus, PowerAction, PowerState, Provider, ProviderError,
    ProviderFuture,
};
use crate::store::{FleetStore, StoreError};

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<CommandOutput>,
    routed: Vec<(String, VecDeque<CommandOutput>)>,
    fallback: Option<CommandOutput>,
    invocations: Vec<Invocation>,
    running: usize,
    max_running: usize,
}

impl Script {
    fn next_for(&mut self, invocation: &Invocation) -> Option<CommandOutput> {
        let rendered: Vec<String> = invocation
            .args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        for (needle, queue) in &mut self.routed {
            if rendered.iter().any(|arg| arg.contains(needle.as_str()))
                && let Some(output) = queue.pop_front()
            {
                return Some(output);
            }
        }
        self.responses
            .pop_front()
            .or_else(|| self.fallback.clone())
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Responses can be routed to invocations mentioning a given argument, so
/// parallel dispatch stays deterministic.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<Script>,
    delay: Option<Duration>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` inside every invocation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answers every unscripted invocation with success.
    #[must_use]
    pub fn succeeding(self) -> Self {
        self.lock().fallback = Some(success());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    /// Highest number of invocations observed in flight at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_running
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.lock().responses.push_back(success());
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock().responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Queues a response for invocations with an argument containing
    /// `needle`, ahead of the shared queue.
    pub fn push_for(&self, needle: &str, output: CommandOutput) {
        let mut script = self.lock();
        if let Some((_, queue)) = script.routed.iter_mut().find(|(key, _)| key == needle) {
            queue.push_back(output);
            return;
        }
        script
            .routed
            .push((needle.to_owned(), VecDeque::from([output])));
    }
}

/// Output with exit code zero and no text.
#[must_use]
pub const fn success() -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
        output: &'a OutputPrefixer,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let next = {
                let mut script = self.lock();
                script.invocations.push(invocation.clone());
                script.running = script.running.saturating_add(1);
                script.max_running = script.max_running.max(script.running);
                script.next_for(invocation)
            };
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            {
                let mut script = self.lock();
                script.running = script.running.saturating_sub(1);
            }
            let result = next.ok_or_else(|| ExecError::Spawn {
                program: invocation.program.clone(),
                message: String::from("no scripted response available"),
            })?;
            for line in result.stdout.lines() {
                output.line(OutputStream::Stdout, line);
            }
            for line in result.stderr.lines() {
                output.line(OutputStream::Stderr, line);
            }
            Ok(result)
        })
    }
}

#[derive(Debug, Default)]
struct FakeState {
    scripted: BTreeMap<String, VecDeque<InstanceStatus>>,
    current: BTreeMap<String, InstanceStatus>,
    calls: Vec<String>,
    failing: BTreeSet<String>,
}

/// In-memory provider recording every primitive it receives.
///
/// `describe` returns scripted statuses first, then the state implied by the
/// last accepted request. Calls are recorded as `"<primitive> <instance>"`.
#[derive(Debug)]
pub struct FakeProvider {
    name: String,
    capabilities: Capabilities,
    created_ip: String,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    /// Creates a provider supporting every capability.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::all(),
            created_ip: String::from("192.0.2.10"),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Restricts the advertised capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a status returned by the next `describe` of `instance`.
    pub fn push_status(&self, instance: &str, status: InstanceStatus) {
        self.lock()
            .scripted
            .entry(instance.to_owned())
            .or_default()
            .push_back(status);
    }

    /// Sets the steady-state status of `instance`.
    pub fn set_status(&self, instance: &str, status: InstanceStatus) {
        self.lock().current.insert(instance.to_owned(), status);
    }

    /// Makes every primitive named `call` (for example `"destroy web-1"`)
    /// fail with an API error.
    pub fn fail_on(&self, call: &str) {
        self.lock().failing.insert(call.to_owned());
    }

    /// Returns recorded calls in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Builds an instance managed by this provider.
    #[must_use]
    pub fn managed(&self, name: &str, ip: &str) -> Instance {
        let mut instance = Instance::new(name, ip);
        instance.provider = Some(ProviderMetadata::new(self.name.clone()).with_field("id", name));
        instance
    }

    fn record(&self, call: String, next: Option<(&str, InstanceStatus)>) -> Result<(), ProviderError> {
        let mut state = self.lock();
        let failed = state.failing.contains(&call);
        state.calls.push(call.clone());
        if failed {
            return Err(ProviderError::Api {
                provider: self.name.clone(),
                message: format!("{call} rejected"),
            });
        }
        if let Some((instance, status)) = next {
            state.current.insert(instance.to_owned(), status);
        }
        Ok(())
    }
}

impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn describe<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            self.record(format!("describe {}", instance.name), None)?;
            let mut state = self.lock();
            if let Some(status) = state
                .scripted
                .get_mut(&instance.name)
                .and_then(VecDeque::pop_front)
            {
                return Ok(status);
            }
            Ok(state.current.get(&instance.name).cloned().unwrap_or_else(|| {
                InstanceStatus::new(PowerState::Running).with_ip(instance.ip.clone())
            }))
        })
    }

    fn submit_create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            let status = InstanceStatus::new(PowerState::Running).with_ip(self.created_ip.clone());
            self.record(format!("create {}", spec.name), Some((&spec.name, status)))?;
            let mut instance = self.managed(&spec.name, "");
            instance.ssh_key.clone_from(&spec.ssh_key);
            Ok(instance)
        })
    }

    fn submit_power<'a>(
        &'a self,
        instance: &'a Instance,
        action: PowerAction,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let verb = match action {
                PowerAction::Boot => "boot",
                PowerAction::Shutdown => "shutdown",
                PowerAction::Reboot => "reboot",
            };
            let mut status = InstanceStatus::new(action.target_state());
            if action.target_state() == PowerState::Running {
                status.ip = Some(instance.ip.clone());
            }
            self.record(format!("{verb} {}", instance.name), Some((&instance.name, status)))
        })
    }

    fn submit_destroy<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(
                format!("destroy {}", instance.name),
                Some((&instance.name, InstanceStatus::new(PowerState::Gone))),
            )
        })
    }

    fn submit_resize<'a>(
        &'a self,
        instance: &'a Instance,
        size: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.record(format!("resize {} {size}", instance.name), None) })
    }
}

/// Fleet store held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    clusters: Mutex<Clusters>,
    variables: BTreeMap<String, String>,
}

impl MemoryStore {
    /// Creates a store holding `clusters`.
    #[must_use]
    pub fn with_clusters(clusters: Clusters) -> Self {
        Self {
            clusters: Mutex::new(clusters),
            variables: BTreeMap::new(),
        }
    }

    /// Replaces the variables document.
    #[must_use]
    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// Returns a copy of the stored fleet.
    #[must_use]
    pub fn snapshot(&self) -> Clusters {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FleetStore for MemoryStore {
    fn clusters(&self) -> Result<Clusters, StoreError> {
        Ok(self.snapshot())
    }

    fn save_clusters(&self, clusters: &Clusters) -> Result<(), StoreError> {
        clusters.validate()?;
        *self.clusters.lock().unwrap_or_else(PoisonError::into_inner) = clusters.clone();
        Ok(())
    }

    fn variables(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.variables.clone())
    }

    fn update(
        &self,
        mutate: &mut dyn FnMut(&mut Clusters) -> Result<(), FleetError>,
    ) -> Result<Clusters, StoreError> {
        let mut guard = self.clusters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        mutate(&mut next)?;
        next.validate()?;
        *guard = next.clone();
        Ok(next)
    }
}

/// Builds a fleet from `(cluster, instance)` pairs.
///
/// # Panics
///
/// Panics when two instances share a name.
#[must_use]
#[expect(clippy::panic, reason = "test fixture helper reports invalid fixtures loudly")]
pub fn fleet_of(entries: impl IntoIterator<Item = (&'static str, Instance)>) -> Clusters {
    let mut clusters = Clusters::new();
    for (cluster, instance) in entries {
        if let Err(err) = clusters.insert(cluster, instance) {
            panic!("invalid fixture: {err}");
        }
    }
    clusters
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
