//! Shared fixtures: an in-memory container runtime and a fully wired
//! lifecycle manager over a simulated host in a temporary directory.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use devcell_common::config::RetentionPolicy;
use devcell_common::error::{DevcellError, Result};
use devcell_common::types::{RuntimeId, StorageTier, UserAccount, UserId};
use devcell_core::filesystem::image::DiskImageManager;
use devcell_core::filesystem::layout::{StorageLayout, StoragePaths};
use devcell_core::host::HostRunner;
use devcell_core::testing::SimulatedHost;
use devcell_runtime::backend::{self, ContainerRuntime, ContainerSpec, ObservedState, ResourceStats};
use devcell_runtime::exec::ExecOutput;
use devcell_runtime::lifecycle::{LifecycleManager, LifecycleSettings};
use devcell_runtime::ports::PortAllocator;
use devcell_runtime::state::StateStore;
use devcell_runtime::state::sqlite::SqliteStore;
use tempfile::TempDir;

const GIB: u64 = devcell_common::constants::GIB;

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    state: ObservedState,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    created: Vec<ContainerSpec>,
    failures: Vec<&'static str>,
    lost_creates: usize,
    calls: Vec<String>,
    next_id: u64,
}

/// Container runtime that keeps containers in memory.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `operation` fail.
    pub fn fail_next(&self, operation: &'static str) {
        self.lock().failures.push(operation);
    }

    /// Makes the next create build the container but report a failure,
    /// like a runtime call that times out after the daemon acted.
    pub fn lose_next_create(&self) {
        self.lock().lost_creates += 1;
    }

    /// Whether a container with this name exists.
    pub fn exists_named(&self, name: &str) -> bool {
        self.lock().containers.values().any(|c| c.spec.name == name)
    }

    /// Specs of every container created so far, oldest first.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    /// Operation names called so far, e.g. `stop`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn exists(&self, id: &RuntimeId) -> bool {
        self.lock().containers.contains_key(id.as_str())
    }

    pub fn state_of(&self, id: &RuntimeId) -> Option<ObservedState> {
        self.lock().containers.get(id.as_str()).map(|c| c.state)
    }

    pub fn spec_of(&self, id: &RuntimeId) -> Option<ContainerSpec> {
        self.lock().containers.get(id.as_str()).map(|c| c.spec.clone())
    }

    /// Changes a container's state behind the orchestrator's back.
    pub fn set_state(&self, id: &RuntimeId, state: ObservedState) {
        if let Some(c) = self.lock().containers.get_mut(id.as_str()) {
            c.state = state;
        }
    }

    /// Deletes a container behind the orchestrator's back.
    pub fn delete(&self, id: &RuntimeId) {
        let _ = self.lock().containers.remove(id.as_str());
    }

    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, FakeState>> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if let Some(pos) = state.failures.iter().position(|op| *op == operation) {
            let _ = state.failures.remove(pos);
            return Err(DevcellError::Runtime {
                operation,
                message: "injected failure".into(),
            });
        }
        Ok(state)
    }
}

/// Key of the container addressed by id or by name.
fn resolve(state: &FakeState, id: &RuntimeId) -> Result<String> {
    if state.containers.contains_key(id.as_str()) {
        return Ok(id.as_str().to_string());
    }
    state
        .containers
        .iter()
        .find(|(_, c)| c.spec.name == id.as_str())
        .map(|(key, _)| key.clone())
        .ok_or_else(|| backend::missing(id.as_str()))
}

fn container<'a>(state: &'a mut FakeState, id: &RuntimeId) -> Result<&'a mut FakeContainer> {
    let key = resolve(state, id)?;
    state
        .containers
        .get_mut(&key)
        .ok_or_else(|| backend::missing(id.as_str()))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        drop(self.enter("ping")?);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeId> {
        let mut state = self.enter("create")?;
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(DevcellError::Runtime {
                operation: "create",
                message: format!("name {} already in use", spec.name),
            });
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.created.push(spec.clone());
        let _ = state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: ObservedState::Created,
            },
        );
        if state.lost_creates > 0 {
            state.lost_creates -= 1;
            return Err(DevcellError::Timeout {
                operation: "runtime create".into(),
                after: Duration::from_secs(5),
            });
        }
        Ok(RuntimeId::new(id))
    }

    async fn start(&self, id: &RuntimeId) -> Result<()> {
        let mut state = self.enter("start")?;
        container(&mut state, id)?.state = ObservedState::Running;
        Ok(())
    }

    async fn stop(&self, id: &RuntimeId, _grace: Duration) -> Result<()> {
        let mut state = self.enter("stop")?;
        container(&mut state, id)?.state = ObservedState::Exited { code: 0 };
        Ok(())
    }

    async fn remove(&self, id: &RuntimeId) -> Result<()> {
        let mut state = self.enter("remove")?;
        let key = resolve(&state, id)?;
        let _ = state.containers.remove(&key);
        Ok(())
    }

    async fn inspect(&self, id: &RuntimeId) -> Result<ObservedState> {
        let mut state = self.enter("inspect")?;
        Ok(container(&mut state, id)?.state)
    }

    async fn stats(&self, id: &RuntimeId) -> Result<ResourceStats> {
        let mut state = self.enter("stats")?;
        let c = container(&mut state, id)?;
        let limit = u64::try_from(c.spec.limits.memory_bytes).unwrap_or(0);
        Ok(ResourceStats {
            cpu_total_ns: 2_000,
            precpu_total_ns: 1_000,
            system_cpu_ns: 20_000,
            presystem_cpu_ns: 10_000,
            online_cpus: 2,
            memory_usage_bytes: 600 * 1024 * 1024,
            memory_cache_bytes: 100 * 1024 * 1024,
            memory_limit_bytes: limit,
            network_rx_bytes: 1_500,
            network_tx_bytes: 700,
        })
    }

    async fn exec(&self, id: &RuntimeId, command: &[String]) -> Result<ExecOutput> {
        let mut state = self.enter("exec")?;
        let _ = container(&mut state, id)?;
        Ok(ExecOutput {
            stdout: format!("{}\n", command.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// A lifecycle manager wired to a simulated host and a fake runtime.
pub struct Harness {
    pub dir: TempDir,
    pub host: Arc<SimulatedHost>,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<SqliteStore>,
    pub manager: Arc<LifecycleManager>,
    layout: StorageLayout,
    settings: LifecycleSettings,
    ports: (u16, u16),
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::KeepImages)
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self::build(retention, 2230, 2250)
    }

    pub fn with_ports(min: u16, max: u16) -> Self {
        Self::build(RetentionPolicy::KeepImages, min, max)
    }

    fn build(retention: RetentionPolicy, min: u16, max: u16) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = StorageLayout::new(
            dir.path().join("ssd"),
            dir.path().join("hdd"),
            dir.path().join("shared"),
        );
        let host = Arc::new(SimulatedHost::new());
        let runtime = Arc::new(FakeRuntime::new());
        let store = Arc::new(SqliteStore::open(&dir.path().join("state/devcell.db")).unwrap());
        let settings = LifecycleSettings {
            retention,
            runtime_timeout: Duration::from_secs(5),
            lock_dir: Some(dir.path().join("locks")),
            ..LifecycleSettings::default()
        };
        let manager = LifecycleManager::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&store) as Arc<dyn StateStore>,
            DiskImageManager::new(Arc::clone(&host) as Arc<dyn HostRunner>, 1000, 1000),
            layout.clone(),
            PortAllocator::new(min, max),
            settings.clone(),
        );
        Self {
            dir,
            host,
            runtime,
            store,
            manager: Arc::new(manager),
            layout,
            settings,
            ports: (min, max),
        }
    }

    /// Another manager over the same host, runtime, store, and lock
    /// directory, standing in for a second orchestrator process.
    pub fn second_manager(&self) -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager::new(
            Arc::clone(&self.runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&self.store) as Arc<dyn StateStore>,
            DiskImageManager::new(Arc::clone(&self.host) as Arc<dyn HostRunner>, 1000, 1000),
            self.layout.clone(),
            PortAllocator::new(self.ports.0, self.ports.1),
            self.settings.clone(),
        ))
    }

    /// Registers a user whose id is the username.
    pub fn add_user(&self, username: &str) -> UserId {
        let user = UserAccount::new(UserId::new(username), username).unwrap();
        self.store.insert_user(&user).unwrap();
        user.id
    }

    pub fn paths(&self, username: &str, tier: StorageTier) -> StoragePaths {
        self.layout.paths(username, tier)
    }

    /// Filesystem size of a user's image in GiB, if formatted.
    pub fn filesystem_gb(&self, username: &str, tier: StorageTier) -> Option<u64> {
        self.host
            .filesystem_size(&self.paths(username, tier).image)
            .map(|bytes| bytes / GIB)
    }
}
