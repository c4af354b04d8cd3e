//! Container lifecycle management.
//!
//! [`LifecycleManager`] owns one development container per user. It ties
//! the container runtime, the state store, and the disk image manager
//! together. Each public operation holds the user's lock from
//! [`UserLocks`] for its whole duration.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devcell_common::config::{RetentionPolicy, RuntimeConfig};
use devcell_common::constants;
use devcell_common::error::{DevcellError, Result};
use devcell_common::types::{
    ActivityEntry, ActivityKind, ContainerRecord, ContainerStatus, ResourceAllocation,
    ResourceRequest, RuntimeId, StorageTier, UserAccount, UserId,
};
use devcell_core::capability::{self, DEV_ENVIRONMENT};
use devcell_core::filesystem::image::DiskImageManager;
use devcell_core::filesystem::layout::StorageLayout;
use devcell_core::limits::CgroupLimits;
use tracing::instrument;

use crate::audit;
use crate::backend::{
    self, ContainerRuntime, ContainerSpec, ObservedState, ResourceStats, RestartPolicy, VolumeBind,
};
use crate::exec::{self, ExecOutput};
use crate::locks::UserLocks;
use crate::ports::PortAllocator;
use crate::state::StateStore;

/// Runtime-facing settings of the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Development environment image.
    pub image: String,
    /// Network every container joins.
    pub network: String,
    /// Container name prefix.
    pub name_prefix: String,
    /// Budget for one runtime call.
    pub runtime_timeout: Duration,
    /// Grace period given on stop.
    pub stop_grace: Duration,
    /// What happens to images on remove.
    pub retention: RetentionPolicy,
    /// Directory of per-user lock files shared with other orchestrator
    /// processes; `None` locks within this process only.
    pub lock_dir: Option<PathBuf>,
}

impl LifecycleSettings {
    /// Settings from the runtime configuration section.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            image: config.image.clone(),
            network: config.network.clone(),
            name_prefix: config.name_prefix.clone(),
            runtime_timeout: config.timeout(),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            retention: config.retention,
            lock_dir: None,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// What the runtime says about a record's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    /// The record has no runtime id.
    NoRuntime,
    /// The record names a runtime container that no longer exists.
    Missing,
    /// The runtime reported this state.
    Observed(ObservedState),
}

impl LiveState {
    /// Status a record in `stored` should be moved to, if the live state
    /// contradicts it.
    ///
    /// Records in a transitional status are left alone.
    #[must_use]
    pub const fn corrected_status(self, stored: ContainerStatus) -> Option<ContainerStatus> {
        match (stored, self) {
            (ContainerStatus::Creating | ContainerStatus::Rebuilding, _)
            | (_, Self::NoRuntime)
            | (ContainerStatus::Error, Self::Missing) => None,
            (_, Self::Missing) => Some(ContainerStatus::Error),
            (ContainerStatus::Running, Self::Observed(state)) if state.is_stopped() => {
                Some(ContainerStatus::Stopped)
            }
            (ContainerStatus::Stopped | ContainerStatus::Error, Self::Observed(state))
                if state.is_running() =>
            {
                Some(ContainerStatus::Running)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for LiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRuntime => f.write_str("no runtime container"),
            Self::Missing => f.write_str("missing"),
            Self::Observed(state) => write!(f, "{state}"),
        }
    }
}

/// Stored record plus what the runtime reports right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatusReport {
    /// Stored record.
    pub record: ContainerRecord,
    /// Live runtime state.
    pub live: LiveState,
}

impl ContainerStatusReport {
    /// Status the record should have given the live state, when the two
    /// disagree.
    #[must_use]
    pub const fn discrepancy(&self) -> Option<ContainerStatus> {
        self.live.corrected_status(self.record.status)
    }
}

/// Orchestrates the container, storage, and record of every user.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn StateStore>,
    disks: DiskImageManager,
    layout: StorageLayout,
    ports: PortAllocator,
    locks: UserLocks,
    settings: LifecycleSettings,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("layout", &self.layout)
            .field("ports", &self.ports)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a manager from its collaborators.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn StateStore>,
        disks: DiskImageManager,
        layout: StorageLayout,
        ports: PortAllocator,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            runtime,
            store,
            disks,
            layout,
            ports,
            locks: settings
                .lock_dir
                .clone()
                .map_or_else(UserLocks::new, UserLocks::with_dir),
            settings,
        }
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// The container runtime.
    #[must_use]
    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub(crate) const fn disks(&self) -> &DiskImageManager {
        &self.disks
    }

    pub(crate) const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Per-user operation locks.
    #[must_use]
    pub const fn locks(&self) -> &UserLocks {
        &self.locks
    }

    /// Creates, provisions, and starts the container of a user.
    ///
    /// Unset request fields take the defaults. Without a public key in the
    /// request, the user's active keys are injected. A given key is stored
    /// as an active key of the user.
    ///
    /// Once the record is reserved, any failure leaves it in `ERROR` with
    /// whatever runtime id was obtained, and leaves the images in place.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for out-of-range values, `NotFound` for an
    /// unknown user, `AlreadyExists` if the user has a container,
    /// `PortExhaustion`, or the failing disk or runtime error.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn create(
        &self,
        user_id: &UserId,
        request: &ResourceRequest,
    ) -> Result<ContainerRecord> {
        let allocation = request.resolve(user_id.clone())?;
        let _guard = self.locks.lock(user_id).await?;
        let user = self.user(user_id)?;
        if self.store.find_container(user_id)?.is_some() {
            return Err(DevcellError::AlreadyExists {
                kind: "container",
                id: user_id.to_string(),
            });
        }
        let keys = match request.ssh_public_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => {
                self.remember_key(user_id, key)?;
                key.to_string()
            }
            _ => self.store.active_ssh_keys(user_id)?.join("\n"),
        };
        let record = self.provision(&user, &allocation, &keys).await?;
        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::ContainerCreate,
            &format!("container {} created on port {}", record.name, record.ssh_port),
        );
        Ok(record)
    }

    /// Mounts the storage and starts the existing container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` without a record or runtime container, or the
    /// failing disk or runtime error.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn start(&self, user_id: &UserId) -> Result<ContainerRecord> {
        let _guard = self.locks.lock(user_id).await?;
        let user = self.user(user_id)?;
        let mut record = self.record(user_id)?;
        let runtime_id = runtime_id_of(&record)?;
        ensure_allowed(&record, ContainerStatus::Running)?;

        self.mount_all(&user).await?;
        self.bounded("start", self.runtime.start(&runtime_id)).await?;
        record.transition(ContainerStatus::Running)?;
        self.store.update_container(&record)?;
        tracing::info!(user = %user_id, id = %runtime_id.short(), "container started");
        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::ContainerStart,
            "container started",
        );
        Ok(record)
    }

    /// Stops the container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` without a record or runtime container, or the
    /// runtime error.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn stop(&self, user_id: &UserId) -> Result<ContainerRecord> {
        let _guard = self.locks.lock(user_id).await?;
        let mut record = self.record(user_id)?;
        let runtime_id = runtime_id_of(&record)?;
        ensure_allowed(&record, ContainerStatus::Stopped)?;

        self.bounded("stop", self.runtime.stop(&runtime_id, self.settings.stop_grace))
            .await?;
        record.transition(ContainerStatus::Stopped)?;
        self.store.update_container(&record)?;
        tracing::info!(user = %user_id, id = %runtime_id.short(), "container stopped");
        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::ContainerStop,
            "container stopped",
        );
        Ok(record)
    }

    /// Stops the container, remounts its storage, and starts it again.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` without a record or runtime container, or the
    /// failing disk or runtime error.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn restart(&self, user_id: &UserId) -> Result<ContainerRecord> {
        let _guard = self.locks.lock(user_id).await?;
        let user = self.user(user_id)?;
        let mut record = self.record(user_id)?;
        let runtime_id = runtime_id_of(&record)?;
        ensure_allowed(&record, ContainerStatus::Running)?;

        self.bounded("stop", self.runtime.stop(&runtime_id, self.settings.stop_grace))
            .await?;
        self.mount_all(&user).await?;
        self.bounded("start", self.runtime.start(&runtime_id)).await?;
        record.transition(ContainerStatus::Running)?;
        self.store.update_container(&record)?;
        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::ContainerRestart,
            "container restarted",
        );
        Ok(record)
    }

    /// Destroys the runtime container and creates a fresh one with the same
    /// allocation and keys. Storage images are kept.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` without a record, `InvalidTransition` while the
    /// record is still being created, or the error of the failing step.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn rebuild(&self, user_id: &UserId) -> Result<ContainerRecord> {
        let _guard = self.locks.lock(user_id).await?;
        let user = self.user(user_id)?;
        let mut record = self.record(user_id)?;
        record.transition(ContainerStatus::Rebuilding)?;
        self.store.update_container(&record)?;

        let keys = self.store.active_ssh_keys(user_id)?.join("\n");
        let allocation = self
            .store
            .find_allocation(user_id)?
            .unwrap_or_else(|| ResourceAllocation::defaults(user_id.clone()));

        let runtime_id = runtime_id_or_name(&record);
        if let Err(e) = self.destroy_runtime(&record.name, &runtime_id).await {
            self.fail_record(&mut record, None);
            return Err(e);
        }
        self.store.delete_container(user_id)?;
        tracing::info!(user = %user_id, "runtime container destroyed, recreating");

        let record = self.provision(&user, &allocation, &keys).await?;
        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::ContainerRebuild,
            &format!("container {} rebuilt", record.name),
        );
        Ok(record)
    }

    /// Removes the container and its record.
    ///
    /// Storage images are unmounted and, under
    /// [`RetentionPolicy::DeleteImages`], deleted. A runtime container that
    /// is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` without a record, or the failing runtime or disk
    /// error.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn remove(&self, user_id: &UserId) -> Result<()> {
        let _guard = self.locks.lock(user_id).await?;
        let user = self.user(user_id)?;
        let record = self.record(user_id)?;
        self.destroy_runtime(&record.name, &runtime_id_or_name(&record))
            .await?;
        for tier in StorageTier::ALL {
            let paths = self.layout.paths(&user.username, tier);
            match self.settings.retention {
                RetentionPolicy::KeepImages => self.disks.unmount(&paths.mount_point).await?,
                RetentionPolicy::DeleteImages => self.disks.remove(&paths).await?,
            }
        }
        self.store.delete_container(user_id)?;
        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::ContainerRemove,
            &format!("container {} removed", record.name),
        );
        Ok(())
    }

    /// Applies new storage quotas to both tiers.
    ///
    /// A zero quota deletes the tier's image; a tier without an image gets
    /// a fresh one. When a tier shrinks while the container runs, the
    /// container is stopped around the shrink and started again.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for out-of-range quotas, `NotFound` for an
    /// unknown user, `Quota` when a shrink is refused, or the failing disk
    /// or runtime error.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn resize_storage(
        &self,
        user_id: &UserId,
        ssd_gb: u32,
        hdd_gb: u32,
    ) -> Result<ResourceAllocation> {
        let _guard = self.locks.lock(user_id).await?;
        let user = self.user(user_id)?;
        let mut allocation = self
            .store
            .find_allocation(user_id)?
            .unwrap_or_else(|| ResourceAllocation::defaults(user_id.clone()));
        allocation.storage_ssd_gb = ssd_gb;
        allocation.storage_hdd_gb = hdd_gb;
        allocation.validate()?;
        self.store.upsert_allocation(&allocation)?;

        let running = self
            .store
            .find_container(user_id)?
            .filter(|r| r.status == ContainerStatus::Running)
            .and_then(|r| r.runtime_id);
        let pause = match &running {
            Some(_) => self.shrinks_any(&user, &allocation).await?,
            None => false,
        };
        if let (true, Some(runtime_id)) = (pause, &running) {
            tracing::info!(user = %user_id, "stopping container for shrink");
            self.bounded("stop", self.runtime.stop(runtime_id, self.settings.stop_grace))
                .await?;
        }

        let result = self.apply_quotas(&user, &allocation).await;

        if let (true, Some(runtime_id)) = (pause, &running) {
            match self.bounded("start", self.runtime.start(runtime_id)).await {
                Ok(()) => tracing::info!(user = %user_id, "container restarted after shrink"),
                Err(e) if result.is_err() => {
                    tracing::error!(
                        user = %user_id,
                        error = %e,
                        "container not restarted after failed quota change"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        result?;

        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::StorageResize,
            &format!("storage quota set to ssd={ssd_gb}GB hdd={hdd_gb}GB"),
        );
        Ok(allocation)
    }

    /// Changes the CPU or memory allocation. The running container keeps
    /// its limits until the next rebuild.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for out-of-range values or `NotFound` for an
    /// unknown user.
    #[instrument(skip_all, fields(user = %user_id))]
    pub async fn update_allocation(
        &self,
        user_id: &UserId,
        cpu_cores: Option<u32>,
        memory_mb: Option<u32>,
    ) -> Result<ResourceAllocation> {
        let _guard = self.locks.lock(user_id).await?;
        let _ = self.user(user_id)?;
        let mut allocation = self
            .store
            .find_allocation(user_id)?
            .unwrap_or_else(|| ResourceAllocation::defaults(user_id.clone()));
        if let Some(cores) = cpu_cores {
            allocation.cpu_cores = cores;
        }
        if let Some(memory) = memory_mb {
            allocation.memory_mb = memory;
        }
        allocation.validate()?;
        self.store.upsert_allocation(&allocation)?;
        audit::record(
            self.store.as_ref(),
            user_id,
            ActivityKind::ResourceUpdate,
            &format!(
                "allocation set to {} cores, {} MB; applies on rebuild",
                allocation.cpu_cores, allocation.memory_mb
            ),
        );
        Ok(allocation)
    }

    /// The stored record of a user together with the live runtime state.
    ///
    /// # Errors
    ///
    /// Returns a store error, or a runtime error other than "missing".
    pub async fn status(&self, user_id: &UserId) -> Result<Option<ContainerStatusReport>> {
        let Some(record) = self.store.find_container(user_id)? else {
            return Ok(None);
        };
        let live = self.live_state(&record).await?;
        Ok(Some(ContainerStatusReport { record, live }))
    }

    /// Every container record.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        self.store.list_containers()
    }

    /// Recent activity of a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn activity(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEntry>> {
        self.store.recent_activity(user_id, limit)
    }

    /// Runs a command in the user's running container.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty command, `NotRunning` unless the
    /// record is `RUNNING`, or the runtime error.
    pub async fn exec(&self, user_id: &UserId, command: &[String]) -> Result<ExecOutput> {
        exec::validate_command(command)?;
        let runtime_id = self.running_runtime_id(user_id)?;
        self.bounded("exec", self.runtime.exec(&runtime_id, command))
            .await
    }

    /// Live resource statistics of the user's running container.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` unless the record is `RUNNING`, or the runtime
    /// error.
    pub async fn stats(&self, user_id: &UserId) -> Result<ResourceStats> {
        let runtime_id = self.running_runtime_id(user_id)?;
        self.bounded("stats", self.runtime.stats(&runtime_id)).await
    }

    pub(crate) async fn live_state(&self, record: &ContainerRecord) -> Result<LiveState> {
        let Some(runtime_id) = &record.runtime_id else {
            return Ok(LiveState::NoRuntime);
        };
        match self.bounded("inspect", self.runtime.inspect(runtime_id)).await {
            Ok(state) => Ok(LiveState::Observed(state)),
            Err(e) if backend::is_missing(&e) => Ok(LiveState::Missing),
            Err(e) => Err(e),
        }
    }

    /// Bounds a runtime call by the configured timeout.
    pub(crate) async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        let after = self.settings.runtime_timeout;
        tokio::time::timeout(after, call)
            .await
            .map_err(|_| DevcellError::Timeout {
                operation: format!("runtime {operation}"),
                after,
            })?
    }

    /// Reserves a record, provisions storage, then creates and starts the
    /// runtime container. The record ends up `RUNNING` or `ERROR`.
    async fn provision(
        &self,
        user: &UserAccount,
        allocation: &ResourceAllocation,
        keys: &str,
    ) -> Result<ContainerRecord> {
        let name = format!("{}{}", self.settings.name_prefix, user.username);
        let reserved = ContainerRecord::reserve(user.id.clone(), name, 0);
        let mut record = self.ports.reserve(self.store.as_ref(), reserved).await?;
        tracing::info!(user = %user.id, port = record.ssh_port, "container record reserved");

        let mut created = None;
        let outcome = self
            .provision_reserved(user, allocation, keys, &record, &mut created)
            .await;
        match outcome {
            Ok(runtime_id) => {
                record.mark_running(runtime_id)?;
                self.store.update_container(&record)?;
                tracing::info!(
                    user = %user.id,
                    name = %record.name,
                    port = record.ssh_port,
                    "container running"
                );
                Ok(record)
            }
            Err(e) => {
                tracing::error!(user = %user.id, error = %e, "container provisioning failed");
                self.fail_record(&mut record, created);
                Err(e)
            }
        }
    }

    async fn provision_reserved(
        &self,
        user: &UserAccount,
        allocation: &ResourceAllocation,
        keys: &str,
        record: &ContainerRecord,
        created: &mut Option<RuntimeId>,
    ) -> Result<RuntimeId> {
        self.store.upsert_allocation(allocation)?;
        for tier in StorageTier::ALL {
            let quota = allocation.quota_gb(tier);
            if quota > 0 {
                let paths = self.layout.paths(&user.username, tier);
                self.disks.create_and_mount(&paths, quota).await?;
            }
        }
        let spec = self.container_spec(user, allocation, record, keys);
        let runtime_id = self.bounded("create", self.runtime.create(&spec)).await?;
        *created = Some(runtime_id.clone());
        self.bounded("start", self.runtime.start(&runtime_id)).await?;
        Ok(runtime_id)
    }

    fn container_spec(
        &self,
        user: &UserAccount,
        allocation: &ResourceAllocation,
        record: &ContainerRecord,
        keys: &str,
    ) -> ContainerSpec {
        let mut binds: Vec<VolumeBind> = StorageTier::ALL
            .into_iter()
            .filter(|tier| allocation.quota_gb(*tier) > 0)
            .map(|tier| VolumeBind {
                host_path: self.layout.paths(&user.username, tier).mount_point,
                container_path: tier.container_path().to_string(),
                read_only: false,
            })
            .collect();
        binds.push(VolumeBind {
            host_path: self.layout.shared_root().to_path_buf(),
            container_path: constants::SHARED_MOUNT_PATH.to_string(),
            read_only: true,
        });
        ContainerSpec {
            name: record.name.clone(),
            image: self.settings.image.clone(),
            hostname: user.username.clone(),
            env: vec![
                ("SSH_PUBLIC_KEY".to_string(), keys.to_string()),
                ("USERNAME".to_string(), user.username.clone()),
            ],
            binds,
            ssh_port: record.ssh_port,
            network: self.settings.network.clone(),
            limits: CgroupLimits::from_allocation(allocation),
            capabilities: capability::least_privilege(DEV_ENVIRONMENT),
            security_opts: vec!["no-new-privileges:true".to_string()],
            restart: RestartPolicy::UnlessStopped,
        }
    }

    /// Stops and force-removes a runtime container. A container that is
    /// already gone counts as removed.
    async fn destroy_runtime(&self, name: &str, runtime_id: &RuntimeId) -> Result<()> {
        match self
            .bounded("stop", self.runtime.stop(runtime_id, self.settings.stop_grace))
            .await
        {
            Err(e) if backend::is_missing(&e) => {
                tracing::warn!(name, id = %runtime_id.short(), "runtime container already gone");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "stop failed, forcing removal");
            }
            Ok(()) => {}
        }
        match self.bounded("remove", self.runtime.remove(runtime_id)).await {
            Err(e) if backend::is_missing(&e) => {
                tracing::warn!(name, id = %runtime_id.short(), "runtime container already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn mount_all(&self, user: &UserAccount) -> Result<()> {
        for tier in StorageTier::ALL {
            self.disks
                .ensure_mounted(&self.layout.paths(&user.username, tier))
                .await?;
        }
        Ok(())
    }

    async fn shrinks_any(&self, user: &UserAccount, allocation: &ResourceAllocation) -> Result<bool> {
        for tier in StorageTier::ALL {
            let quota = allocation.quota_gb(tier);
            let paths = self.layout.paths(&user.username, tier);
            if quota > 0
                && self.disks.image_exists(&paths).await?
                && self.disks.size_gb(&paths.image).await? > quota
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn apply_quotas(&self, user: &UserAccount, allocation: &ResourceAllocation) -> Result<()> {
        for tier in StorageTier::ALL {
            let quota = allocation.quota_gb(tier);
            let paths = self.layout.paths(&user.username, tier);
            if quota == 0 {
                self.disks.remove(&paths).await?;
            } else if self.disks.image_exists(&paths).await? {
                let outcome = self.disks.resize(&paths, quota).await?;
                tracing::debug!(user = %user.id, tier = %tier, ?outcome, "tier resized");
            } else {
                self.disks.create_and_mount(&paths, quota).await?;
            }
        }
        Ok(())
    }

    /// Moves a record to `ERROR`, logging rather than failing if the store
    /// refuses.
    fn fail_record(&self, record: &mut ContainerRecord, runtime_id: Option<RuntimeId>) {
        if let Err(e) = record
            .mark_error(runtime_id)
            .and_then(|()| self.store.update_container(&*record))
        {
            tracing::error!(user = %record.user_id, error = %e, "failed to mark record as ERROR");
        }
    }

    fn remember_key(&self, user_id: &UserId, key: &str) -> Result<()> {
        if !self.store.active_ssh_keys(user_id)?.iter().any(|k| k == key) {
            self.store.add_ssh_key(user_id, key)?;
        }
        Ok(())
    }

    fn running_runtime_id(&self, user_id: &UserId) -> Result<RuntimeId> {
        let record = self.record(user_id)?;
        match (&record.status, record.runtime_id) {
            (ContainerStatus::Running, Some(id)) => Ok(id),
            _ => Err(DevcellError::NotRunning {
                user_id: user_id.to_string(),
            }),
        }
    }

    fn user(&self, user_id: &UserId) -> Result<UserAccount> {
        self.store
            .find_user(user_id)?
            .ok_or_else(|| DevcellError::NotFound {
                kind: "user",
                id: user_id.to_string(),
            })
    }

    fn record(&self, user_id: &UserId) -> Result<ContainerRecord> {
        self.store
            .find_container(user_id)?
            .ok_or_else(|| DevcellError::NotFound {
                kind: "container",
                id: user_id.to_string(),
            })
    }
}

fn runtime_id_of(record: &ContainerRecord) -> Result<RuntimeId> {
    record
        .runtime_id
        .clone()
        .ok_or_else(|| backend::missing(record.name.clone()))
}

/// The record's runtime id, or its container name when a create never
/// reported one back. The runtime accepts either.
fn runtime_id_or_name(record: &ContainerRecord) -> RuntimeId {
    record
        .runtime_id
        .clone()
        .unwrap_or_else(|| RuntimeId::new(record.name.clone()))
}

fn ensure_allowed(record: &ContainerRecord, to: ContainerStatus) -> Result<()> {
    if record.status.allows(to) {
        Ok(())
    } else {
        Err(DevcellError::InvalidTransition {
            from: record.status,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_record_with_exited_container_drifts_to_stopped() {
        let live = LiveState::Observed(ObservedState::Exited { code: 137 });
        assert_eq!(
            live.corrected_status(ContainerStatus::Running),
            Some(ContainerStatus::Stopped)
        );
        assert_eq!(live.corrected_status(ContainerStatus::Stopped), None);
    }

    #[test]
    fn stopped_or_error_record_with_running_container_drifts_to_running() {
        let live = LiveState::Observed(ObservedState::Running);
        assert_eq!(
            live.corrected_status(ContainerStatus::Stopped),
            Some(ContainerStatus::Running)
        );
        assert_eq!(
            live.corrected_status(ContainerStatus::Error),
            Some(ContainerStatus::Running)
        );
    }

    #[test]
    fn missing_runtime_object_drifts_to_error() {
        assert_eq!(
            LiveState::Missing.corrected_status(ContainerStatus::Running),
            Some(ContainerStatus::Error)
        );
        assert_eq!(LiveState::Missing.corrected_status(ContainerStatus::Error), None);
    }

    #[test]
    fn transitional_records_never_drift() {
        for live in [
            LiveState::Missing,
            LiveState::Observed(ObservedState::Dead),
            LiveState::Observed(ObservedState::Running),
        ] {
            assert_eq!(live.corrected_status(ContainerStatus::Creating), None);
            assert_eq!(live.corrected_status(ContainerStatus::Rebuilding), None);
        }
    }

    #[test]
    fn settings_follow_runtime_config() {
        let config = RuntimeConfig {
            stop_grace_secs: 3,
            retention: RetentionPolicy::DeleteImages,
            ..RuntimeConfig::default()
        };
        let settings = LifecycleSettings::from_config(&config);
        assert_eq!(settings.stop_grace, Duration::from_secs(3));
        assert_eq!(settings.retention, RetentionPolicy::DeleteImages);
        assert_eq!(settings.name_prefix, constants::DEFAULT_CONTAINER_PREFIX);
        assert!(settings.lock_dir.is_none());
    }
}
