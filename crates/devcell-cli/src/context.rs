//! Wiring from configuration to the lifecycle manager.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use devcell_common::config::DevcellConfig;
use devcell_core::filesystem::image::DiskImageManager;
use devcell_core::filesystem::layout::StorageLayout;
use devcell_core::host::{HostRunner, PrivilegedRunner};
use devcell_runtime::backend::docker::DockerRuntime;
use devcell_runtime::lifecycle::{LifecycleManager, LifecycleSettings};
use devcell_runtime::ports::PortAllocator;
use devcell_runtime::state::{self, StateStore};

/// Loaded configuration plus lazily opened services.
#[derive(Debug)]
pub struct Context {
    /// Validated configuration.
    pub config: DevcellConfig,
}

impl Context {
    /// Loads the configuration file; a missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = DevcellConfig::load(path)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(Self { config })
    }

    /// Opens the configured state store.
    pub fn store(&self) -> anyhow::Result<Arc<dyn StateStore>> {
        state::open(&self.config.state).with_context(|| {
            format!(
                "cannot open state store at {}",
                self.config.state.path.display()
            )
        })
    }

    /// Connects to the runtime and assembles a lifecycle manager.
    pub async fn manager(&self) -> anyhow::Result<Arc<LifecycleManager>> {
        let store = self.store()?;
        let runtime = DockerRuntime::connect(&self.config.runtime)
            .await
            .context("cannot reach the container runtime")?;
        let runner: Arc<dyn HostRunner> = Arc::new(PrivilegedRunner::from_config(&self.config.host));
        let disks = DiskImageManager::new(
            runner,
            self.config.storage.container_uid,
            self.config.storage.container_gid,
        );
        Ok(Arc::new(LifecycleManager::new(
            Arc::new(runtime),
            store,
            disks,
            StorageLayout::from_config(&self.config.storage),
            PortAllocator::from_config(&self.config.ports),
            LifecycleSettings {
                lock_dir: Some(self.config.state.lock_dir()),
                ..LifecycleSettings::from_config(&self.config.runtime)
            },
        )))
    }
}
