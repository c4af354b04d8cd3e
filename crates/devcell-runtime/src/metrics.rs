//! Usage sampling and status reconciliation.
//!
//! The [`Reconciler`] periodically compares stored container status with
//! what the runtime reports, corrects drift, and records a usage sample for
//! every running container. Users with an operation in flight are skipped
//! for that pass. Each pass also logs a [`HostSnapshot`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devcell_common::constants::MIB;
use devcell_common::error::{DevcellError, Result};
use devcell_common::types::{ContainerRecord, ContainerStatus, StorageTier, UsageSample, UserId};
use devcell_core::filesystem::image::{self, DiskUsage};

use crate::lifecycle::{LifecycleManager, LiveState};

/// A status correction made by [`Reconciler::reconcile_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    /// Owner of the corrected record.
    pub user_id: UserId,
    /// Stored status before the correction.
    pub from: ContainerStatus,
    /// Status after the correction.
    pub to: ContainerStatus,
    /// What the runtime reported.
    pub live: LiveState,
}

const MEMINFO: &str = "/proc/meminfo";
const LOADAVG: &str = "/proc/loadavg";

/// Host memory as reported by `/proc/meminfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Installed memory in MiB.
    pub total_mb: u64,
    /// Memory available to new workloads in MiB.
    pub available_mb: u64,
}

/// Run-queue load averages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAverage {
    /// One-minute average.
    pub one: f64,
    /// Five-minute average.
    pub five: f64,
    /// Fifteen-minute average.
    pub fifteen: f64,
}

/// Host-wide capacity and load at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSnapshot {
    /// Filesystem holding the fast tier root.
    pub ssd: DiskUsage,
    /// Filesystem holding the capacity tier root.
    pub hdd: DiskUsage,
    /// Host memory.
    pub memory: MemoryInfo,
    /// Host load.
    pub load: LoadAverage,
    /// When the snapshot was taken.
    pub recorded_at: DateTime<Utc>,
}

/// Keeps stored status in line with the runtime and records usage.
#[derive(Debug, Clone)]
pub struct Reconciler {
    manager: Arc<LifecycleManager>,
}

impl Reconciler {
    /// Creates a reconciler over the manager's runtime and store.
    #[must_use]
    pub const fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    /// Takes one usage sample of a record's container.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` without a runtime id, or the runtime, disk, or
    /// store error.
    pub async fn collect(&self, record: &ContainerRecord) -> Result<UsageSample> {
        let Some(runtime_id) = &record.runtime_id else {
            return Err(DevcellError::NotRunning {
                user_id: record.user_id.to_string(),
            });
        };
        let stats = self
            .manager
            .bounded("stats", self.manager.runtime().stats(runtime_id))
            .await?;
        let (ssd, hdd) = match self.manager.store().find_user(&record.user_id)? {
            Some(user) => (
                self.tier_usage(&user.username, StorageTier::Fast).await?,
                self.tier_usage(&user.username, StorageTier::Capacity).await?,
            ),
            None => (DiskUsage::default(), DiskUsage::default()),
        };
        Ok(UsageSample {
            container_record_id: record.id.clone(),
            cpu_percent: stats.cpu_percent(),
            memory_used_mb: stats.memory_used_bytes() / MIB,
            memory_limit_mb: stats.memory_limit_bytes / MIB,
            storage_ssd_used_gb: ssd.used_gb(),
            storage_hdd_used_gb: hdd.used_gb(),
            network_rx_bytes: stats.network_rx_bytes,
            network_tx_bytes: stats.network_tx_bytes,
            recorded_at: Utc::now(),
        })
    }

    /// Measures host capacity: the tier filesystems plus memory and load.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::Io`] if a filesystem cannot be measured or
    /// a `/proc` file is unreadable or malformed.
    pub async fn host_snapshot(&self) -> Result<HostSnapshot> {
        let layout = self.manager.layout();
        let ssd = image::filesystem_usage(layout.root(StorageTier::Fast))?;
        let hdd = image::filesystem_usage(layout.root(StorageTier::Capacity))?;
        let memory =
            parse_meminfo(&read_proc(MEMINFO).await?).ok_or_else(|| malformed(MEMINFO))?;
        let load =
            parse_loadavg(&read_proc(LOADAVG).await?).ok_or_else(|| malformed(LOADAVG))?;
        Ok(HostSnapshot {
            ssd,
            hdd,
            memory,
            load,
            recorded_at: Utc::now(),
        })
    }

    /// Samples and stores usage of every running container.
    ///
    /// A container that cannot be sampled is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the records cannot be listed.
    pub async fn snapshot_all(&self) -> Result<Vec<UsageSample>> {
        let mut samples = Vec::new();
        for record in self.manager.list()? {
            if record.status != ContainerStatus::Running || record.runtime_id.is_none() {
                continue;
            }
            let sample = match self.collect(&record).await {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::warn!(user = %record.user_id, error = %e, "usage sample failed");
                    continue;
                }
            };
            if let Err(e) = self.manager.store().record_usage(&sample) {
                tracing::warn!(user = %record.user_id, error = %e, "failed to store usage sample");
                continue;
            }
            samples.push(sample);
        }
        tracing::debug!(count = samples.len(), "usage snapshot taken");
        Ok(samples)
    }

    /// Corrects every record whose stored status contradicts the runtime.
    ///
    /// Records being created or rebuilt, and users whose lock is held, are
    /// left for a later pass.
    ///
    /// # Errors
    ///
    /// Returns an error only if the records cannot be listed.
    pub async fn reconcile_all(&self) -> Result<Vec<Drift>> {
        let mut drifts = Vec::new();
        for record in self.manager.list()? {
            if record.runtime_id.is_none() {
                continue;
            }
            let Some(_guard) = self.manager.locks().try_lock(&record.user_id) else {
                tracing::debug!(user = %record.user_id, "operation in progress, skipping");
                continue;
            };
            match self.reconcile_one(&record.user_id).await {
                Ok(Some(drift)) => drifts.push(drift),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(user = %record.user_id, error = %e, "reconciliation failed");
                }
            }
        }
        if !drifts.is_empty() {
            tracing::info!(corrected = drifts.len(), "reconciled container status");
        }
        Ok(drifts)
    }

    /// Runs reconciliation and sampling every `interval` until `shutdown`
    /// resolves.
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let interval = if interval.is_zero() {
            tracing::warn!("zero reconcile interval, using one second");
            Duration::from_secs(1)
        } else {
            interval
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(interval_secs = interval.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_all().await {
                        tracing::error!(error = %e, "reconcile pass failed");
                    }
                    if let Err(e) = self.snapshot_all().await {
                        tracing::error!(error = %e, "usage snapshot failed");
                    }
                    match self.host_snapshot().await {
                        Ok(host) => tracing::info!(
                            ssd_used_gb = host.ssd.used_gb(),
                            hdd_used_gb = host.hdd.used_gb(),
                            memory_available_mb = host.memory.available_mb,
                            load_1m = host.load.one,
                            "host snapshot"
                        ),
                        Err(e) => tracing::warn!(error = %e, "host snapshot failed"),
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }

    /// Re-reads the record under the user's lock and applies a correction.
    async fn reconcile_one(&self, user_id: &UserId) -> Result<Option<Drift>> {
        let Some(mut record) = self.manager.store().find_container(user_id)? else {
            return Ok(None);
        };
        let live = self.manager.live_state(&record).await?;
        let Some(to) = live.corrected_status(record.status) else {
            return Ok(None);
        };
        let from = record.status;
        if to == ContainerStatus::Error {
            record.mark_error(None)?;
        } else {
            record.transition(to)?;
        }
        self.manager.store().update_container(&record)?;
        tracing::warn!(user = %user_id, %from, %to, %live, "status drift corrected");
        Ok(Some(Drift {
            user_id: user_id.clone(),
            from,
            to,
            live,
        }))
    }

    async fn tier_usage(&self, username: &str, tier: StorageTier) -> Result<DiskUsage> {
        let paths = self.manager.layout().paths(username, tier);
        self.manager.disks().usage(&paths.mount_point).await
    }
}

async fn read_proc(path: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DevcellError::Io {
            path: path.into(),
            source: e,
        })
}

fn malformed(path: &str) -> DevcellError {
    DevcellError::Io {
        path: path.into(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected format"),
    }
}

/// Reads `MemTotal` and `MemAvailable` (kB) from `/proc/meminfo` content.
fn parse_meminfo(content: &str) -> Option<MemoryInfo> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    };
    Some(MemoryInfo {
        total_mb: field("MemTotal")? / 1024,
        available_mb: field("MemAvailable")? / 1024,
    })
}

fn parse_loadavg(content: &str) -> Option<LoadAverage> {
    let mut fields = content.split_whitespace().map(str::parse::<f64>);
    Some(LoadAverage {
        one: fields.next()?.ok()?,
        five: fields.next()?.ok()?,
        fifteen: fields.next()?.ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_total_and_available_in_mib() {
        let content = "MemTotal:       16336412 kB\n\
                       MemFree:         1203948 kB\n\
                       MemAvailable:    9470212 kB\n\
                       Buffers:          410252 kB\n";
        assert_eq!(
            parse_meminfo(content),
            Some(MemoryInfo {
                total_mb: 15_953,
                available_mb: 9_248,
            })
        );
    }

    #[test]
    fn meminfo_without_available_is_rejected() {
        assert_eq!(parse_meminfo("MemTotal: 1024 kB\nMemFree: 512 kB\n"), None);
    }

    #[test]
    fn loadavg_reads_three_averages() {
        let load = parse_loadavg("0.52 0.58 0.59 2/1318 412345\n").unwrap();
        assert!((load.one - 0.52).abs() < f64::EPSILON);
        assert!((load.fifteen - 0.59).abs() < f64::EPSILON);
        assert!(parse_loadavg("0.52 oops").is_none());
    }
}
