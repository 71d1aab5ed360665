//! Lifecycle Controller.
//!
//! [`IscsiVolumeDriver`] implements the [`VolumeDriver`] contract on top of
//! the registry, the storage appliance, the host iSCSI initiator and the
//! block device mounter.
//!
//! Locking: Create, Mount, Unmount, Remove, List and Get hold the registry's
//! exclusive lock for their whole duration, remote calls included, so they
//! are serialized process-wide. Path only reads immutable fields and takes
//! the shared lock.
//!
//! Partial failures are not rolled back. A Create that fails after some
//! remote objects exist leaves them on the appliance and records nothing
//! locally. A Remove whose teardown partly fails still drops the local
//! record. Both cases are logged with every identifier needed for manual
//! cleanup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use freenas_client::ObjectId;

use crate::capacity::{fits, select_pool};
use crate::error::{DriverError, DriverResult};
use crate::metrics::{self, OperationTimer};
use crate::platform::{BlockDeviceMounter, IscsiInitiator};
use crate::provisioner::StorageProvisioner;
use crate::registry::{Registry, RegistryWriteGuard};
use crate::types::{
    Capabilities, GIB, PendingVolume, VolumeRecord, VolumeSummary, mountpoint_for, parse_size,
    remote_name_for, validate_volume_name,
};

/// Default number of polls for the device node after login
pub const DEFAULT_DEVICE_WAIT_ATTEMPTS: u32 = 5;

/// Default delay between device node polls
pub const DEFAULT_DEVICE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// The operations a container runtime volume plugin must provide.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create(&self, name: &str, options: &HashMap<String, String>) -> DriverResult<()>;

    async fn remove(&self, name: &str) -> DriverResult<()>;

    /// Attach and mount the volume, returning its mountpoint.
    async fn mount(&self, name: &str) -> DriverResult<PathBuf>;

    async fn unmount(&self, name: &str) -> DriverResult<()>;

    async fn path(&self, name: &str) -> DriverResult<VolumeSummary>;

    async fn get(&self, name: &str) -> DriverResult<VolumeSummary>;

    async fn list(&self) -> DriverResult<Vec<VolumeSummary>>;

    fn capabilities(&self) -> Capabilities;
}

/// Bounded fixed-delay polling for the device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for DevicePollPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_DEVICE_WAIT_ATTEMPTS,
            interval: DEFAULT_DEVICE_WAIT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Plugin root; mountpoints live under `<root>/volumes/`
    pub root: PathBuf,
    /// Appliance host used for iSCSI discovery
    pub appliance_host: String,
    /// Portal all targets are bound to
    pub portal_id: ObjectId,
    /// Filesystem volumes are formatted with
    pub fs_type: String,
    pub device_poll: DevicePollPolicy,
}

pub struct IscsiVolumeDriver {
    registry: Registry,
    provisioner: Arc<dyn StorageProvisioner>,
    initiator: Arc<dyn IscsiInitiator>,
    mounter: Arc<dyn BlockDeviceMounter>,
    settings: DriverSettings,
}

impl IscsiVolumeDriver {
    pub fn new(
        registry: Registry,
        provisioner: Arc<dyn StorageProvisioner>,
        initiator: Arc<dyn IscsiInitiator>,
        mounter: Arc<dyn BlockDeviceMounter>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            registry,
            provisioner,
            initiator,
            mounter,
            settings,
        }
    }

    /// Snapshot of one record, including its in-memory connection count.
    pub async fn record(&self, name: &str) -> Option<VolumeRecord> {
        self.registry.read().await.get(name).cloned()
    }

    /// Publish registry gauges for the current state.
    pub async fn refresh_gauges(&self) {
        let volumes = self.registry.read().await;
        metrics::set_volumes_count(volumes.len());
        metrics::set_mounted_count(volumes.mounted_count());
    }

    async fn create_volume(
        &self,
        name: &str,
        options: &HashMap<String, String>,
    ) -> DriverResult<()> {
        let size_gib = parse_size(options)?;
        validate_volume_name(name)?;

        let mut volumes = self.registry.write().await;
        if volumes.contains(name) {
            return Err(DriverError::AlreadyExists(name.to_string()));
        }

        let pools = self.provisioner.list_pools().await?;
        let size_bytes = size_gib * GIB;
        let pool = select_pool(&pools).ok_or_else(|| {
            DriverError::InsufficientCapacity("no storage pools available".to_string())
        })?;
        if !fits(pool, size_bytes) {
            return Err(DriverError::InsufficientCapacity(format!(
                "largest pool '{}' has {} bytes available, {} requested",
                pool.name, pool.available_bytes, size_bytes
            )));
        }
        debug!(pool = %pool.name, available = pool.available_bytes, "Selected storage pool");

        let mut pending = PendingVolume {
            name: name.to_string(),
            remote_name: remote_name_for(name),
            size_gib,
            mountpoint: mountpoint_for(&self.settings.root, name),
            pool_name: pool.name.clone(),
            ..Default::default()
        };

        if let Err(e) = self.provision(&mut pending).await {
            warn!(
                volume = %name,
                pool = %pending.pool_name,
                zvol = %pending.remote_name,
                zvol_created = pending.zvol_created,
                target_id = ?pending.target_id,
                target_group_id = ?pending.target_group_id,
                extent_id = ?pending.extent_id,
                error = %e,
                "Create failed part way, abandoning remote objects"
            );
            return Err(e);
        }

        let record = pending.complete().ok_or_else(|| {
            DriverError::RemoteProvisioning(format!("volume '{}' incompletely provisioned", name))
        })?;
        info!(
            volume = %name,
            pool = %record.pool_name,
            size_gib = record.size_gib,
            target_id = record.target_id,
            extent_id = record.extent_id,
            target_group_id = record.target_group_id,
            target_to_extent_id = record.target_to_extent_id,
            "Volume created"
        );

        volumes.insert(record);
        persist(&volumes).await;
        update_gauges(&volumes);
        Ok(())
    }

    /// Create zvol, target, target group, extent and link, in that order.
    async fn provision(&self, pending: &mut PendingVolume) -> DriverResult<()> {
        let p = &self.provisioner;

        p.create_zvol(&pending.pool_name, &pending.remote_name, pending.size_gib)
            .await?;
        pending.zvol_created = true;

        let target_id = p.create_target(&pending.remote_name).await?;
        pending.target_id = Some(target_id);

        pending.target_group_id = Some(
            p.create_target_group(target_id, self.settings.portal_id)
                .await?,
        );

        let extent_id = p
            .create_extent(&pending.remote_name, &pending.pool_name, &pending.remote_name)
            .await?;
        pending.extent_id = Some(extent_id);

        pending.target_to_extent_id = Some(p.link_target_extent(target_id, extent_id).await?);
        Ok(())
    }

    async fn mount_volume(&self, name: &str) -> DriverResult<PathBuf> {
        let mut volumes = self.registry.write().await;
        let record = volumes
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        if record.connections == 0 {
            self.attach(&record).await?;
        } else {
            debug!(volume = %name, connections = record.connections, "Volume already mounted");
        }

        if let Some(entry) = volumes.get_mut(name) {
            entry.connections += 1;
            info!(volume = %name, connections = entry.connections, "Volume mounted");
        }
        update_gauges(&volumes);
        Ok(record.mountpoint)
    }

    /// First-mount path: mountpoint, login, device, filesystem, mount.
    async fn attach(&self, record: &VolumeRecord) -> DriverResult<()> {
        ensure_mountpoint(&record.mountpoint).await?;

        let host = &self.settings.appliance_host;
        let iqn = self
            .initiator
            .discover_iqn(host, &record.remote_name)
            .await?;
        self.initiator.login(&iqn).await?;

        let device = self
            .initiator
            .resolve_device_path(host, &record.remote_name)
            .await?;
        self.wait_for_device(&device).await?;

        let fs_type = self.settings.fs_type.as_str();
        let current = self.mounter.detect_filesystem(&device).await?;
        if current.as_deref() != Some(fs_type) {
            info!(
                device = %device.display(),
                current = ?current,
                fs_type = %fs_type,
                "Device needs formatting"
            );
            self.mounter.format(&device, fs_type).await?;
        }

        self.mounter
            .mount(&device, &record.mountpoint, fs_type)
            .await
    }

    async fn wait_for_device(&self, device: &Path) -> DriverResult<()> {
        let policy = self.settings.device_poll;
        for attempt in 1..=policy.attempts {
            if self.initiator.device_present(device).await {
                debug!(device = %device.display(), attempt = attempt, "Device present");
                return Ok(());
            }
            metrics::record_device_wait_retry();
            debug!(
                device = %device.display(),
                attempt = attempt,
                max_attempts = policy.attempts,
                "Device not present yet"
            );
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }

        Err(DriverError::Initiator(format!(
            "device {} did not appear after {} attempts",
            device.display(),
            policy.attempts
        )))
    }

    async fn unmount_volume(&self, name: &str) -> DriverResult<()> {
        let mut volumes = self.registry.write().await;
        let entry = volumes
            .get_mut(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        entry.connections = entry.connections.saturating_sub(1);
        let remaining = entry.connections;
        let record = entry.clone();
        update_gauges(&volumes);

        if remaining > 0 {
            debug!(volume = %name, connections = remaining, "Volume still in use");
            return Ok(());
        }

        self.detach(&record).await?;
        info!(volume = %name, "Volume unmounted");
        Ok(())
    }

    async fn detach(&self, record: &VolumeRecord) -> DriverResult<()> {
        self.mounter.unmount(&record.mountpoint).await?;
        let iqn = self
            .initiator
            .discover_iqn(&self.settings.appliance_host, &record.remote_name)
            .await?;
        self.initiator.logout(&iqn).await
    }

    async fn remove_volume(&self, name: &str) -> DriverResult<()> {
        let mut volumes = self.registry.write().await;
        let record = volumes
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        if record.connections != 0 {
            return Err(DriverError::VolumeBusy(name.to_string()));
        }

        let failures = self.teardown(&record).await;

        volumes.remove(name);
        persist(&volumes).await;
        update_gauges(&volumes);

        if failures.is_empty() {
            info!(volume = %name, "Volume removed");
            return Ok(());
        }
        Err(DriverError::RemoteProvisioning(format!(
            "volume '{}' removed locally but teardown was incomplete: {}",
            name,
            failures.join("; ")
        )))
    }

    /// Delete the link, extent, target group, target and zvol, in that order.
    ///
    /// Every step is attempted. Returns a description of each failed step.
    async fn teardown(&self, record: &VolumeRecord) -> Vec<String> {
        let p = &self.provisioner;
        let mut failures = Vec::new();

        let result = p.unlink_target_extent(record.target_to_extent_id).await;
        note_teardown(&mut failures, record, "target-to-extent", result);

        let result = p.delete_extent(record.extent_id).await;
        note_teardown(&mut failures, record, "extent", result);

        let result = p.delete_target_group(record.target_group_id).await;
        note_teardown(&mut failures, record, "target group", result);

        let result = p.delete_target(record.target_id).await;
        note_teardown(&mut failures, record, "target", result);

        let result = p.delete_zvol(&record.pool_name, &record.remote_name).await;
        note_teardown(&mut failures, record, "zvol", result);

        failures
    }
}

#[async_trait]
impl VolumeDriver for IscsiVolumeDriver {
    #[instrument(skip_all, fields(volume = %name))]
    async fn create(&self, name: &str, options: &HashMap<String, String>) -> DriverResult<()> {
        let timer = OperationTimer::new("create");
        timer.observe(self.create_volume(name, options).await)
    }

    #[instrument(skip_all, fields(volume = %name))]
    async fn remove(&self, name: &str) -> DriverResult<()> {
        let timer = OperationTimer::new("remove");
        timer.observe(self.remove_volume(name).await)
    }

    #[instrument(skip_all, fields(volume = %name))]
    async fn mount(&self, name: &str) -> DriverResult<PathBuf> {
        let timer = OperationTimer::new("mount");
        timer.observe(self.mount_volume(name).await)
    }

    #[instrument(skip_all, fields(volume = %name))]
    async fn unmount(&self, name: &str) -> DriverResult<()> {
        let timer = OperationTimer::new("unmount");
        timer.observe(self.unmount_volume(name).await)
    }

    async fn path(&self, name: &str) -> DriverResult<VolumeSummary> {
        self.registry
            .read()
            .await
            .get(name)
            .map(VolumeRecord::summary)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn get(&self, name: &str) -> DriverResult<VolumeSummary> {
        self.registry
            .write()
            .await
            .get(name)
            .map(VolumeRecord::summary)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn list(&self) -> DriverResult<Vec<VolumeSummary>> {
        Ok(self.registry.write().await.summaries())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// Create the mountpoint directory if needed; fail if something else is there.
async fn ensure_mountpoint(mountpoint: &Path) -> DriverResult<()> {
    match tokio::fs::symlink_metadata(mountpoint).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(DriverError::Mount(format!(
            "{} already exists and is not a directory",
            mountpoint.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mountpoint).await.map_err(|e| {
                DriverError::Mount(format!(
                    "failed to create mountpoint {}: {}",
                    mountpoint.display(),
                    e
                ))
            })
        }
        Err(e) => Err(DriverError::Mount(format!(
            "failed to inspect mountpoint {}: {}",
            mountpoint.display(),
            e
        ))),
    }
}

fn note_teardown(
    failures: &mut Vec<String>,
    record: &VolumeRecord,
    step: &str,
    result: DriverResult<()>,
) {
    if let Err(e) = result {
        warn!(
            volume = %record.name,
            step = step,
            pool = %record.pool_name,
            zvol = %record.remote_name,
            target_id = record.target_id,
            extent_id = record.extent_id,
            target_group_id = record.target_group_id,
            target_to_extent_id = record.target_to_extent_id,
            error = %e,
            "Teardown step failed, continuing"
        );
        failures.push(format!("{}: {}", step, e));
    }
}

/// Write the state file; a failure is logged and does not fail the operation.
async fn persist(volumes: &RegistryWriteGuard<'_>) {
    if let Err(e) = volumes.persist().await {
        let e = DriverError::from(e);
        error!(error = %e, code = e.code(), "Failed to persist volume state");
    }
}

fn update_gauges(volumes: &RegistryWriteGuard<'_>) {
    metrics::set_volumes_count(volumes.len());
    metrics::set_mounted_count(volumes.mounted_count());
}
