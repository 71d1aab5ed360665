//! Host-side iSCSI and filesystem operations.
//!
//! The lifecycle controller depends only on the [`IscsiInitiator`] and
//! [`BlockDeviceMounter`] traits. The Linux implementations shell out to
//! open-iscsi and util-linux tools.
//!
//! # Usage
//!
//! ```ignore
//! use crate::platform::{BlockDeviceMounter, IscsiInitiator, Iscsiadm, SystemMounter};
//!
//! let iqn = Iscsiadm.discover_iqn("nas.local", "docker-v1").await?;
//! Iscsiadm.login(&iqn).await?;
//! let device = Iscsiadm.resolve_device_path("nas.local", "docker-v1").await?;
//! SystemMounter.format(&device, "xfs").await?;
//! ```

mod linux;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::DriverResult;

pub use linux::{
    DEFAULT_FS_TYPE, Iscsiadm, SystemMounter, parse_blkid_type, parse_discovery, validate_fs_type,
};

/// iSCSI initiator operations.
///
/// Failures are reported as `DriverError::Initiator`.
#[async_trait]
pub trait IscsiInitiator: Send + Sync {
    /// Find the IQN of `target_name` among the targets `host` advertises.
    async fn discover_iqn(&self, host: &str, target_name: &str) -> DriverResult<String>;

    async fn login(&self, iqn: &str) -> DriverResult<()>;

    async fn logout(&self, iqn: &str) -> DriverResult<()>;

    /// Block device path the kernel creates once a session to `target_name` is up.
    async fn resolve_device_path(&self, host: &str, target_name: &str) -> DriverResult<PathBuf>;

    /// Whether the device node exists yet.
    async fn device_present(&self, device: &Path) -> bool {
        tokio::fs::try_exists(device).await.unwrap_or(false)
    }
}

/// Filesystem and mount operations on block devices.
///
/// Failures are reported as `DriverError::Mount`.
#[async_trait]
pub trait BlockDeviceMounter: Send + Sync {
    /// Filesystem type currently on `device`, or `None` if it has none.
    async fn detect_filesystem(&self, device: &Path) -> DriverResult<Option<String>>;

    async fn format(&self, device: &Path, fs_type: &str) -> DriverResult<()>;

    async fn mount(&self, device: &Path, mountpoint: &Path, fs_type: &str) -> DriverResult<()>;

    async fn unmount(&self, mountpoint: &Path) -> DriverResult<()>;
}
