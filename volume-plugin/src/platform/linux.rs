//! Linux platform implementation
//!
//! Uses Linux-specific tools:
//! - iscsiadm for iSCSI (open-iscsi)
//! - blkid for filesystem detection
//! - mkfs.xfs/mkfs.ext4 for filesystem formatting
//! - mount/umount

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{BlockDeviceMounter, IscsiInitiator};
use crate::error::{DriverError, DriverResult};

/// Default filesystem type for new volumes
pub const DEFAULT_FS_TYPE: &str = "xfs";

static BLKID_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"TYPE="([^"]*)""#).expect("Invalid regex pattern"));

/// Run a command and capture its output; only a failure to spawn is an error.
async fn run<F>(program: &str, args: &[&str], to_error: F) -> DriverResult<Output>
where
    F: Fn(String) -> DriverError,
{
    debug!(program = %program, args = ?args, "Executing command");
    Command::new(program).args(args).output().await.map_err(|e| {
        error!(error = %e, program = %program, "Failed to execute command");
        to_error(format!("Failed to execute {}: {}", program, e))
    })
}

/// Find the discovery record for `target_name` in `iscsiadm -m discovery` output.
///
/// Lines look like `10.0.0.5:3260,1 iqn.2005-10.org.freenas.ctl:docker-v1`.
/// Returns `(portal, iqn)` with the portal group tag stripped. When several
/// lines match, the last one wins.
pub fn parse_discovery(output: &str, target_name: &str) -> Option<(String, String)> {
    let suffix = format!(":{}", target_name);
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.ends_with(&suffix))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let address = fields.next()?;
            let iqn = fields.next()?;
            let portal = address.split(',').next().unwrap_or(address);
            Some((portal.to_string(), iqn.to_string()))
        })
        .next_back()
}

/// Extract the filesystem type from `blkid` output, if any.
pub fn parse_blkid_type(output: &str) -> Option<String> {
    BLKID_TYPE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|t| !t.is_empty())
}

/// Validate filesystem type for Linux.
pub fn validate_fs_type(fs_type: &str) -> DriverResult<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "xfs" | "" => Ok("xfs"),
        "ext4" => Ok("ext4"),
        _ => Err(DriverError::InvalidArgument(format!(
            "Unsupported filesystem on Linux: {}. Supported: xfs, ext4",
            fs_type
        ))),
    }
}

/// open-iscsi initiator driven through `iscsiadm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Iscsiadm;

impl Iscsiadm {
    async fn discover(&self, host: &str, target_name: &str) -> DriverResult<(String, String)> {
        let output = run(
            "iscsiadm",
            &["-m", "discovery", "-t", "st", "-p", host],
            DriverError::Initiator,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, host = %host, "iscsiadm discovery failed");
            return Err(DriverError::Initiator(format!(
                "iscsiadm discovery against {} failed: {}",
                host, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_discovery(&stdout, target_name).ok_or_else(|| {
            DriverError::Initiator(format!(
                "target '{}' not advertised by {}",
                target_name, host
            ))
        })
    }
}

#[async_trait]
impl IscsiInitiator for Iscsiadm {
    async fn discover_iqn(&self, host: &str, target_name: &str) -> DriverResult<String> {
        let (_, iqn) = self.discover(host, target_name).await?;
        info!(target = %target_name, iqn = %iqn, "iSCSI discovery successful");
        Ok(iqn)
    }

    async fn login(&self, iqn: &str) -> DriverResult<()> {
        let target = format!("--targetname={}", iqn);
        let output = run(
            "iscsiadm",
            &["-m", "node", target.as_str(), "--login"],
            DriverError::Initiator,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Check if already logged in
            if stderr.contains("already present") || stderr.contains("session already exists") {
                info!(iqn = %iqn, "iSCSI session already exists");
                return Ok(());
            }
            error!(stderr = %stderr, "iscsiadm login failed");
            return Err(DriverError::Initiator(format!(
                "iscsiadm login failed: {}",
                stderr
            )));
        }

        info!(iqn = %iqn, "iSCSI login successful");
        Ok(())
    }

    async fn logout(&self, iqn: &str) -> DriverResult<()> {
        info!(iqn = %iqn, "Disconnecting from iSCSI target");

        let target = format!("--targetname={}", iqn);
        let output = run(
            "iscsiadm",
            &["-m", "node", target.as_str(), "--logout"],
            DriverError::Initiator,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Treat "not logged in" as success
            if stderr.contains("No matching sessions") || stderr.contains("not logged in") {
                warn!(iqn = %iqn, "iSCSI target was not logged in");
                return Ok(());
            }
            error!(stderr = %stderr, "iscsiadm logout failed");
            return Err(DriverError::Initiator(format!(
                "iscsiadm logout failed: {}",
                stderr
            )));
        }

        Ok(())
    }

    async fn resolve_device_path(&self, host: &str, target_name: &str) -> DriverResult<PathBuf> {
        let (portal, iqn) = self.discover(host, target_name).await?;
        Ok(PathBuf::from(format!(
            "/dev/disk/by-path/ip-{}-iscsi-{}-lun-0",
            portal, iqn
        )))
    }
}

/// Formats and mounts with the standard util-linux tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

#[async_trait]
impl BlockDeviceMounter for SystemMounter {
    async fn detect_filesystem(&self, device: &Path) -> DriverResult<Option<String>> {
        let device = device.to_string_lossy().into_owned();
        let output = run("blkid", &[device.as_str()], DriverError::Mount).await?;
        // blkid exits non-zero when the device carries no recognizable filesystem
        Ok(parse_blkid_type(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn format(&self, device: &Path, fs_type: &str) -> DriverResult<()> {
        info!(device = %device.display(), fs_type = %fs_type, "Formatting device");

        let (program, force) = match validate_fs_type(fs_type)? {
            "ext4" => ("mkfs.ext4", "-F"),
            _ => ("mkfs.xfs", "-f"),
        };
        let device = device.to_string_lossy().into_owned();
        let output = run(program, &[force, device.as_str()], DriverError::Mount).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "{} failed", program);
            return Err(DriverError::Mount(format!("{} failed: {}", program, stderr)));
        }

        Ok(())
    }

    async fn mount(&self, device: &Path, mountpoint: &Path, fs_type: &str) -> DriverResult<()> {
        info!(
            device = %device.display(),
            target = %mountpoint.display(),
            fs_type = %fs_type,
            "Mounting device"
        );

        let fs_type = fs_type.to_lowercase();
        let device = device.to_string_lossy().into_owned();
        let target = mountpoint.to_string_lossy().into_owned();
        let output = run(
            "mount",
            &["-t", fs_type.as_str(), device.as_str(), target.as_str()],
            DriverError::Mount,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "mount failed");
            return Err(DriverError::Mount(format!("mount failed: {}", stderr)));
        }

        Ok(())
    }

    async fn unmount(&self, mountpoint: &Path) -> DriverResult<()> {
        info!(target = %mountpoint.display(), "Unmounting");

        let target = mountpoint.to_string_lossy().into_owned();
        let output = run("umount", &[target.as_str()], DriverError::Mount).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Treat "not mounted" as success
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target, "Path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(DriverError::Mount(format!("umount failed: {}", stderr)));
        }

        Ok(())
    }
}
