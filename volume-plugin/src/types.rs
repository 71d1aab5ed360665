//! Core data model for plugin-managed volumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use freenas_client::ObjectId;

use crate::error::{DriverError, DriverResult};

/// Prefix applied to a volume name to form its appliance-side name.
pub const REMOTE_NAME_PREFIX: &str = "docker-";

/// Option key carrying the requested size in GiB.
pub const SIZE_OPTION: &str = "size";

/// Bytes per GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// A fully provisioned volume.
///
/// Serialized field names match the on-disk state format. The map key
/// supplies `name` on load, and `connections` always starts at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "Name")]
    pub remote_name: String,
    #[serde(rename = "Size")]
    pub size_gib: u64,
    #[serde(rename = "Mountpoint")]
    pub mountpoint: PathBuf,
    #[serde(rename = "PoolName")]
    pub pool_name: String,
    #[serde(rename = "TargetID")]
    pub target_id: ObjectId,
    #[serde(rename = "ExtentID")]
    pub extent_id: ObjectId,
    #[serde(rename = "TargetGroupID")]
    pub target_group_id: ObjectId,
    #[serde(rename = "TargetToExtentID")]
    pub target_to_extent_id: ObjectId,
    /// Active mount holders; in-memory only
    #[serde(skip)]
    pub connections: u32,
}

impl VolumeRecord {
    pub fn summary(&self) -> VolumeSummary {
        VolumeSummary {
            name: self.name.clone(),
            mountpoint: self.mountpoint.clone(),
        }
    }
}

/// A volume whose remote objects are still being created.
///
/// Identifiers are filled in as each step succeeds so a failure part way
/// through can report exactly what was left behind on the appliance.
#[derive(Debug, Clone, Default)]
pub struct PendingVolume {
    pub name: String,
    pub remote_name: String,
    pub size_gib: u64,
    pub mountpoint: PathBuf,
    pub pool_name: String,
    pub zvol_created: bool,
    pub target_id: Option<ObjectId>,
    pub target_group_id: Option<ObjectId>,
    pub extent_id: Option<ObjectId>,
    pub target_to_extent_id: Option<ObjectId>,
}

impl PendingVolume {
    /// Convert into a record once every remote object exists.
    pub fn complete(&self) -> Option<VolumeRecord> {
        if !self.zvol_created {
            return None;
        }
        Some(VolumeRecord {
            name: self.name.clone(),
            remote_name: self.remote_name.clone(),
            size_gib: self.size_gib,
            mountpoint: self.mountpoint.clone(),
            pool_name: self.pool_name.clone(),
            target_id: self.target_id?,
            extent_id: self.extent_id?,
            target_group_id: self.target_group_id?,
            target_to_extent_id: self.target_to_extent_id?,
            connections: 0,
        })
    }
}

/// What List/Get/Path expose about a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSummary {
    pub name: String,
    pub mountpoint: PathBuf,
}

/// Plugin capabilities reported to the container runtime.
///
/// Volumes are attached to a single host, so the scope is always `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub scope: &'static str,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { scope: "local" }
    }
}

/// Parse the required `size` option (GiB, > 0).
///
/// Returns the size in GiB. Other option keys are ignored.
pub fn parse_size(options: &HashMap<String, String>) -> DriverResult<u64> {
    let raw = options
        .get(SIZE_OPTION)
        .ok_or_else(|| DriverError::InvalidArgument("option 'size' is required".to_string()))?;

    let size: i64 = raw.trim().parse().map_err(|_| {
        DriverError::InvalidArgument(format!("option 'size' must be an integer, got '{}'", raw))
    })?;
    if size <= 0 {
        return Err(DriverError::InvalidArgument(format!(
            "option 'size' must be positive, got {}",
            size
        )));
    }

    let size = size as u64;
    size.checked_mul(GIB).ok_or_else(|| {
        DriverError::InvalidArgument(format!("option 'size' is too large: {}", size))
    })?;
    Ok(size)
}

/// Validate that a volume name is safe for mount paths and appliance names.
/// Only allows ASCII alphanumerics, underscores, hyphens, and periods.
pub fn validate_volume_name(name: &str) -> DriverResult<()> {
    if name.is_empty() {
        return Err(DriverError::InvalidArgument(
            "volume name cannot be empty".into(),
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(DriverError::InvalidArgument(format!(
            "volume name '{}' must start with a letter or digit",
            name
        )));
    }
    if name.contains("..") {
        return Err(DriverError::InvalidArgument(
            "path traversal not allowed in volume name".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(DriverError::InvalidArgument(format!(
            "invalid characters in volume name '{}': only alphanumeric, underscore, hyphen, and period allowed",
            name
        )));
    }
    Ok(())
}

pub fn remote_name_for(name: &str) -> String {
    format!("{}{}", REMOTE_NAME_PREFIX, name)
}

/// `<root>/volumes/<name>`
pub fn mountpoint_for(root: &Path, name: &str) -> PathBuf {
    root.join("volumes").join(name)
}
