use thiserror::Error;

use freenas_client::ApiError;

/// Failure reading or writing the state file.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("volume '{0}' not found")]
    NotFound(String),

    #[error("volume '{0}' already exists")]
    AlreadyExists(String),

    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("volume '{0}' is in use")]
    VolumeBusy(String),

    #[error("remote provisioning failed: {0}")]
    RemoteProvisioning(String),

    #[error("iSCSI initiator failed: {0}")]
    Initiator(String),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("failed to persist state: {0}")]
    Persistence(#[from] StateError),
}

impl DriverError {
    /// Stable label for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::InvalidArgument(_) => "invalid_argument",
            DriverError::NotFound(_) => "not_found",
            DriverError::AlreadyExists(_) => "already_exists",
            DriverError::InsufficientCapacity(_) => "insufficient_capacity",
            DriverError::VolumeBusy(_) => "volume_busy",
            DriverError::RemoteProvisioning(_) => "remote_provisioning_error",
            DriverError::Initiator(_) => "initiator_error",
            DriverError::Mount(_) => "mount_error",
            DriverError::Persistence(_) => "persistence_error",
        }
    }
}

impl From<ApiError> for DriverError {
    fn from(e: ApiError) -> Self {
        DriverError::RemoteProvisioning(e.to_string())
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;
