//! FreeNAS iSCSI Volume Plugin Library
//!
//! Provisions block volumes on a FreeNAS appliance over iSCSI and exposes
//! them to Docker as mountable paths.
//!
//! The library is split into:
//! - `driver`: the lifecycle controller and the `VolumeDriver` contract
//! - `registry`: the locked name → record map and its state file
//! - `capacity`: storage pool selection
//! - `reconcile`: startup checks against the appliance
//! - `provisioner`: appliance operations behind a trait
//! - `platform`: host iSCSI initiator and filesystem tooling
//! - `plugin`: the Docker plugin protocol endpoint
//! - `metrics`: Prometheus instrumentation

pub mod capacity;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod platform;
pub mod plugin;
pub mod provisioner;
pub mod reconcile;
pub mod registry;
pub mod types;

pub use driver::{DevicePollPolicy, DriverSettings, IscsiVolumeDriver, VolumeDriver};
pub use error::{DriverError, DriverResult, StateError};
pub use registry::Registry;
