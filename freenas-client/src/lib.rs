//! FreeNAS Appliance Client Library
//!
//! Thin asynchronous client for the FreeNAS v1.0 REST API covering the
//! objects the volume plugin provisions on the appliance: ZFS volumes
//! (zvols), iSCSI targets, extents, target groups, target-to-extent links,
//! portals, and service toggles.
//!
//! The library is split into:
//! - `client`: the HTTP client and one method per appliance operation
//! - `types`: stable entities handed to callers; raw wire shapes stay private
//! - `error`: the `ApiError` type

pub mod client;
pub mod error;
pub mod types;

pub use client::{ClientConfig, FreenasClient};
pub use error::{ApiError, Result};
pub use types::{ObjectId, Portal, ServiceState, StoragePool};
