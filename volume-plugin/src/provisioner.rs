//! Storage Provisioning Service contract.
//!
//! The lifecycle controller talks to the appliance only through
//! [`StorageProvisioner`]. The production implementation forwards to
//! [`FreenasClient`]; tests substitute an in-memory fake.

use async_trait::async_trait;

use freenas_client::{FreenasClient, ObjectId, Portal, StoragePool};

use crate::error::DriverResult;

/// Remote operations on the storage appliance.
///
/// Every failure is reported as `DriverError::RemoteProvisioning`.
#[async_trait]
pub trait StorageProvisioner: Send + Sync {
    async fn list_pools(&self) -> DriverResult<Vec<StoragePool>>;

    async fn create_zvol(&self, pool: &str, name: &str, size_gib: u64) -> DriverResult<()>;

    async fn delete_zvol(&self, pool: &str, name: &str) -> DriverResult<()>;

    async fn create_target(&self, name: &str) -> DriverResult<ObjectId>;

    async fn delete_target(&self, id: ObjectId) -> DriverResult<()>;

    /// Create a disk extent backed by zvol `pool/zvol`.
    async fn create_extent(&self, name: &str, pool: &str, zvol: &str) -> DriverResult<ObjectId>;

    async fn delete_extent(&self, id: ObjectId) -> DriverResult<()>;

    /// Bind a target to a portal.
    async fn create_target_group(
        &self,
        target_id: ObjectId,
        portal_id: ObjectId,
    ) -> DriverResult<ObjectId>;

    async fn delete_target_group(&self, id: ObjectId) -> DriverResult<()>;

    async fn link_target_extent(
        &self,
        target_id: ObjectId,
        extent_id: ObjectId,
    ) -> DriverResult<ObjectId>;

    async fn unlink_target_extent(&self, id: ObjectId) -> DriverResult<()>;

    async fn list_portals(&self) -> DriverResult<Vec<Portal>>;

    /// Create a portal listening on the given `ip:port` pairs, returning its id.
    async fn create_portal(&self, listen: &[String]) -> DriverResult<ObjectId>;

    async fn service_enabled(&self, service: &str) -> DriverResult<bool>;

    async fn set_service_enabled(&self, service: &str, enabled: bool) -> DriverResult<()>;
}

#[async_trait]
impl StorageProvisioner for FreenasClient {
    async fn list_pools(&self) -> DriverResult<Vec<StoragePool>> {
        Ok(FreenasClient::list_pools(self).await?)
    }

    async fn create_zvol(&self, pool: &str, name: &str, size_gib: u64) -> DriverResult<()> {
        Ok(FreenasClient::create_zvol(self, pool, name, size_gib).await?)
    }

    async fn delete_zvol(&self, pool: &str, name: &str) -> DriverResult<()> {
        Ok(FreenasClient::delete_zvol(self, pool, name).await?)
    }

    async fn create_target(&self, name: &str) -> DriverResult<ObjectId> {
        Ok(FreenasClient::create_target(self, name).await?)
    }

    async fn delete_target(&self, id: ObjectId) -> DriverResult<()> {
        Ok(FreenasClient::delete_target(self, id).await?)
    }

    async fn create_extent(&self, name: &str, pool: &str, zvol: &str) -> DriverResult<ObjectId> {
        Ok(FreenasClient::create_extent(self, name, pool, zvol).await?)
    }

    async fn delete_extent(&self, id: ObjectId) -> DriverResult<()> {
        Ok(FreenasClient::delete_extent(self, id).await?)
    }

    async fn create_target_group(
        &self,
        target_id: ObjectId,
        portal_id: ObjectId,
    ) -> DriverResult<ObjectId> {
        Ok(FreenasClient::create_target_group(self, target_id, portal_id).await?)
    }

    async fn delete_target_group(&self, id: ObjectId) -> DriverResult<()> {
        Ok(FreenasClient::delete_target_group(self, id).await?)
    }

    async fn link_target_extent(
        &self,
        target_id: ObjectId,
        extent_id: ObjectId,
    ) -> DriverResult<ObjectId> {
        Ok(FreenasClient::link_target_extent(self, target_id, extent_id).await?)
    }

    async fn unlink_target_extent(&self, id: ObjectId) -> DriverResult<()> {
        Ok(FreenasClient::unlink_target_extent(self, id).await?)
    }

    async fn list_portals(&self) -> DriverResult<Vec<Portal>> {
        Ok(FreenasClient::list_portals(self).await?)
    }

    async fn create_portal(&self, listen: &[String]) -> DriverResult<ObjectId> {
        Ok(FreenasClient::create_portal(self, listen).await?.id)
    }

    async fn service_enabled(&self, service: &str) -> DriverResult<bool> {
        Ok(FreenasClient::service_state(self, service).await?.enabled)
    }

    async fn set_service_enabled(&self, service: &str, enabled: bool) -> DriverResult<()> {
        FreenasClient::set_service_enabled(self, service, enabled).await?;
        Ok(())
    }
}
