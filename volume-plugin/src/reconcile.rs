//! Startup reconciliation against the appliance.
//!
//! Both steps are idempotent: running them against an appliance that is
//! already configured changes nothing.

use freenas_client::ObjectId;
use tracing::{info, instrument};

use crate::error::DriverResult;
use crate::provisioner::StorageProvisioner;

/// Appliance service that serves iSCSI targets
pub const ISCSI_SERVICE: &str = "iscsitarget";

/// Portal every target is attached to: all addresses, well-known iSCSI port
pub const WILDCARD_PORTAL: &str = "0.0.0.0:3260";

/// Enable the iSCSI target service if it is off.
///
/// Returns `true` if the service had to be enabled.
#[instrument(skip(provisioner))]
pub async fn ensure_iscsi_service(provisioner: &dyn StorageProvisioner) -> DriverResult<bool> {
    if provisioner.service_enabled(ISCSI_SERVICE).await? {
        info!(service = ISCSI_SERVICE, "iSCSI service already enabled");
        return Ok(false);
    }

    provisioner.set_service_enabled(ISCSI_SERVICE, true).await?;
    info!(service = ISCSI_SERVICE, "Enabled iSCSI service");
    Ok(true)
}

/// Find the wildcard portal, creating it if no portal listens there.
#[instrument(skip(provisioner))]
pub async fn reconcile_portal(provisioner: &dyn StorageProvisioner) -> DriverResult<ObjectId> {
    let portals = provisioner.list_portals().await?;
    if let Some(portal) = portals.iter().find(|p| p.listens_on(WILDCARD_PORTAL)) {
        info!(portal_id = portal.id, "Reusing existing iSCSI portal");
        return Ok(portal.id);
    }

    let id = provisioner
        .create_portal(&[WILDCARD_PORTAL.to_string()])
        .await?;
    info!(portal_id = id, listen = WILDCARD_PORTAL, "Created iSCSI portal");
    Ok(id)
}
