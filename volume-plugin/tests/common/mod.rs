//! In-memory stand-ins for the appliance, the iSCSI initiator and the mounter.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use freenas_client::{ObjectId, Portal, StoragePool};
use freenas_volume_plugin::platform::{BlockDeviceMounter, IscsiInitiator};
use freenas_volume_plugin::provisioner::StorageProvisioner;
use freenas_volume_plugin::registry::STATE_FILE_NAME;
use freenas_volume_plugin::types::GIB;
use freenas_volume_plugin::{
    DevicePollPolicy, DriverError, DriverResult, DriverSettings, IscsiVolumeDriver, Registry,
};

pub const PORTAL_ID: ObjectId = 1;
pub const APPLIANCE_HOST: &str = "nas.test";

// ============================================================================
// Appliance
// ============================================================================

#[derive(Default)]
pub struct ApplianceState {
    pub pools: Vec<StoragePool>,
    pub portals: Vec<Portal>,
    pub service_enabled: bool,
    /// (operation, detail) in call order
    pub calls: Vec<(String, String)>,
    pub failing: HashSet<&'static str>,
    next_id: ObjectId,
}

#[derive(Default)]
pub struct FakeAppliance {
    pub state: Mutex<ApplianceState>,
}

impl FakeAppliance {
    pub fn with_pools(pools: &[(&str, u64)]) -> Self {
        let appliance = Self::default();
        appliance.state.lock().unwrap().pools = pools
            .iter()
            .map(|(name, gib)| StoragePool {
                name: name.to_string(),
                available_bytes: gib * GIB,
            })
            .collect();
        appliance
    }

    pub fn fail(&self, operation: &'static str) {
        self.state.lock().unwrap().failing.insert(operation);
    }

    pub fn set_portals(&self, portals: Vec<Portal>) {
        self.state.lock().unwrap().portals = portals;
    }

    pub fn set_service_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().service_enabled = enabled;
    }

    /// Operation names in call order.
    pub fn operations(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(op, _)| op.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.operations().iter().filter(|op| *op == operation).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn call(&self, operation: &'static str, detail: String) -> DriverResult<ObjectId> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((operation.to_string(), detail));
        if state.failing.contains(operation) {
            return Err(DriverError::RemoteProvisioning(format!(
                "{} returned HTTP 500",
                operation
            )));
        }
        state.next_id += 1;
        Ok(state.next_id)
    }
}

#[async_trait]
impl StorageProvisioner for FakeAppliance {
    async fn list_pools(&self) -> DriverResult<Vec<StoragePool>> {
        self.call("list_pools", String::new())?;
        Ok(self.state.lock().unwrap().pools.clone())
    }

    async fn create_zvol(&self, pool: &str, name: &str, size_gib: u64) -> DriverResult<()> {
        self.call("create_zvol", format!("{}/{} {}G", pool, name, size_gib))
            .map(|_| ())
    }

    async fn delete_zvol(&self, pool: &str, name: &str) -> DriverResult<()> {
        self.call("delete_zvol", format!("{}/{}", pool, name))
            .map(|_| ())
    }

    async fn create_target(&self, name: &str) -> DriverResult<ObjectId> {
        self.call("create_target", name.to_string())
    }

    async fn delete_target(&self, id: ObjectId) -> DriverResult<()> {
        self.call("delete_target", id.to_string()).map(|_| ())
    }

    async fn create_extent(&self, name: &str, pool: &str, zvol: &str) -> DriverResult<ObjectId> {
        self.call("create_extent", format!("{} zvol/{}/{}", name, pool, zvol))
    }

    async fn delete_extent(&self, id: ObjectId) -> DriverResult<()> {
        self.call("delete_extent", id.to_string()).map(|_| ())
    }

    async fn create_target_group(
        &self,
        target_id: ObjectId,
        portal_id: ObjectId,
    ) -> DriverResult<ObjectId> {
        self.call(
            "create_target_group",
            format!("target={} portal={}", target_id, portal_id),
        )
    }

    async fn delete_target_group(&self, id: ObjectId) -> DriverResult<()> {
        self.call("delete_target_group", id.to_string()).map(|_| ())
    }

    async fn link_target_extent(
        &self,
        target_id: ObjectId,
        extent_id: ObjectId,
    ) -> DriverResult<ObjectId> {
        self.call(
            "link_target_extent",
            format!("target={} extent={}", target_id, extent_id),
        )
    }

    async fn unlink_target_extent(&self, id: ObjectId) -> DriverResult<()> {
        self.call("unlink_target_extent", id.to_string())
            .map(|_| ())
    }

    async fn list_portals(&self) -> DriverResult<Vec<Portal>> {
        self.call("list_portals", String::new())?;
        Ok(self.state.lock().unwrap().portals.clone())
    }

    async fn create_portal(&self, listen: &[String]) -> DriverResult<ObjectId> {
        let id = self.call("create_portal", listen.join(","))?;
        self.state.lock().unwrap().portals.push(Portal {
            id,
            listen: listen.to_vec(),
        });
        Ok(id)
    }

    async fn service_enabled(&self, service: &str) -> DriverResult<bool> {
        self.call("service_enabled", service.to_string())?;
        Ok(self.state.lock().unwrap().service_enabled)
    }

    async fn set_service_enabled(&self, service: &str, enabled: bool) -> DriverResult<()> {
        self.call("set_service_enabled", format!("{}={}", service, enabled))?;
        self.state.lock().unwrap().service_enabled = enabled;
        Ok(())
    }
}

// ============================================================================
// Initiator
// ============================================================================

#[derive(Default)]
pub struct InitiatorState {
    pub logins: Vec<String>,
    pub logouts: Vec<String>,
    pub fail_login: bool,
    pub fail_logout: bool,
    /// Polls that report the device missing before it shows up
    pub absent_polls: u32,
    pub polls: u32,
}

#[derive(Default)]
pub struct FakeInitiator {
    pub state: Mutex<InitiatorState>,
}

impl FakeInitiator {
    pub fn iqn_for(target_name: &str) -> String {
        format!("iqn.2005-10.org.freenas.ctl:{}", target_name)
    }

    pub fn device_for(target_name: &str) -> PathBuf {
        PathBuf::from(format!("/dev/fake/{}", target_name))
    }

    pub fn logins(&self) -> Vec<String> {
        self.state.lock().unwrap().logins.clone()
    }

    pub fn logouts(&self) -> Vec<String> {
        self.state.lock().unwrap().logouts.clone()
    }

    pub fn polls(&self) -> u32 {
        self.state.lock().unwrap().polls
    }
}

#[async_trait]
impl IscsiInitiator for FakeInitiator {
    async fn discover_iqn(&self, host: &str, target_name: &str) -> DriverResult<String> {
        assert_eq!(host, APPLIANCE_HOST);
        Ok(Self::iqn_for(target_name))
    }

    async fn login(&self, iqn: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_login {
            return Err(DriverError::Initiator("iscsiadm login failed".into()));
        }
        state.logins.push(iqn.to_string());
        Ok(())
    }

    async fn logout(&self, iqn: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_logout {
            return Err(DriverError::Initiator("iscsiadm logout failed".into()));
        }
        state.logouts.push(iqn.to_string());
        Ok(())
    }

    async fn resolve_device_path(&self, host: &str, target_name: &str) -> DriverResult<PathBuf> {
        assert_eq!(host, APPLIANCE_HOST);
        Ok(Self::device_for(target_name))
    }

    async fn device_present(&self, _device: &Path) -> bool {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        state.polls > state.absent_polls
    }
}

// ============================================================================
// Mounter
// ============================================================================

#[derive(Default)]
pub struct MounterState {
    pub filesystems: HashMap<PathBuf, String>,
    pub formats: Vec<(PathBuf, String)>,
    pub mounts: Vec<(PathBuf, PathBuf)>,
    pub unmounts: Vec<PathBuf>,
    pub fail_mount: bool,
    pub fail_unmount: bool,
}

#[derive(Default)]
pub struct FakeMounter {
    pub state: Mutex<MounterState>,
}

impl FakeMounter {
    pub fn mounts(&self) -> usize {
        self.state.lock().unwrap().mounts.len()
    }

    pub fn unmounts(&self) -> usize {
        self.state.lock().unwrap().unmounts.len()
    }

    pub fn formats(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().unwrap().formats.clone()
    }
}

#[async_trait]
impl BlockDeviceMounter for FakeMounter {
    async fn detect_filesystem(&self, device: &Path) -> DriverResult<Option<String>> {
        Ok(self.state.lock().unwrap().filesystems.get(device).cloned())
    }

    async fn format(&self, device: &Path, fs_type: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .filesystems
            .insert(device.to_path_buf(), fs_type.to_string());
        state
            .formats
            .push((device.to_path_buf(), fs_type.to_string()));
        Ok(())
    }

    async fn mount(&self, device: &Path, mountpoint: &Path, _fs_type: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mount {
            return Err(DriverError::Mount("mount failed: wrong fs type".into()));
        }
        state
            .mounts
            .push((device.to_path_buf(), mountpoint.to_path_buf()));
        Ok(())
    }

    async fn unmount(&self, mountpoint: &Path) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_unmount {
            return Err(DriverError::Mount("umount failed: target is busy".into()));
        }
        state.unmounts.push(mountpoint.to_path_buf());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub temp: TempDir,
    pub appliance: Arc<FakeAppliance>,
    pub initiator: Arc<FakeInitiator>,
    pub mounter: Arc<FakeMounter>,
    pub driver: Arc<IscsiVolumeDriver>,
}

impl Harness {
    /// Driver over a fresh temp root and an appliance with the given pools (GiB).
    pub async fn new(pools: &[(&str, u64)]) -> Self {
        let temp = TempDir::new().unwrap();
        let state_path = temp.path().join(STATE_FILE_NAME);
        Self::build(temp, state_path, pools).await
    }

    /// Like [`Harness::new`] but with a state file that cannot be written.
    pub async fn with_unwritable_state(pools: &[(&str, u64)]) -> Self {
        let temp = TempDir::new().unwrap();
        let state_path = temp.path().join("missing-dir").join(STATE_FILE_NAME);
        Self::build(temp, state_path, pools).await
    }

    async fn build(temp: TempDir, state_path: PathBuf, pools: &[(&str, u64)]) -> Self {
        let appliance = Arc::new(FakeAppliance::with_pools(pools));
        let initiator = Arc::new(FakeInitiator::default());
        let mounter = Arc::new(FakeMounter::default());
        let registry = Registry::load(&state_path).await.unwrap();
        let driver = Arc::new(IscsiVolumeDriver::new(
            registry,
            appliance.clone(),
            initiator.clone(),
            mounter.clone(),
            settings(temp.path()),
        ));
        Self {
            temp,
            appliance,
            initiator,
            mounter,
            driver,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// A second driver process over the same root and state file.
    pub async fn restart(&self) -> IscsiVolumeDriver {
        let registry = Registry::load(self.root().join(STATE_FILE_NAME))
            .await
            .unwrap();
        IscsiVolumeDriver::new(
            registry,
            self.appliance.clone(),
            self.initiator.clone(),
            self.mounter.clone(),
            settings(self.root()),
        )
    }
}

pub fn settings(root: &Path) -> DriverSettings {
    DriverSettings {
        root: root.to_path_buf(),
        appliance_host: APPLIANCE_HOST.to_string(),
        portal_id: PORTAL_ID,
        fs_type: "xfs".to_string(),
        device_poll: DevicePollPolicy {
            attempts: 5,
            interval: Duration::from_millis(1),
        },
    }
}

pub fn size_opts(size: &str) -> HashMap<String, String> {
    HashMap::from([("size".to_string(), size.to_string())])
}
