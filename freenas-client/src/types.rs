//! Appliance entities and their wire representations.
//!
//! The REST API returns loosely shaped JSON. Each response is first decoded
//! into a crate-private `Raw*` record mirroring the wire format, then
//! projected into the public entity callers work with.

use serde::Deserialize;

/// Numeric identifier the appliance assigns to targets, extents, target
/// groups, target-to-extent links and portals.
pub type ObjectId = i64;

// ============================================================================
// StoragePool
// ============================================================================

/// A storage pool (FreeNAS "volume") and the space left in it when queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePool {
    pub name: String,
    pub available_bytes: u64,
}

/// Pool as returned by `GET storage/volume/`.
///
/// The top-level `avail` counts space reserved by the pool itself; the usable
/// figure is the `avail` of the root dataset, which the API nests as the
/// first entry of `children`.
#[derive(Debug, Deserialize)]
pub(crate) struct RawVolume {
    name: String,
    #[serde(default)]
    avail: Option<u64>,
    #[serde(default)]
    children: Vec<RawDataset>,
}

#[derive(Debug, Deserialize)]
struct RawDataset {
    #[serde(default)]
    avail: Option<u64>,
}

impl From<RawVolume> for StoragePool {
    fn from(raw: RawVolume) -> Self {
        let available_bytes = raw
            .children
            .first()
            .and_then(|child| child.avail)
            .or(raw.avail)
            .unwrap_or(0);
        Self {
            name: raw.name,
            available_bytes,
        }
    }
}

// ============================================================================
// Portal
// ============================================================================

/// An iSCSI portal and the `ip:port` pairs it listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    pub id: ObjectId,
    pub listen: Vec<String>,
}

impl Portal {
    /// Whether this portal listens on the given `ip:port`.
    pub fn listens_on(&self, address: &str) -> bool {
        self.listen.iter().any(|l| l == address)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawPortal {
    id: ObjectId,
    #[serde(default)]
    iscsi_target_portal_ips: Vec<String>,
}

impl From<RawPortal> for Portal {
    fn from(raw: RawPortal) -> Self {
        Self {
            id: raw.id,
            listen: raw.iscsi_target_portal_ips,
        }
    }
}

// ============================================================================
// ServiceState
// ============================================================================

/// On/off state of an appliance service such as `iscsitarget`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub id: ObjectId,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawService {
    id: ObjectId,
    srv_service: String,
    srv_enable: bool,
}

impl From<RawService> for ServiceState {
    fn from(raw: RawService) -> Self {
        Self {
            id: raw.id,
            name: raw.srv_service,
            enabled: raw.srv_enable,
        }
    }
}

/// Any created iSCSI object; only the assigned id is of interest.
#[derive(Debug, Deserialize)]
pub(crate) struct RawCreated {
    pub(crate) id: ObjectId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_uses_nested_avail() {
        let json = r#"[{
            "avail": 59587211264,
            "children": [{"avail": 57725628416, "children": [], "name": "tank"}],
            "id": 1,
            "name": "tank",
            "status": "HEALTHY",
            "used": 1000,
            "used_pct": "1%"
        }]"#;

        let raw: Vec<RawVolume> = serde_json::from_str(json).unwrap();
        let pools: Vec<StoragePool> = raw.into_iter().map(StoragePool::from).collect();

        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].name, "tank");
        assert_eq!(pools[0].available_bytes, 57725628416);
    }

    #[test]
    fn test_pool_without_children_falls_back_to_top_level() {
        let json = r#"{"name": "scratch", "avail": 1024, "children": []}"#;
        let raw: RawVolume = serde_json::from_str(json).unwrap();
        assert_eq!(StoragePool::from(raw).available_bytes, 1024);

        let json = r#"{"name": "empty"}"#;
        let raw: RawVolume = serde_json::from_str(json).unwrap();
        assert_eq!(StoragePool::from(raw).available_bytes, 0);
    }

    #[test]
    fn test_portal_listens_on() {
        let raw: RawPortal = serde_json::from_str(
            r#"{"id": 4, "iscsi_target_portal_ips": ["10.0.0.1:3260", "0.0.0.0:3260"]}"#,
        )
        .unwrap();
        let portal = Portal::from(raw);

        assert_eq!(portal.id, 4);
        assert!(portal.listens_on("0.0.0.0:3260"));
        assert!(!portal.listens_on("0.0.0.0:3261"));
    }

    #[test]
    fn test_service_state_decode() {
        let raw: RawService = serde_json::from_str(
            r#"{"id": 9, "srv_service": "iscsitarget", "srv_enable": false}"#,
        )
        .unwrap();
        let state = ServiceState::from(raw);
        assert_eq!(state.name, "iscsitarget");
        assert!(!state.enabled);
    }
}
