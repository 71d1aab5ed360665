//! HTTP client for the FreeNAS v1.0 REST API.
//!
//! Every call is a single authenticated request/response. Responses outside
//! the 2xx range are returned as `ApiError::Status` with the body attached so
//! the appliance's validation message reaches the logs.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{ApiError, Result};
use crate::types::{
    ObjectId, Portal, RawCreated, RawPortal, RawService, RawVolume, ServiceState, StoragePool,
};

const VOLUME_URI: &str = "/api/v1.0/storage/volume/";
const SERVICES_URI: &str = "/api/v1.0/services/services/";
const TARGET_URI: &str = "/api/v1.0/services/iscsi/target/";
const PORTAL_URI: &str = "/api/v1.0/services/iscsi/portal/";
const EXTENT_URI: &str = "/api/v1.0/services/iscsi/extent/";
const TARGET_TO_EXTENT_URI: &str = "/api/v1.0/services/iscsi/targettoextent/";
const TARGET_GROUP_URI: &str = "/api/v1.0/services/iscsi/targetgroup/";

/// Default per-request timeout
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Connection settings for the appliance API.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `https://192.168.67.68`
    pub url: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification (appliances usually ship self-signed certs)
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            accept_invalid_certs: true,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Client for a single FreeNAS appliance.
#[derive(Debug, Clone)]
pub struct FreenasClient {
    base: String,
    host: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl FreenasClient {
    /// Build a client, validating the base URL.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let parsed = Url::parse(&config.url).map_err(|e| ApiError::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ApiError::InvalidUrl {
                url: config.url.clone(),
                reason: "URL has no host".to_string(),
            })?
            .to_string();

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(config.timeout)
            .build()
            .map_err(ApiError::Client)?;

        Ok(Self {
            base: config.url.trim_end_matches('/').to_string(),
            host,
            username: config.username,
            password: config.password,
            http,
        })
    }

    /// Host name of the appliance, as used for iSCSI discovery.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Vec<u8>> {
        let url = self.url(path);
        debug!(method = %method, url = %url, "Appliance request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let transport = |source| ApiError::Transport {
            method: method.to_string(),
            url: url.clone(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;

        if !status.is_success() {
            return Err(ApiError::Status {
                method: method.to_string(),
                url,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(bytes.to_vec())
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let bytes = self.send(method, path, body).await?;
        serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
            url: self.url(path),
            source,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send(Method::DELETE, path, None).await.map(|_| ())
    }

    /// List storage pools with their currently available space.
    #[instrument(skip(self))]
    pub async fn list_pools(&self) -> Result<Vec<StoragePool>> {
        let raw: Vec<RawVolume> = self.request_json(Method::GET, VOLUME_URI, None).await?;
        Ok(raw.into_iter().map(StoragePool::from).collect())
    }

    /// Create a zvol of `size_gib` GiB named `name` in `pool`.
    #[instrument(skip(self))]
    pub async fn create_zvol(&self, pool: &str, name: &str, size_gib: u64) -> Result<()> {
        let path = format!("{}{}/zvols/", VOLUME_URI, pool);
        let body = json!({ "name": name, "volsize": format!("{}G", size_gib) });
        self.send(Method::POST, &path, Some(body)).await.map(|_| ())
    }

    #[instrument(skip(self))]
    pub async fn delete_zvol(&self, pool: &str, name: &str) -> Result<()> {
        self.delete(&format!("{}{}/zvols/{}/", VOLUME_URI, pool, name))
            .await
    }

    #[instrument(skip(self))]
    pub async fn service_state(&self, service: &str) -> Result<ServiceState> {
        let path = format!("{}{}/", SERVICES_URI, service);
        let raw: RawService = self.request_json(Method::GET, &path, None).await?;
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    pub async fn set_service_enabled(&self, service: &str, enabled: bool) -> Result<ServiceState> {
        let path = format!("{}{}/", SERVICES_URI, service);
        let body = json!({ "srv_enable": enabled });
        let raw: RawService = self.request_json(Method::PUT, &path, Some(body)).await?;
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    pub async fn create_target(&self, name: &str) -> Result<ObjectId> {
        let body = json!({ "iscsi_target_name": name });
        let created: RawCreated = self
            .request_json(Method::POST, TARGET_URI, Some(body))
            .await?;
        Ok(created.id)
    }

    #[instrument(skip(self))]
    pub async fn delete_target(&self, id: ObjectId) -> Result<()> {
        self.delete(&format!("{}{}/", TARGET_URI, id)).await
    }

    #[instrument(skip(self))]
    pub async fn list_portals(&self) -> Result<Vec<Portal>> {
        let raw: Vec<RawPortal> = self.request_json(Method::GET, PORTAL_URI, None).await?;
        Ok(raw.into_iter().map(Portal::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn create_portal(&self, listen: &[String]) -> Result<Portal> {
        let body = json!({ "iscsi_target_portal_ips": listen });
        let raw: RawPortal = self
            .request_json(Method::POST, PORTAL_URI, Some(body))
            .await?;
        Ok(raw.into())
    }

    /// Create a disk extent backed by the zvol `pool/zvol`.
    #[instrument(skip(self))]
    pub async fn create_extent(&self, name: &str, pool: &str, zvol: &str) -> Result<ObjectId> {
        let body = json!({
            "iscsi_target_extent_type": "Disk",
            "iscsi_target_extent_name": name,
            "iscsi_target_extent_disk": format!("zvol/{}/{}", pool, zvol),
        });
        let created: RawCreated = self
            .request_json(Method::POST, EXTENT_URI, Some(body))
            .await?;
        Ok(created.id)
    }

    #[instrument(skip(self))]
    pub async fn delete_extent(&self, id: ObjectId) -> Result<()> {
        self.delete(&format!("{}{}/", EXTENT_URI, id)).await
    }

    /// Bind a target to a portal, without authentication.
    #[instrument(skip(self))]
    pub async fn create_target_group(
        &self,
        target_id: ObjectId,
        portal_id: ObjectId,
    ) -> Result<ObjectId> {
        let body = json!({
            "iscsi_target": target_id,
            "iscsi_target_authgroup": null,
            "iscsi_target_portalgroup": portal_id,
            "iscsi_target_initiatorgroup": null,
            "iscsi_target_authtype": "None",
            "iscsi_target_initialdigest": "Auto",
        });
        let created: RawCreated = self
            .request_json(Method::POST, TARGET_GROUP_URI, Some(body))
            .await?;
        Ok(created.id)
    }

    #[instrument(skip(self))]
    pub async fn delete_target_group(&self, id: ObjectId) -> Result<()> {
        self.delete(&format!("{}{}/", TARGET_GROUP_URI, id)).await
    }

    #[instrument(skip(self))]
    pub async fn link_target_extent(
        &self,
        target_id: ObjectId,
        extent_id: ObjectId,
    ) -> Result<ObjectId> {
        let body = json!({ "iscsi_target": target_id, "iscsi_extent": extent_id });
        let created: RawCreated = self
            .request_json(Method::POST, TARGET_TO_EXTENT_URI, Some(body))
            .await?;
        Ok(created.id)
    }

    #[instrument(skip(self))]
    pub async fn unlink_target_extent(&self, id: ObjectId) -> Result<()> {
        self.delete(&format!("{}{}/", TARGET_TO_EXTENT_URI, id))
            .await
    }
}
