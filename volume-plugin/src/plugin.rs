//! Docker volume plugin protocol endpoint.
//!
//! Serves the v1 plugin API as HTTP/1.1 with JSON bodies over a Unix
//! socket. Each request path names one [`VolumeDriver`] operation; the
//! request body is decoded, the operation is invoked and its result is
//! encoded in the protocol's success or `{"Err": ...}` shape.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::accept;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tracing::{debug, info, warn};

use crate::driver::VolumeDriver;
use crate::error::DriverError;
use crate::types::VolumeSummary;

/// Default socket Docker scans for the `freenas` driver
pub const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/freenas.sock";

/// Response media type of the plugin API
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NameRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    opts: Option<HashMap<String, String>>,
}

fn volume_json(summary: &VolumeSummary) -> Value {
    json!({
        "Name": summary.name,
        "Mountpoint": summary.mountpoint.to_string_lossy(),
    })
}

fn decode<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, DriverError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| DriverError::InvalidArgument(format!("malformed request body: {}", e)))
}

/// Route one plugin API call to the driver.
///
/// Returns the HTTP status and JSON body to send back.
pub async fn dispatch(driver: &dyn VolumeDriver, path: &str, body: &[u8]) -> (StatusCode, Value) {
    let result = match path {
        "/Plugin.Activate" => Ok(json!({ "Implements": ["VolumeDriver"] })),
        "/VolumeDriver.Create" => match decode::<CreateRequest>(body) {
            Ok(req) => driver
                .create(&req.name, &req.opts.unwrap_or_default())
                .await
                .map(|_| json!({})),
            Err(e) => Err(e),
        },
        "/VolumeDriver.Remove" => match decode::<NameRequest>(body) {
            Ok(req) => driver.remove(&req.name).await.map(|_| json!({})),
            Err(e) => Err(e),
        },
        "/VolumeDriver.Mount" => match decode::<NameRequest>(body) {
            Ok(req) => driver
                .mount(&req.name)
                .await
                .map(|mp| json!({ "Mountpoint": mp.to_string_lossy() })),
            Err(e) => Err(e),
        },
        "/VolumeDriver.Unmount" => match decode::<NameRequest>(body) {
            Ok(req) => driver.unmount(&req.name).await.map(|_| json!({})),
            Err(e) => Err(e),
        },
        "/VolumeDriver.Path" => match decode::<NameRequest>(body) {
            Ok(req) => driver
                .path(&req.name)
                .await
                .map(|v| json!({ "Mountpoint": v.mountpoint.to_string_lossy() })),
            Err(e) => Err(e),
        },
        "/VolumeDriver.Get" => match decode::<NameRequest>(body) {
            Ok(req) => driver
                .get(&req.name)
                .await
                .map(|v| json!({ "Volume": volume_json(&v) })),
            Err(e) => Err(e),
        },
        "/VolumeDriver.List" => driver.list().await.map(|volumes| {
            json!({ "Volumes": volumes.iter().map(volume_json).collect::<Vec<_>>() })
        }),
        "/VolumeDriver.Capabilities" => {
            let caps = driver.capabilities();
            Ok(json!({ "Capabilities": { "Scope": caps.scope } }))
        }
        _ => {
            debug!(path = %path, "Unknown plugin endpoint");
            return (
                StatusCode::NOT_FOUND,
                json!({ "Err": format!("unknown endpoint {}", path) }),
            );
        }
    };

    match result {
        Ok(payload) => (StatusCode::OK, payload),
        Err(e) => {
            warn!(endpoint = %path, code = e.code(), error = %e, "Plugin request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "Err": e.to_string() }),
            )
        }
    }
}

fn respond(status: StatusCode, payload: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(payload.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PLUGIN_CONTENT_TYPE));
    response
}

async fn handle(
    driver: Arc<dyn VolumeDriver>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            warn!(endpoint = %path, error = %e, "Failed to read request body");
            return Ok(respond(
                StatusCode::BAD_REQUEST,
                json!({ "Err": format!("failed to read request body: {}", e) }),
            ));
        }
    };

    debug!(endpoint = %path, bytes = body.len(), "Plugin request");
    let (status, payload) = dispatch(driver.as_ref(), &path, &body).await;
    Ok(respond(status, payload))
}

/// Bind the plugin socket, replacing a stale socket file left by a previous run.
pub async fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        warn!(path = %path.display(), "Removing stale plugin socket");
        tokio::fs::remove_file(path).await?;
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "Plugin socket listening");
    Ok(listener)
}

/// Serve plugin requests on `listener` until the listener fails.
///
/// Requests are handled concurrently; the driver enforces its own locking.
pub async fn serve(listener: UnixListener, driver: Arc<dyn VolumeDriver>) -> hyper::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let driver = driver.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(driver.clone(), req))) }
    });

    Server::builder(accept::from_stream(UnixListenerStream::new(listener)))
        .serve(make_svc)
        .await
}
