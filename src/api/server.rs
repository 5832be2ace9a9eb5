//! REST API server on the state-dir Unix socket.
//!
//! Routes:
//! - `GET /v1/info`
//! - `GET /v1/ports`
//! - `POST /v1/ports`
//! - `DELETE /v1/ports/{id}`
//!
//! Mutations are serialized by the port driver's own lock; this layer only
//! translates between HTTP and the driver contract.

use super::{ErrorMessage, Info, NetworkDriverInfo, API_VERSION};
use crate::{errors::PortError, port, quit};
use hyper::{body::Body, server::conn::Http, service::service_fn, Request, Response, StatusCode};
use std::{net::IpAddr, path::PathBuf, sync::Arc};
use tokio::{net::UnixListener, sync::watch};

pub struct Backend {
    pub state_dir: PathBuf,
    pub child_pid: i32,
    pub network_driver_info: Option<NetworkDriverInfo>,
    pub port_driver: Option<Arc<dyn port::ParentDriver>>,
}

impl Backend {
    fn info(&self) -> Info {
        Info {
            api_version: API_VERSION.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            state_dir: self.state_dir.to_string_lossy().into_owned(),
            child_pid: self.child_pid,
            network_driver: self.network_driver_info.clone(),
            port_driver: self.port_driver.as_ref().map(|driver| driver.info()),
        }
    }
}

/// Accept loop; each connection is served by its own task. Ends when the
/// quit latch fires, dropping the listener so later clients are refused.
pub async fn serve(listener: UnixListener, backend: Arc<Backend>, quit_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = quit::fired(quit_rx.clone()) => break,
            res = listener.accept() => {
                let stream = match res {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        log::warn!("api: accept failed: {}", err);
                        continue;
                    }
                };
                let backend = backend.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(backend.clone(), req));
                    if let Err(err) = Http::new().serve_connection(stream, service).await {
                        log::debug!("api: connection error: {}", err);
                    }
                });
            }
        }
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    json_response(status, &ErrorMessage { message })
}

fn port_error_status(err: &PortError) -> StatusCode {
    match err {
        PortError::Conflict { .. } => StatusCode::CONFLICT,
        PortError::NotFound(_) => StatusCode::NOT_FOUND,
        PortError::InvalidPort(_)
        | PortError::InvalidProto(_)
        | PortError::InvalidSpecString(_)
        | PortError::InvalidIp(_)
        | PortError::FamilyMismatch { .. }
        | PortError::UnsupportedProto { .. } => StatusCode::BAD_REQUEST,
        PortError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle(
    backend: Arc<Backend>,
    req: Request<Body>,
) -> Result<Response<Body>, std::convert::Infallible> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    log::debug!("api: {} {}", method, path);
    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/v1/info") => json_response(StatusCode::OK, &backend.info()),
        ("GET", "/v1/ports") => list_ports(&backend).await,
        ("POST", "/v1/ports") => add_port(&backend, req).await,
        ("DELETE", path) if path.starts_with("/v1/ports/") => {
            remove_port(&backend, &path["/v1/ports/".len()..]).await
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found".to_string()),
    };
    Ok(response)
}

fn require_port_driver(backend: &Backend) -> Result<&Arc<dyn port::ParentDriver>, Response<Body>> {
    backend.port_driver.as_ref().ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "no port driver is configured".to_string(),
        )
    })
}

async fn list_ports(backend: &Backend) -> Response<Body> {
    match require_port_driver(backend) {
        Err(response) => response,
        Ok(driver) => json_response(StatusCode::OK, &driver.list_ports().await),
    }
}

async fn add_port(backend: &Arc<Backend>, req: Request<Body>) -> Response<Body> {
    let driver = match require_port_driver(backend) {
        Err(response) => return response,
        Ok(driver) => driver.clone(),
    };
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, format!("cannot read body: {}", err))
        }
    };
    let spec: port::PortSpec = match serde_json::from_slice(&body) {
        Ok(spec) => spec,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, format!("cannot parse spec: {}", err))
        }
    };
    let spec = match rewrite_loopback_child_ip(backend, &driver, spec) {
        Ok(spec) => spec,
        Err(response) => return response,
    };
    match driver.add_port(spec).await {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(err) => error_response(port_error_status(&err), err.to_string()),
    }
}

/// Drivers that cannot reach the child's loopback get the network driver's
/// child address substituted for `127.0.0.1`/`::1`.
fn rewrite_loopback_child_ip(
    backend: &Backend,
    driver: &Arc<dyn port::ParentDriver>,
    mut spec: port::PortSpec,
) -> Result<port::PortSpec, Response<Body>> {
    if !driver.info().disallow_loopback_child_ip {
        return Ok(spec);
    }
    let is_loopback = spec
        .child_ip
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false);
    if !is_loopback {
        return Ok(spec);
    }
    let child_ip = backend
        .network_driver_info
        .as_ref()
        .and_then(|info| info.child_ip.clone());
    match child_ip {
        Some(child_ip) => {
            log::debug!(
                "api: rewriting loopback child IP {} to {}",
                spec.child_ip,
                child_ip
            );
            spec.child_ip = child_ip;
            Ok(spec)
        }
        None => Err(error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "the {} port driver does not support loopback child IPs, and no child IP is known",
                driver.info().driver
            ),
        )),
    }
}

async fn remove_port(backend: &Arc<Backend>, id: &str) -> Response<Body> {
    let driver = match require_port_driver(backend) {
        Err(response) => return response,
        Ok(driver) => driver.clone(),
    };
    let id: i32 = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, format!("bad port id {:?}", id))
        }
    };
    match driver.remove_port(id).await {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap(),
        Err(err) => error_response(port_error_status(&err), err.to_string()),
    }
}
