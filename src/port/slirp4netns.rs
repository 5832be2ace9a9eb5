//! Port driver that drives a slirp4netns helper's JSON API.
//!
//! No descriptors cross namespaces here: the helper already owns both sides,
//! so `add_hostfwd`/`remove_hostfwd` calls over its API socket are all that
//! is needed. IPv6 hostfwd is not supported by the helper, and a loopback
//! child IP cannot work from its position, which the API layer compensates
//! for via `disallow_loopback_child_ip`.

use crate::{
    api::PortDriverInfo,
    errors::PortError,
    port::{portutil, ChildContext, ParentDriver as ParentDriverTrait, PortSpec, PortStatus, Proto},
    quit,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{Read, Write},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Mutex as StdMutex,
};
use tokio::sync::{oneshot, watch, Mutex};

pub const DRIVER_NAME: &str = "slirp4netns";

pub struct Driver {
    api_socket_path: PathBuf,
    child_ip: StdMutex<Option<IpAddr>>,
    ports: Mutex<HashMap<i32, PortStatus>>,
}

impl Driver {
    pub fn new(api_socket_path: &Path) -> Result<Driver, PortError> {
        if api_socket_path.as_os_str().is_empty() {
            return Err(PortError::Helper("api socket path is not set".to_string()));
        }
        Ok(Driver {
            api_socket_path: api_socket_path.to_path_buf(),
            child_ip: StdMutex::new(None),
            ports: Mutex::new(HashMap::new()),
        })
    }
}

#[derive(Serialize)]
struct ApiRequest<T: Serialize> {
    execute: &'static str,
    arguments: T,
}

#[derive(Serialize)]
struct AddHostFwd {
    proto: String,
    host_addr: String,
    host_port: u16,
    guest_addr: String,
    guest_port: u16,
}

#[derive(Serialize)]
struct RemoveHostFwd {
    id: i32,
}

#[derive(Deserialize, Default)]
struct ApiReply {
    #[serde(rename = "return", default)]
    ret: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// One request/one reply over a fresh connection, the way the helper's API
/// works. Blocking, so callers hop onto the blocking pool.
fn call_api<T: Serialize>(
    socket_path: &Path,
    request: &ApiRequest<T>,
) -> Result<ApiReply, PortError> {
    let mut stream = std::os::unix::net::UnixStream::connect(socket_path)?;
    let body = serde_json::to_vec(request)?;
    stream.write_all(&body)?;
    stream.shutdown(std::net::Shutdown::Write)?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    let reply: ApiReply = serde_json::from_str(&reply)?;
    if let Some(error) = reply.error {
        return Err(PortError::Helper(error.to_string()));
    }
    Ok(reply)
}

#[async_trait]
impl ParentDriverTrait for Driver {
    fn info(&self) -> PortDriverInfo {
        PortDriverInfo {
            driver: DRIVER_NAME.to_string(),
            // No IPv6 hostfwd support in the helper.
            protos: ["tcp", "tcp4", "udp", "udp4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            disallow_loopback_child_ip: true,
        }
    }

    fn opaque_for_child(&self) -> HashMap<String, String> {
        // This driver has no child-side logic.
        HashMap::new()
    }

    async fn run_parent_driver(
        &self,
        init_complete: oneshot::Sender<()>,
        quit_rx: watch::Receiver<bool>,
        child_ctx: ChildContext,
    ) -> Result<(), PortError> {
        *self.child_ip.lock().unwrap() = child_ctx.child_ip;
        let _ = init_complete.send(());
        quit::fired(quit_rx).await;
        Ok(())
    }

    async fn add_port(&self, spec: PortSpec) -> Result<PortStatus, PortError> {
        let mut ports = self.ports.lock().await;
        let existing: Vec<PortStatus> = ports.values().cloned().collect();
        portutil::validate_port_spec(&spec, &existing)?;
        let proto = match spec.proto {
            Proto::Tcp | Proto::Tcp4 => "tcp",
            Proto::Udp | Proto::Udp4 => "udp",
            other => {
                return Err(PortError::UnsupportedProto {
                    driver: DRIVER_NAME,
                    proto: other.as_str().to_string(),
                })
            }
        };
        let guest_addr = match spec.child_ip_addr()? {
            Some(ip @ IpAddr::V4(_)) => ip.to_string(),
            Some(ip) => return Err(PortError::InvalidIp(ip.to_string())),
            None => self
                .child_ip
                .lock()
                .unwrap()
                .ok_or_else(|| {
                    PortError::Helper("the child IP is not known yet".to_string())
                })?
                .to_string(),
        };
        let request = ApiRequest {
            execute: "add_hostfwd",
            arguments: AddHostFwd {
                proto: proto.to_string(),
                host_addr: spec.parent_ip.clone(),
                host_port: spec.parent_port,
                guest_addr,
                guest_port: spec.child_port,
            },
        };
        let socket_path = self.api_socket_path.clone();
        let reply =
            tokio::task::spawn_blocking(move || call_api(&socket_path, &request))
                .await
                .map_err(|err| PortError::Helper(err.to_string()))??;
        let id = reply
            .ret
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| PortError::Helper("reply carries no id".to_string()))?
            as i32;
        let status = PortStatus { id, spec };
        ports.insert(id, status.clone());
        log::debug!("slirp4netns: published {:?}", status);
        Ok(status)
    }

    async fn list_ports(&self) -> Vec<PortStatus> {
        let ports = self.ports.lock().await;
        let mut out: Vec<PortStatus> = ports.values().cloned().collect();
        out.sort_by_key(|status| status.id);
        out
    }

    async fn remove_port(&self, id: i32) -> Result<(), PortError> {
        let mut ports = self.ports.lock().await;
        if !ports.contains_key(&id) {
            return Err(PortError::NotFound(id));
        }
        let request = ApiRequest {
            execute: "remove_hostfwd",
            arguments: RemoveHostFwd { id },
        };
        let socket_path = self.api_socket_path.clone();
        tokio::task::spawn_blocking(move || call_api(&socket_path, &request))
            .await
            .map_err(|err| PortError::Helper(err.to_string()))??;
        ports.remove(&id);
        log::debug!("slirp4netns: removed port {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostfwd_request_shape() {
        let request = ApiRequest {
            execute: "add_hostfwd",
            arguments: AddHostFwd {
                proto: "tcp".to_string(),
                host_addr: "127.0.0.1".to_string(),
                host_port: 8080,
                guest_addr: "10.0.2.100".to_string(),
                guest_port: 80,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["execute"], "add_hostfwd");
        assert_eq!(value["arguments"]["host_port"], 8080);
        assert_eq!(value["arguments"]["guest_addr"], "10.0.2.100");
    }

    #[test]
    fn reply_parsing() {
        let reply: ApiReply = serde_json::from_str(r#"{"return":{"id":3}}"#).unwrap();
        assert_eq!(reply.ret.get("id").unwrap().as_i64(), Some(3));
        assert!(reply.error.is_none());

        let reply: ApiReply =
            serde_json::from_str(r#"{"error":{"desc":"bad request"}}"#).unwrap();
        assert!(reply.error.is_some());
    }
}
