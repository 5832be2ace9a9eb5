//! REST API wire types.
//!
//! Served over `<state>/api.sock`; see [server] for the routes.

pub mod server;

use serde::{Deserialize, Serialize};

/// Version of the REST API surface, independent of the crate version.
pub const API_VERSION: &str = "1.1.1";

/// `GET /v1/info` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub version: String,
    #[serde(rename = "stateDir")]
    pub state_dir: String,
    #[serde(rename = "childPID")]
    pub child_pid: i32,
    #[serde(rename = "networkDriver", skip_serializing_if = "Option::is_none")]
    pub network_driver: Option<NetworkDriverInfo>,
    #[serde(rename = "portDriver", skip_serializing_if = "Option::is_none")]
    pub port_driver: Option<PortDriverInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDriverInfo {
    pub driver: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(rename = "childIP", default, skip_serializing_if = "Option::is_none")]
    pub child_ip: Option<String>,
    /// True when the child address is learned at runtime (e.g. DHCP).
    #[serde(rename = "dynamicChildIP", default, skip_serializing_if = "std::ops::Not::not")]
    pub dynamic_child_ip: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortDriverInfo {
    pub driver: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protos: Vec<String>,
    /// When set, the API layer rewrites loopback child IPs to the network
    /// driver's child address before the spec reaches the driver.
    #[serde(
        rename = "disallowLoopbackChildIP",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub disallow_loopback_child_ip: bool,
}

/// JSON body attached to every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_wire_format() {
        let info = Info {
            api_version: API_VERSION.to_string(),
            version: "0.5.0".to_string(),
            state_dir: "/run/user/1000/rootlesskit".to_string(),
            child_pid: 42,
            network_driver: Some(NetworkDriverInfo {
                driver: "slirp4netns".to_string(),
                dns: vec!["10.0.2.3".to_string()],
                child_ip: Some("10.0.2.100".to_string()),
                dynamic_child_ip: false,
            }),
            port_driver: Some(PortDriverInfo {
                driver: "builtin".to_string(),
                protos: vec!["tcp".to_string(), "udp".to_string()],
                disallow_loopback_child_ip: false,
            }),
        };
        let value: serde_json::Value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["apiVersion"], API_VERSION);
        assert_eq!(value["childPID"], 42);
        assert_eq!(value["networkDriver"]["childIP"], "10.0.2.100");
        assert_eq!(value["portDriver"]["protos"][0], "tcp");
        // flags at their defaults stay off the wire
        assert!(value["networkDriver"].get("dynamicChildIP").is_none());
        assert!(value["portDriver"].get("disallowLoopbackChildIP").is_none());
    }

    #[test]
    fn info_without_drivers() {
        let info = Info {
            api_version: API_VERSION.to_string(),
            version: "0.5.0".to_string(),
            state_dir: "/tmp/rootlesskit-test".to_string(),
            child_pid: 1,
            network_driver: None,
            port_driver: None,
        };
        let value: serde_json::Value = serde_json::to_value(&info).unwrap();
        assert!(value.get("networkDriver").is_none());
        assert!(value.get("portDriver").is_none());
    }
}
