//! Port driver contract.
//!
//! A port driver publishes host ports and routes their connections into the
//! child. The parent half owns real listening sockets in the host network
//! namespace and implements the `AddPort`/`ListPorts`/`RemovePort` manager
//! surface the REST API calls into; the child half runs inside the child's
//! namespaces and performs whatever the driver needs there.

pub mod builtin;
pub mod portutil;
pub mod slirp4netns;

use crate::{api::PortDriverInfo, errors::PortError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    path::PathBuf,
    str::FromStr,
};
use tokio::sync::{oneshot, watch};

/// Protocol tag of one published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Proto {
    /// Dual-stack TCP when the environment permits.
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tcp4")]
    Tcp4,
    #[serde(rename = "tcp6")]
    Tcp6,
    /// Dual-stack UDP when the environment permits.
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "udp4")]
    Udp4,
    #[serde(rename = "udp6")]
    Udp6,
}

/// Transport discipline, with the family suffix stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoBase {
    Tcp,
    Udp,
}

/// Address families a spec can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Dual,
}

impl Family {
    pub fn intersects(self, other: Family) -> bool {
        match (self, other) {
            (Family::Dual, _) | (_, Family::Dual) => true,
            (a, b) => a == b,
        }
    }

    pub fn wants_v4(self) -> bool {
        matches!(self, Family::V4 | Family::Dual)
    }

    pub fn wants_v6(self) -> bool {
        matches!(self, Family::V6 | Family::Dual)
    }
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Tcp4 => "tcp4",
            Proto::Tcp6 => "tcp6",
            Proto::Udp => "udp",
            Proto::Udp4 => "udp4",
            Proto::Udp6 => "udp6",
        }
    }

    pub fn base(self) -> ProtoBase {
        match self {
            Proto::Tcp | Proto::Tcp4 | Proto::Tcp6 => ProtoBase::Tcp,
            Proto::Udp | Proto::Udp4 | Proto::Udp6 => ProtoBase::Udp,
        }
    }

    /// The family the unqualified tag denotes; a suffix binds exactly one.
    pub fn family(self) -> Family {
        match self {
            Proto::Tcp | Proto::Udp => Family::Dual,
            Proto::Tcp4 | Proto::Udp4 => Family::V4,
            Proto::Tcp6 | Proto::Udp6 => Family::V6,
        }
    }
}

impl FromStr for Proto {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Proto, PortError> {
        match s {
            "tcp" => Ok(Proto::Tcp),
            "tcp4" => Ok(Proto::Tcp4),
            "tcp6" => Ok(Proto::Tcp6),
            "udp" => Ok(Proto::Udp),
            "udp4" => Ok(Proto::Udp4),
            "udp6" => Ok(Proto::Udp6),
            other => Err(PortError::InvalidProto(other.to_string())),
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable description of one published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub proto: Proto,
    /// Empty means every interface of the proto's family.
    #[serde(rename = "parentIP", default, skip_serializing_if = "String::is_empty")]
    pub parent_ip: String,
    #[serde(rename = "parentPort")]
    pub parent_port: u16,
    /// Empty means the driver default.
    #[serde(rename = "childIP", default, skip_serializing_if = "String::is_empty")]
    pub child_ip: String,
    #[serde(rename = "childPort")]
    pub child_port: u16,
}

impl PortSpec {
    pub fn parent_ip_addr(&self) -> Result<Option<IpAddr>, PortError> {
        parse_optional_ip(&self.parent_ip)
    }

    pub fn child_ip_addr(&self) -> Result<Option<IpAddr>, PortError> {
        parse_optional_ip(&self.child_ip)
    }

    /// The family this spec actually binds: a concrete parent address
    /// narrows an unqualified proto down to that address's family.
    pub fn effective_family(&self) -> Result<Family, PortError> {
        match self.parent_ip_addr()? {
            Some(IpAddr::V4(_)) => Ok(Family::V4),
            Some(IpAddr::V6(_)) => Ok(Family::V6),
            None => Ok(self.proto.family()),
        }
    }
}

fn parse_optional_ip(s: &str) -> Result<Option<IpAddr>, PortError> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| PortError::InvalidIp(s.to_string()))
}

fn write_bracketed(f: &mut fmt::Formatter, ip: &str) -> fmt::Result {
    if ip.contains(':') {
        write!(f, "[{}]", ip)
    } else {
        f.write_str(ip)
    }
}

/// The textual form `[PARENT_IP:]PARENT_PORT:[CHILD_IP:]CHILD_PORT/PROTO`,
/// with IPv6 addresses wrapped in brackets.
impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.parent_ip.is_empty() {
            write_bracketed(f, &self.parent_ip)?;
            f.write_str(":")?;
        }
        write!(f, "{}:", self.parent_port)?;
        if !self.child_ip.is_empty() {
            write_bracketed(f, &self.child_ip)?;
            f.write_str(":")?;
        }
        write!(f, "{}/{}", self.child_port, self.proto)
    }
}

/// A successfully published port: the spec plus its id, unique within the
/// lifetime of one parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub id: i32,
    pub spec: PortSpec,
}

/// Context the parent hands to `run_parent_driver`, derived from the
/// network driver's negotiation.
#[derive(Debug, Clone, Default)]
pub struct ChildContext {
    /// IP of the in-child interface, when the network driver knows one.
    pub child_ip: Option<IpAddr>,
}

/// Parent half of a port driver.
///
/// `add_port`/`list_ports`/`remove_port` are safe to call from multiple
/// tasks. `run_parent_driver` is called exactly once; it signals
/// `init_complete` when the manager surface is ready and blocks until
/// `quit` fires.
#[async_trait]
pub trait ParentDriver: Send + Sync {
    fn info(&self) -> PortDriverInfo;

    /// Driver-private context for the child half, conveyed through the
    /// handshake. Typically a control socket path.
    fn opaque_for_child(&self) -> HashMap<String, String>;

    async fn run_parent_driver(
        &self,
        init_complete: oneshot::Sender<()>,
        quit: watch::Receiver<bool>,
        child_ctx: ChildContext,
    ) -> Result<(), PortError>;

    async fn add_port(&self, spec: PortSpec) -> Result<PortStatus, PortError>;

    async fn list_ports(&self) -> Vec<PortStatus>;

    async fn remove_port(&self, id: i32) -> Result<(), PortError>;
}

/// Child half of a port driver. Runs on its own thread inside the child's
/// namespaces (entering the detached netns itself when one is given) and
/// blocks until `quit` fires.
pub trait ChildDriver: Send + Sync {
    fn run_child_driver(
        &self,
        opaque: HashMap<String, String>,
        quit: watch::Receiver<bool>,
        detached_netns: Option<PathBuf>,
    ) -> Result<(), PortError>;
}
