//! Network driver contract.
//!
//! A network driver has two halves: the parent side sets up whatever stack
//! backs the child's connectivity (possibly spawning helper processes) and
//! reports the negotiated interface parameters; the child side configures
//! the in-namespace interface. Both halves are black boxes to the core,
//! which only carries the handshake payload between them and runs the
//! parent's cleanup on shutdown.

pub mod iputils;
pub mod slirp4netns;

use crate::{api::NetworkDriverInfo, errors::NetworkError, message::NetworkConfig};
use std::{
    path::{Path, PathBuf},
    process::Command,
};

/// Deterministically undoes whatever `configure_network` spawned.
pub type Cleanup = Box<dyn FnOnce() -> Result<(), NetworkError> + Send>;

/// Parent-side half of a network driver.
pub trait ParentDriver: Send + Sync {
    /// Negotiated MTU; 0 when the driver has no opinion.
    fn mtu(&self) -> u32;

    fn info(&self) -> NetworkDriverInfo;

    /// Set up the network for a child. `detached_netns` is only set in
    /// detach-netns mode and is a path resolvable from the parent.
    fn configure_network(
        &self,
        child_pid: i32,
        state_dir: &Path,
        detached_netns: Option<&Path>,
    ) -> Result<(NetworkConfig, Cleanup), NetworkError>;
}

/// What the generic child code needs to know about a child driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildDriverInfo {
    /// The driver fully configures the interface itself; skip the generic
    /// address/route assignment.
    pub configures_interface: bool,
}

/// Child-side half, executed in the child's namespaces (except a detached
/// netns, which it enters through the pinned path when needed).
pub trait ChildDriver: Send + Sync {
    fn child_driver_info(&self) -> ChildDriverInfo {
        ChildDriverInfo::default()
    }

    /// Returns the in-child device name.
    fn configure_network_child(
        &self,
        config: &NetworkConfig,
        detached_netns: Option<&Path>,
    ) -> Result<String, NetworkError>;
}

/// Host networking is an explicit variant, not a null driver.
pub enum ParentNetwork {
    Host,
    Driver(Box<dyn ParentDriver>),
}

impl std::fmt::Debug for ParentNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParentNetwork::Host => f.write_str("ParentNetwork::Host"),
            ParentNetwork::Driver(_) => f.write_str("ParentNetwork::Driver(..)"),
        }
    }
}

impl ParentNetwork {
    pub fn is_host(&self) -> bool {
        matches!(self, ParentNetwork::Host)
    }

    pub fn driver(&self) -> Option<&dyn ParentDriver> {
        match self {
            ParentNetwork::Host => None,
            ParentNetwork::Driver(driver) => Some(driver.as_ref()),
        }
    }
}

pub enum ChildNetwork {
    Host,
    Driver(Box<dyn ChildDriver>),
}

impl std::fmt::Debug for ChildNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildNetwork::Host => f.write_str("ChildNetwork::Host"),
            ChildNetwork::Driver(_) => f.write_str("ChildNetwork::Driver(..)"),
        }
    }
}

impl ChildNetwork {
    pub fn driver(&self) -> Option<&dyn ChildDriver> {
        match self {
            ChildNetwork::Host => None,
            ChildNetwork::Driver(driver) => Some(driver.as_ref()),
        }
    }
}

/// Options shared by the non-host drivers, resolved by the CLI.
#[derive(Debug, Clone, Default)]
pub struct NetworkOpts {
    /// 0 means driver default.
    pub mtu: u32,
    pub cidr: Option<String>,
    pub disable_host_loopback: bool,
    pub ipv6: bool,
    /// In-child interface name override.
    pub ifname: Option<String>,
    /// Helper binary override for slirp-style drivers.
    pub slirp4netns_binary: Option<String>,
    /// Ask the helper for an API socket (the slirp4netns port driver needs it).
    pub enable_api_socket: bool,
}

/// Driver names the CLI accepts. Some are recognized but not compiled in;
/// selecting those is a precondition error naming the driver.
pub const PARENT_DRIVER_NAMES: &[&str] = &[
    "host",
    "none",
    "slirp-like",
    "slirp4netns",
    "bridge",
    "vpnkit",
    "tap-vsock",
    "gvisor-tap-vsock",
    "lxc-user-nic",
    "pasta",
];

/// The documented generic names and the concrete helper names are both
/// accepted; lookups go through the concrete one.
pub fn canonical_driver_name(name: &str) -> &str {
    match name {
        "slirp-like" => "slirp4netns",
        "tap-vsock" => "gvisor-tap-vsock",
        other => other,
    }
}

pub fn parent_driver_by_name(
    name: &str,
    opts: &NetworkOpts,
) -> Result<ParentNetwork, NetworkError> {
    match canonical_driver_name(name) {
        "host" => Ok(ParentNetwork::Host),
        "none" => Ok(ParentNetwork::Driver(Box::new(NoneParentDriver {}))),
        "slirp4netns" => Ok(ParentNetwork::Driver(Box::new(
            slirp4netns::ParentDriver::new(opts)?,
        ))),
        other if PARENT_DRIVER_NAMES.contains(&other) => {
            Err(NetworkError::NotCompiledIn(other.to_string()))
        }
        other => Err(NetworkError::Driver {
            driver: "?",
            message: format!("unknown network driver {:?}", other),
        }),
    }
}

pub fn child_driver_by_name(name: &str) -> Result<ChildNetwork, NetworkError> {
    match canonical_driver_name(name) {
        "host" => Ok(ChildNetwork::Host),
        "none" => Ok(ChildNetwork::Driver(Box::new(NoneChildDriver {}))),
        "slirp4netns" => Ok(ChildNetwork::Driver(Box::new(
            slirp4netns::ChildDriver {},
        ))),
        other if PARENT_DRIVER_NAMES.contains(&other) => {
            Err(NetworkError::NotCompiledIn(other.to_string()))
        }
        other => Err(NetworkError::Driver {
            driver: "?",
            message: format!("unknown network driver {:?}", other),
        }),
    }
}

/// Loopback-only networking.
pub struct NoneParentDriver {}

pub const NONE_DRIVER_NAME: &str = "none";

impl ParentDriver for NoneParentDriver {
    fn mtu(&self) -> u32 {
        0
    }

    fn info(&self) -> NetworkDriverInfo {
        NetworkDriverInfo {
            driver: NONE_DRIVER_NAME.to_string(),
            ..Default::default()
        }
    }

    fn configure_network(
        &self,
        child_pid: i32,
        _state_dir: &Path,
        detached_netns: Option<&Path>,
    ) -> Result<(NetworkConfig, Cleanup), NetworkError> {
        let commands = [
            vec!["ip", "address", "add", "127.0.0.1/8", "dev", "lo"],
            vec!["ip", "link", "set", "lo", "up"],
        ];
        for command in &commands {
            nsenter(child_pid, detached_netns, command)?;
        }
        Ok((NetworkConfig::default(), Box::new(|| Ok(()))))
    }
}

pub struct NoneChildDriver {}

impl ChildDriver for NoneChildDriver {
    fn configure_network_child(
        &self,
        _config: &NetworkConfig,
        _detached_netns: Option<&Path>,
    ) -> Result<String, NetworkError> {
        // lo is brought up from the parent side.
        Ok(String::new())
    }
}

/// Run a command inside the child's namespaces from the parent.
pub(crate) fn nsenter(
    child_pid: i32,
    detached_netns: Option<&Path>,
    command: &[&str],
) -> Result<(), NetworkError> {
    let pid = child_pid.to_string();
    let mut argv: Vec<String> = vec![
        "nsenter".to_string(),
        "-t".to_string(),
        pid,
        "-m".to_string(),
        "-U".to_string(),
        "--no-fork".to_string(),
        "--preserve-credentials".to_string(),
    ];
    match detached_netns {
        Some(path) => argv.push(format!("--net={}", path.display())),
        None => argv.push("-n".to_string()),
    }
    argv.extend(command.iter().map(|s| s.to_string()));
    run_command(&argv)
}

/// Run one external command, mapping a missing binary to the precondition
/// error kind and a failure to a captured-stderr error.
pub(crate) fn run_command(argv: &[String]) -> Result<(), NetworkError> {
    log::debug!("executing {:?}", argv);
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                NetworkError::MissingTool(argv[0].clone())
            } else {
                NetworkError::Io(err)
            }
        })?;
    if !output.status.success() {
        return Err(NetworkError::CommandFailed {
            argv: argv.to_vec(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Look up a binary in PATH, for early precondition errors.
pub(crate) fn look_path(name: &str) -> Result<PathBuf, NetworkError> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(NetworkError::MissingTool(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_driver_name() {
        let err = parent_driver_by_name("warp-drive", &NetworkOpts::default()).unwrap_err();
        assert!(matches!(err, NetworkError::Driver { .. }));
    }

    #[test]
    fn recognized_but_not_compiled_in() {
        let err = parent_driver_by_name("vpnkit", &NetworkOpts::default()).unwrap_err();
        assert!(matches!(err, NetworkError::NotCompiledIn(_)));
        let err = child_driver_by_name("pasta").unwrap_err();
        assert!(matches!(err, NetworkError::NotCompiledIn(_)));
    }

    #[test]
    fn generic_names_reach_the_concrete_drivers() {
        assert_eq!(canonical_driver_name("slirp-like"), "slirp4netns");
        assert_eq!(canonical_driver_name("tap-vsock"), "gvisor-tap-vsock");
        assert_eq!(canonical_driver_name("host"), "host");
        // Both spellings resolve, whether or not the driver is compiled in.
        let err = parent_driver_by_name("tap-vsock", &NetworkOpts::default()).unwrap_err();
        assert!(matches!(err, NetworkError::NotCompiledIn(_)));
        let err = child_driver_by_name("tap-vsock").unwrap_err();
        assert!(matches!(err, NetworkError::NotCompiledIn(_)));
        assert!(child_driver_by_name("slirp-like").is_ok());
    }

    #[test]
    fn host_is_an_explicit_variant() {
        let network = parent_driver_by_name("host", &NetworkOpts::default()).unwrap();
        assert!(network.is_host());
        assert!(network.driver().is_none());
    }
}
