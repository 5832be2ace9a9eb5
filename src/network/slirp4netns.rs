//! Network driver backed by an external slirp4netns process.
//!
//! The helper opens the tap device inside the child's network namespace and
//! runs the userspace TCP/IP stack in the parent's. The address plan is
//! derived from the configured subnet: child = network + 100,
//! gateway = network + 2, DNS = network + 3.

use super::{iputils, look_path, Cleanup, ChildDriverInfo, NetworkOpts};
use crate::{api::NetworkDriverInfo, errors::NetworkError, message::NetworkConfig};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    collections::HashMap,
    env, fs,
    io::Read,
    net::Ipv4Addr,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

pub const DRIVER_NAME: &str = "slirp4netns";

const DEFAULT_CIDR: &str = "10.0.2.0/24";
const DEFAULT_MTU: u32 = 65520;
const DEFAULT_IFNAME: &str = "tap0";

const CHILD_IP_OFFSET: u32 = 100;
const GATEWAY_OFFSET: u32 = 2;
const DNS_OFFSET: u32 = 3;

/// Which optional flags this slirp4netns build understands, probed from its
/// help text the way the external helper documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub cidr: bool,
    pub disable_host_loopback: bool,
    pub ipv6: bool,
    pub api_socket: bool,
    pub netns_path: bool,
}

fn detect_features(binary: &Path) -> Result<Features, NetworkError> {
    let output = Command::new(binary)
        .arg("--help")
        .output()
        .map_err(|_| NetworkError::MissingTool(binary.to_string_lossy().into_owned()))?;
    if !output.status.success() {
        return Err(NetworkError::Driver {
            driver: DRIVER_NAME,
            message: format!(
                "{:?} --help failed, make sure slirp4netns v0.4.0+ is installed",
                binary
            ),
        });
    }
    let help = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(Features {
        cidr: help.contains("--cidr"),
        disable_host_loopback: help.contains("--disable-host-loopback"),
        ipv6: help.contains("--enable-ipv6"),
        api_socket: help.contains("--api-socket"),
        netns_path: help.contains("--netns-type"),
    })
}

/// The helper's API socket lives in the driver's private corner of the
/// state dir; the slirp4netns port driver dials it from the parent.
pub fn api_socket_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DRIVER_NAME).join("api.sock")
}

pub struct ParentDriver {
    binary: PathBuf,
    features: Features,
    mtu: u32,
    network: Ipv4Addr,
    prefix_len: u8,
    disable_host_loopback: bool,
    ipv6: bool,
    ifname: String,
    enable_api_socket: bool,
}

impl ParentDriver {
    pub fn new(opts: &NetworkOpts) -> Result<ParentDriver, NetworkError> {
        let binary = opts
            .slirp4netns_binary
            .clone()
            .or_else(|| env::var("SLIRP4NETNS").ok())
            .unwrap_or_else(|| "slirp4netns".to_string());
        let binary = look_path(&binary)?;
        let features = detect_features(&binary)?;
        let unsupported = |flag: &str| NetworkError::Driver {
            driver: DRIVER_NAME,
            message: format!("this slirp4netns does not support {}", flag),
        };
        if opts.cidr.is_some() && !features.cidr {
            return Err(unsupported("--cidr"));
        }
        if opts.disable_host_loopback && !features.disable_host_loopback {
            return Err(unsupported("--disable-host-loopback"));
        }
        if opts.ipv6 && !features.ipv6 {
            return Err(unsupported("--enable-ipv6"));
        }
        if opts.enable_api_socket && !features.api_socket {
            return Err(unsupported("--api-socket"));
        }
        let (network, prefix_len) =
            iputils::parse_cidr(opts.cidr.as_deref().unwrap_or(DEFAULT_CIDR))?;
        Ok(ParentDriver {
            binary,
            features,
            mtu: if opts.mtu == 0 { DEFAULT_MTU } else { opts.mtu },
            network,
            prefix_len,
            disable_host_loopback: opts.disable_host_loopback,
            ipv6: opts.ipv6,
            ifname: opts
                .ifname
                .clone()
                .unwrap_or_else(|| DEFAULT_IFNAME.to_string()),
            enable_api_socket: opts.enable_api_socket,
        })
    }

    fn child_ip(&self) -> Result<Ipv4Addr, NetworkError> {
        iputils::add_ip_int(self.network, CHILD_IP_OFFSET)
    }
}

impl super::ParentDriver for ParentDriver {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn info(&self) -> NetworkDriverInfo {
        NetworkDriverInfo {
            driver: DRIVER_NAME.to_string(),
            dns: iputils::add_ip_int(self.network, DNS_OFFSET)
                .map(|ip| vec![ip.to_string()])
                .unwrap_or_default(),
            child_ip: self.child_ip().ok().map(|ip| ip.to_string()),
            dynamic_child_ip: false,
        }
    }

    fn configure_network(
        &self,
        child_pid: i32,
        state_dir: &Path,
        detached_netns: Option<&Path>,
    ) -> Result<(NetworkConfig, Cleanup), NetworkError> {
        fs::create_dir_all(state_dir.join(DRIVER_NAME))?;
        let (ready_read, ready_write) = nix::unistd::pipe().map_err(|errno| {
            NetworkError::Driver {
                driver: DRIVER_NAME,
                message: format!("pipe: {}", errno),
            }
        })?;

        let mut command = Command::new(&self.binary);
        command.arg(format!("--mtu={}", self.mtu));
        if self.features.cidr {
            command.arg(format!("--cidr={}/{}", self.network, self.prefix_len));
        }
        if self.disable_host_loopback {
            command.arg("--disable-host-loopback");
        }
        if self.ipv6 {
            command.arg("--enable-ipv6");
        }
        if self.enable_api_socket {
            command.arg(format!(
                "--api-socket={}",
                api_socket_path(state_dir).display()
            ));
        }
        command.arg(format!("--ready-fd={}", ready_write.as_raw_fd()));
        match detached_netns {
            Some(path) => {
                if !self.features.netns_path {
                    return Err(NetworkError::Driver {
                        driver: DRIVER_NAME,
                        message: "this slirp4netns does not support --netns-type=path"
                            .to_string(),
                    });
                }
                command.arg(format!("--userns-path=/proc/{}/ns/user", child_pid));
                command.arg("--netns-type=path");
                command.arg(path);
            }
            None => {
                command.arg(child_pid.to_string());
            }
        }
        command.arg(&self.ifname);
        command.stdin(Stdio::null()).stdout(Stdio::null());
        log::debug!("executing {:?}", command);
        let mut helper = command.spawn().map_err(|err| NetworkError::Driver {
            driver: DRIVER_NAME,
            message: format!("failed to spawn {:?}: {}", self.binary, err),
        })?;
        // The helper inherited the write end; ours must close so its exit
        // turns into EOF below.
        drop(ready_write);

        let mut ready = [0u8; 1];
        let mut ready_read = std::fs::File::from(ready_read);
        if ready_read.read_exact(&mut ready).is_err() || ready != *b"1" {
            let status = helper
                .wait()
                .map(|s| s.to_string())
                .unwrap_or_else(|e| e.to_string());
            return Err(NetworkError::Driver {
                driver: DRIVER_NAME,
                message: format!("slirp4netns did not become ready ({})", status),
            });
        }
        log::debug!("slirp4netns is ready");

        let config = NetworkConfig {
            dev: self.ifname.clone(),
            ip: self.child_ip()?.to_string(),
            netmask: self.prefix_len,
            gateway: iputils::add_ip_int(self.network, GATEWAY_OFFSET)?.to_string(),
            dns: vec![iputils::add_ip_int(self.network, DNS_OFFSET)?.to_string()],
            mtu: self.mtu,
            opaque: HashMap::new(),
        };
        let cleanup: Cleanup = Box::new(move || {
            log::debug!("terminating slirp4netns (pid {})", helper.id());
            let _ = signal::kill(Pid::from_raw(helper.id() as i32), Signal::SIGTERM);
            match helper.wait() {
                Ok(_) => Ok(()),
                Err(err) => {
                    let _ = helper.kill();
                    Err(NetworkError::Io(err))
                }
            }
        });
        Ok((config, cleanup))
    }
}

/// The tap device is created by the helper; the generic child code assigns
/// the address and routes.
pub struct ChildDriver {}

impl super::ChildDriver for ChildDriver {
    fn child_driver_info(&self) -> ChildDriverInfo {
        ChildDriverInfo {
            configures_interface: false,
        }
    }

    fn configure_network_child(
        &self,
        config: &NetworkConfig,
        _detached_netns: Option<&Path>,
    ) -> Result<String, NetworkError> {
        Ok(config.dev.clone())
    }
}
