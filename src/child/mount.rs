//! Mount operations performed inside the child's namespaces.

use crate::{
    errors::{LifecycleError, NetworkError},
    message::NetworkConfig,
    network::run_command,
    statedir::STATE_FILE_NETNS,
};
use nix::mount::{mount, MsFlags};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Mount propagation flavor applied to `/` in the child's mount namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Rprivate,
    Rslave,
    Rshared,
    Private,
    Slave,
    Shared,
}

impl Propagation {
    pub fn as_str(self) -> &'static str {
        match self {
            Propagation::Rprivate => "rprivate",
            Propagation::Rslave => "rslave",
            Propagation::Rshared => "rshared",
            Propagation::Private => "private",
            Propagation::Slave => "slave",
            Propagation::Shared => "shared",
        }
    }

    fn flags(self) -> MsFlags {
        match self {
            Propagation::Rprivate => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            Propagation::Rslave => MsFlags::MS_SLAVE | MsFlags::MS_REC,
            Propagation::Rshared => MsFlags::MS_SHARED | MsFlags::MS_REC,
            Propagation::Private => MsFlags::MS_PRIVATE,
            Propagation::Slave => MsFlags::MS_SLAVE,
            Propagation::Shared => MsFlags::MS_SHARED,
        }
    }
}

impl FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Propagation, String> {
        match s {
            "rprivate" => Ok(Propagation::Rprivate),
            "rslave" => Ok(Propagation::Rslave),
            "rshared" => Ok(Propagation::Rshared),
            "private" => Ok(Propagation::Private),
            "slave" => Ok(Propagation::Slave),
            "shared" => Ok(Propagation::Shared),
            other => Err(format!("unknown propagation {:?}", other)),
        }
    }
}

impl Default for Propagation {
    fn default() -> Propagation {
        Propagation::Rprivate
    }
}

fn mount_err(target: &str, fstype: &'static str, errno: nix::errno::Errno) -> LifecycleError {
    LifecycleError::Mount {
        target: PathBuf::from(target),
        fstype,
        errno,
    }
}

pub fn set_propagation(propagation: Propagation) -> Result<(), LifecycleError> {
    mount(None::<&str>, "/", None::<&str>, propagation.flags(), None::<&str>)
        .map_err(|errno| mount_err("/", "propagation", errno))
}

/// Fresh procfs for a fresh pid namespace.
pub fn mount_proc() -> Result<(), LifecycleError> {
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|errno| mount_err("/proc", "proc", errno))
}

/// Fresh sysfs so the child sees its own network namespace under
/// `/sys/class/net`. Falls back to a read-only bind of the host's when the
/// kernel refuses (e.g. the netns is owned elsewhere).
pub fn mount_sysfs() -> Result<(), LifecycleError> {
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    match mount(Some("none"), "/sys", Some("sysfs"), flags, None::<&str>) {
        Ok(()) => Ok(()),
        Err(errno) => {
            log::warn!(
                "failed to mount a fresh sysfs, falling back to a read-only bind: {}",
                errno
            );
            mount(
                Some("/sys"),
                "/sys",
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|errno| mount_err("/sys", "bind", errno))?;
            mount(
                None::<&str>,
                "/sys",
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | flags,
                None::<&str>,
            )
            .map_err(|errno| mount_err("/sys", "remount", errno))
        }
    }
}

/// Fresh cgroup2 over the evacuated hierarchy.
pub fn mount_cgroup2() -> Result<(), LifecycleError> {
    mount(
        Some("none"),
        "/sys/fs/cgroup",
        Some("cgroup2"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|errno| mount_err("/sys/fs/cgroup", "cgroup2", errno))
}

/// Create a network namespace without entering it from the main thread:
/// a scratch thread unshares, pins its netns at `<state>/netns` with a bind
/// mount, and exits. The bind mount keeps the namespace alive.
pub fn pin_detached_netns(state_dir: &Path) -> Result<PathBuf, LifecycleError> {
    let pin_path = state_dir.join(STATE_FILE_NETNS);
    fs::File::create(&pin_path)?;
    let pin_for_thread = pin_path.clone();
    let worker = std::thread::spawn(move || -> Result<(), LifecycleError> {
        nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNET)
            .map_err(|errno| LifecycleError::sys("unshare(CLONE_NEWNET)", errno))?;
        let tid = nix::unistd::gettid();
        let ns_path = format!("/proc/self/task/{}/ns/net", tid);
        mount(
            Some(ns_path.as_str()),
            &pin_for_thread,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|errno| mount_err(&pin_for_thread.to_string_lossy(), "bind", errno))
    });
    worker
        .join()
        .map_err(|_| LifecycleError::ChildStart("netns pin thread panicked".to_string()))??;
    log::debug!("pinned the detached netns at {}", pin_path.display());
    Ok(pin_path)
}

/// Generic interface bring-up via `ip`, for drivers that do not configure
/// the interface themselves.
pub fn configure_interface(
    dev: &str,
    config: &NetworkConfig,
    detached_netns: Option<&Path>,
) -> Result<(), NetworkError> {
    let address = format!("{}/{}", config.ip, config.netmask);
    let commands: [&[&str]; 3] = [
        &["ip", "link", "set", dev, "up"],
        &["ip", "address", "add", address.as_str(), "dev", dev],
        &["ip", "route", "add", "default", "via", config.gateway.as_str()],
    ];
    for command in commands {
        let mut argv: Vec<String> = Vec::new();
        if let Some(path) = detached_netns {
            argv.push("nsenter".to_string());
            argv.push(format!("--net={}", path.display()));
        }
        argv.extend(command.iter().map(|s| s.to_string()));
        run_command(&argv)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagation_names() {
        for name in ["rprivate", "rslave", "rshared", "private", "slave", "shared"] {
            assert_eq!(Propagation::from_str(name).unwrap().as_str(), name);
        }
        assert!(Propagation::from_str("recursive").is_err());
    }

    #[test]
    fn recursive_variants_carry_ms_rec() {
        assert!(Propagation::Rslave.flags().contains(MsFlags::MS_REC));
        assert!(!Propagation::Slave.flags().contains(MsFlags::MS_REC));
    }
}
