//! Child lifecycle.
//!
//! The child is this same executable, re-executed by the parent into fresh
//! namespaces. It walks the handshake from the other side, re-executes once
//! more to let capabilities take effect, prepares mounts and networking,
//! then runs the target command, acting as reaper when it is PID 1.

pub mod copyup;
pub mod etcfiles;
pub mod mount;

use crate::{
    capgate,
    errors::{LifecycleError, ProtocolError},
    message::{self, ChildHello, ChildInitUserNSCompleted, NetworkConfig, Payload},
    network, port, quit, sigproxy, PIPE_FD_ENV_KEY, STATE_DIR_ENV_KEY,
};
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitStatus},
    unistd::Pid,
};
use std::{
    collections::HashMap,
    env,
    fs::File,
    os::unix::{io::FromRawFd, process::CommandExt},
    path::{Path, PathBuf},
    process::Command,
};

pub struct ChildOpt {
    pub target_cmd: Vec<String>,
    pub network_driver_name: String,
    pub port_driver_name: String,
    pub copy_up_dirs: Vec<PathBuf>,
    pub create_pidns: bool,
    pub detach_netns: bool,
    pub propagation: mount::Propagation,
    /// Mount a fresh cgroup2 (the parent evacuated the old one).
    pub mount_cgroup2: bool,
    pub reaper: bool,
}

struct Pipes {
    /// Parent-to-child messages arrive here.
    read: File,
    /// Child-to-parent replies leave here.
    write: File,
}

/// Whether this process is the re-executed child, decided by env inspection.
pub fn in_child_mode() -> bool {
    env::var_os(PIPE_FD_ENV_KEY).is_some()
}

fn open_pipes() -> Result<Pipes, LifecycleError> {
    let value = env::var(PIPE_FD_ENV_KEY)
        .map_err(|_| LifecycleError::ChildStart(format!("{} is not set", PIPE_FD_ENV_KEY)))?;
    let bad = || {
        LifecycleError::ChildStart(format!(
            "unexpected value {:?} in {}",
            value, PIPE_FD_ENV_KEY
        ))
    };
    let (read_fd, write_fd) = value.split_once(',').ok_or_else(bad)?;
    let read_fd: i32 = read_fd.parse().map_err(|_| bad())?;
    let write_fd: i32 = write_fd.parse().map_err(|_| bad())?;
    Ok(Pipes {
        read: unsafe { File::from_raw_fd(read_fd) },
        write: unsafe { File::from_raw_fd(write_fd) },
    })
}

/// Run the child side to completion; the result is the exit code the
/// parent will mirror.
pub fn run(opt: ChildOpt) -> Result<i32, LifecycleError> {
    if opt.target_cmd.is_empty() {
        return Err(LifecycleError::Usage("no command specified".to_string()));
    }
    let mut pipes = open_pipes()?;
    let state_dir = PathBuf::from(env::var(STATE_DIR_ENV_KEY).map_err(|_| {
        LifecycleError::ChildStart(format!("{} is not set", STATE_DIR_ENV_KEY))
    })?);

    // A re-executed child already consumed the early handshake.
    if !capgate::already_reexeced() {
        message::wait_for(&mut pipes.read, "ParentHello")?;
        message::send(
            &mut pipes.write,
            &Payload::ChildHello(ChildHello {}).into(),
        )?;
        message::wait_for(&mut pipes.read, "ParentInitIdmapCompleted")?;
    }
    if capgate::effective_caps()? == 0 {
        capgate::reexec_to_gain_caps()?;
        unreachable!("reexec_to_gain_caps only returns on failure");
    }
    capgate::clear_reexec_env();
    env::remove_var(PIPE_FD_ENV_KEY);

    // The parent's network driver may need the pinned netns, so pin before
    // announcing the user namespace is ready.
    let detached_netns = if opt.detach_netns {
        Some(mount::pin_detached_netns(&state_dir)?)
    } else {
        None
    };
    message::send(
        &mut pipes.write,
        &Payload::ChildInitUserNSCompleted(ChildInitUserNSCompleted {}).into(),
    )?;

    let netcfg_msg = message::wait_for(&mut pipes.read, "ParentInitNetworkDriverCompleted")?;
    let netcfg = match netcfg_msg.payload {
        Payload::ParentInitNetworkDriverCompleted(config) => config,
        other => {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "ParentInitNetworkDriverCompleted".to_string(),
                got: other.name().to_string(),
            }
            .into())
        }
    };
    let port_msg = message::wait_for(&mut pipes.read, "ParentInitPortDriverCompleted")?;
    let port_opaque = match port_msg.payload {
        Payload::ParentInitPortDriverCompleted(opaque) => opaque.opaque,
        other => {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "ParentInitPortDriverCompleted".to_string(),
                got: other.name().to_string(),
            }
            .into())
        }
    };

    setup_namespaces(&opt)?;
    let copied = copyup::copy_up(&opt.copy_up_dirs)?;
    configure_network(&opt, &netcfg, detached_netns.as_deref())?;
    write_etc_files(&opt, &netcfg, &copied, &state_dir)?;

    run_target(&opt, port_opaque, detached_netns)
}

fn setup_namespaces(opt: &ChildOpt) -> Result<(), LifecycleError> {
    if opt.create_pidns {
        mount::mount_proc()?;
    }
    mount::mount_sysfs()?;
    if opt.mount_cgroup2 {
        mount::mount_cgroup2()?;
    }
    mount::set_propagation(opt.propagation)?;
    Ok(())
}

fn configure_network(
    opt: &ChildOpt,
    netcfg: &NetworkConfig,
    detached_netns: Option<&Path>,
) -> Result<(), LifecycleError> {
    let network = network::child_driver_by_name(&opt.network_driver_name)?;
    let driver = match network.driver() {
        None => return Ok(()),
        Some(driver) => driver,
    };
    let dev = driver.configure_network_child(netcfg, detached_netns)?;
    if !dev.is_empty() && !driver.child_driver_info().configures_interface {
        mount::configure_interface(&dev, netcfg, detached_netns)?;
    }
    Ok(())
}

fn write_etc_files(
    opt: &ChildOpt,
    netcfg: &NetworkConfig,
    copied: &[PathBuf],
    state_dir: &Path,
) -> Result<(), LifecycleError> {
    if opt.network_driver_name == "host" || netcfg.dev.is_empty() {
        return Ok(());
    }
    let etc_was_copied = copied.iter().any(|dir| dir == Path::new("/etc"));
    if !netcfg.dns.is_empty() {
        etcfiles::write_resolv_conf(state_dir, &netcfg.dns, etc_was_copied)?;
    }
    etcfiles::write_etc_hosts(state_dir, &netcfg.ip, etc_was_copied)?;
    Ok(())
}

fn port_child_driver(name: &str) -> Option<Box<dyn port::ChildDriver>> {
    match name {
        "builtin" => Some(Box::new(port::builtin::child::Driver::new())),
        // "none" has no driver; "slirp4netns" has no child-side logic.
        _ => None,
    }
}

fn run_target(
    opt: &ChildOpt,
    port_opaque: HashMap<String, String>,
    detached_netns: Option<PathBuf>,
) -> Result<i32, LifecycleError> {
    let mut command = Command::new(&opt.target_cmd[0]);
    command.args(&opt.target_cmd[1..]);
    unsafe {
        command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
        });
    }
    let target = command.spawn().map_err(|err| {
        LifecycleError::ChildStart(format!("failed to exec {:?}: {}", opt.target_cmd[0], err))
    })?;
    let target_pid = Pid::from_raw(target.id() as i32);
    log::debug!("started the target command as pid {}", target_pid);

    let (quit_tx, quit_rx) = quit::channel();
    let port_thread = port_child_driver(&opt.port_driver_name).map(|driver| {
        let quit_rx = quit_rx.clone();
        std::thread::Builder::new()
            .name("port-child".to_string())
            .spawn(move || {
                if let Err(err) = driver.run_child_driver(port_opaque, quit_rx, detached_netns) {
                    log::warn!("port child driver failed: {}", err);
                }
            })
            .expect("spawning the port driver thread")
    });

    let runtime = tokio::runtime::Runtime::new()?;
    let reaper = opt.reaper;
    let code = runtime.block_on(async move {
        let _signal_tasks = sigproxy::forward_signals(target_pid, quit_rx.clone());
        tokio::task::spawn_blocking(move || wait_target(target_pid, reaper))
            .await
            .map_err(|err| LifecycleError::ChildStart(err.to_string()))?
    })?;

    let _ = quit_tx.send(true);
    if let Some(thread) = port_thread {
        let _ = thread.join();
    }
    Ok(code)
}

/// Wait for the target. With the reaper enabled (the child is PID 1 of a
/// new pid namespace) every orphan reparented to us is collected too, but
/// the reported status is always the target's own.
fn wait_target(target: Pid, reaper: bool) -> Result<i32, LifecycleError> {
    let wait_any = Pid::from_raw(-1);
    loop {
        let waited = if reaper {
            waitpid(wait_any, None)
        } else {
            waitpid(target, None)
        };
        match waited {
            Ok(WaitStatus::Exited(pid, code)) if pid == target => return Ok(code),
            Ok(WaitStatus::Signaled(pid, sig, _)) if pid == target => {
                return Ok(128 + sig as i32)
            }
            Ok(other) => {
                log::debug!("reaped {:?}", other);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                return Err(LifecycleError::ChildStart(
                    "lost track of the target command".to_string(),
                ))
            }
            Err(errno) => return Err(LifecycleError::sys("waitpid", errno)),
        }
    }
}
