//! Parent lifecycle.
//!
//! The parent re-executes this binary as a child in fresh namespaces,
//! drives the handshake that maps ids and brings up drivers, then serves
//! the REST API and mirrors the child's exit. The handshake itself is
//! synchronous over two pipes; everything after it runs on the tokio
//! runtime.

pub mod cgroup;
pub mod preflight;

use crate::{
    api::{self, server::Backend},
    errors::LifecycleError,
    idmap::{self, SubidSource},
    message::{self, NetworkConfig, ParentHello, ParentInitIdmapCompleted, Payload, PortDriverOpaque},
    network::{Cleanup, ParentNetwork},
    port::{self, PortSpec},
    quit, sigproxy,
    statedir::{self, STATE_FILE_API_SOCK, STATE_FILE_CHILD_PID, STATE_FILE_NETNS},
    PARENT_EGID_ENV_KEY, PARENT_EUID_ENV_KEY, PIPE_FD_ENV_KEY, STATE_DIR_ENV_KEY,
};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sched::CloneFlags,
    sys::wait::{waitpid, WaitStatus},
    unistd::{self, Pid},
};
use std::{
    env,
    ffi::CString,
    fs,
    os::unix::{
        fs::PermissionsExt,
        io::{AsRawFd, OwnedFd, RawFd},
    },
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};
use tokio::sync::oneshot;

use crate::child::mount::Propagation;

pub struct ParentOpt {
    pub state_dir: PathBuf,
    pub network: ParentNetwork,
    pub port_driver: Option<Arc<dyn port::ParentDriver>>,
    pub publish_ports: Vec<PortSpec>,
    pub create_pidns: bool,
    pub create_cgroupns: bool,
    pub create_utsns: bool,
    pub create_ipcns: bool,
    pub detach_netns: bool,
    pub propagation: Propagation,
    pub evacuate_cgroup2: Option<String>,
    pub subid_source: SubidSource,
}

/// Runs whatever the network driver spawned back down, even on error paths.
struct NetworkCleanupGuard(Option<Cleanup>);

impl Drop for NetworkCleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            if let Err(err) = cleanup() {
                log::warn!("network driver cleanup failed: {}", err);
            }
        }
    }
}

/// Run the parent to completion. The result is the exit code to propagate:
/// the child's own, or 128+signum when the child died to a signal.
pub fn run(opt: ParentOpt) -> Result<i32, LifecycleError> {
    statedir::check_state_dir(&opt.state_dir)?;
    preflight::warn_if_root();
    preflight::warn_sysctl();
    preflight::warn_propagation(opt.propagation);

    let _tmpfiles_guard = statedir::inhibit_tmpfiles_cleanup(&opt.state_dir);
    let _lock = statedir::lock_state_dir(&opt.state_dir)?;
    let result = run_locked(&opt);
    if let Err(err) = fs::remove_dir_all(&opt.state_dir) {
        log::warn!(
            "failed to remove the state dir {}: {}",
            opt.state_dir.display(),
            err
        );
    }
    result
}

struct Pipes {
    /// Parent-to-child channel; the read end goes to the child.
    p1_read: OwnedFd,
    p1_write: OwnedFd,
    /// Child-to-parent channel; the write end goes to the child.
    p2_read: OwnedFd,
    p2_write: OwnedFd,
}

fn make_pipes() -> Result<Pipes, LifecycleError> {
    let (p1_read, p1_write) =
        unistd::pipe2(OFlag::O_CLOEXEC).map_err(|errno| LifecycleError::sys("pipe2", errno))?;
    let (p2_read, p2_write) =
        unistd::pipe2(OFlag::O_CLOEXEC).map_err(|errno| LifecycleError::sys("pipe2", errno))?;
    Ok(Pipes {
        p1_read,
        p1_write,
        p2_read,
        p2_write,
    })
}

fn run_locked(opt: &ParentOpt) -> Result<i32, LifecycleError> {
    let pipes = make_pipes()?;
    let child_pid = start_child(opt, &pipes)?;
    log::debug!("started the child as pid {}", child_pid);
    // The child's copies are alive in the child now; ours must go so EOF
    // semantics work.
    let Pipes {
        p1_read,
        p1_write,
        p2_read,
        p2_write,
    } = pipes;
    drop(p1_read);
    drop(p2_write);
    let mut to_child = fs::File::from(p1_write);
    let mut from_child = fs::File::from(p2_read);

    // Handshake steps 1-5: hello, id map, userns completion.
    message::send(&mut to_child, &Payload::ParentHello(ParentHello {}).into())?;
    message::wait_for(&mut from_child, "ChildHello")?;
    let maps = idmap::resolve(opt.subid_source)?;
    apply_id_maps(child_pid, &maps)?;
    message::send(
        &mut to_child,
        &Payload::ParentInitIdmapCompleted(ParentInitIdmapCompleted {}).into(),
    )?;
    message::wait_for(&mut from_child, "ChildInitUserNSCompleted")?;

    if let Some(name) = &opt.evacuate_cgroup2 {
        cgroup::evacuate_cgroup2(name)?;
    }

    // Step 6: the network driver negotiates and the result crosses the pipe.
    let mut net_config = NetworkConfig::default();
    let mut net_cleanup = NetworkCleanupGuard(None);
    if let Some(driver) = opt.network.driver() {
        let detached = if opt.detach_netns {
            Some(detached_netns_path_via_child(&opt.state_dir, child_pid))
        } else {
            None
        };
        let (config, cleanup) = driver
            .configure_network(child_pid.as_raw(), &opt.state_dir, detached.as_deref())
            .map_err(LifecycleError::Network)?;
        net_config = config;
        net_cleanup.0 = Some(cleanup);
    }
    message::send(
        &mut to_child,
        &Payload::ParentInitNetworkDriverCompleted(net_config.clone()).into(),
    )?;

    // Step 7: the port driver's opaque context.
    let opaque = opt
        .port_driver
        .as_ref()
        .map(|driver| driver.opaque_for_child())
        .unwrap_or_default();
    message::send(
        &mut to_child,
        &Payload::ParentInitPortDriverCompleted(PortDriverOpaque { opaque }).into(),
    )?;

    // Step 8: close our write end; the child sees EOF after the last message.
    drop(to_child);

    serve(opt, child_pid, &net_config)
}

/// The netns the child pinned, resolved through the child's root so the
/// path works even when the parent's own mount table differs.
fn detached_netns_path_via_child(state_dir: &Path, child_pid: Pid) -> PathBuf {
    let mut path = PathBuf::from(format!("/proc/{}/root", child_pid));
    path.push(
        state_dir
            .strip_prefix("/")
            .unwrap_or(state_dir),
    );
    path.push(STATE_FILE_NETNS);
    path
}

fn clear_cloexec(fd: RawFd) -> isize {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return -1;
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    result as isize
}

/// Re-execute this binary as the child with the right clone flags.
///
/// `CLONE_NEWUSER` (and `CLONE_NEWPID`, which cannot be unshared after the
/// fact) apply at clone time; the remaining namespaces are unshared inside
/// the child callback before exec, mirroring how the child will own them.
fn start_child(opt: &ParentOpt, pipes: &Pipes) -> Result<Pid, LifecycleError> {
    let mut clone_flags = CloneFlags::CLONE_NEWUSER;
    if opt.create_pidns {
        clone_flags |= CloneFlags::CLONE_NEWPID;
    }
    let mut unshare_flags = CloneFlags::CLONE_NEWNS;
    if !opt.network.is_host() && !opt.detach_netns {
        unshare_flags |= CloneFlags::CLONE_NEWNET;
    }
    if opt.create_cgroupns {
        unshare_flags |= CloneFlags::CLONE_NEWCGROUP;
    }
    if opt.create_utsns {
        unshare_flags |= CloneFlags::CLONE_NEWUTS;
    }
    if opt.create_ipcns {
        unshare_flags |= CloneFlags::CLONE_NEWIPC;
    }

    let cstring = |s: &str| {
        CString::new(s).map_err(|_| {
            LifecycleError::ChildStart(format!("argument {:?} contains a nul byte", s))
        })
    };
    let exe = cstring("/proc/self/exe")?;
    let mut argv = Vec::new();
    for arg in env::args() {
        argv.push(cstring(&arg)?);
    }
    let child_read = pipes.p1_read.as_raw_fd();
    let child_write = pipes.p2_write.as_raw_fd();
    let mut envp = Vec::new();
    for (key, value) in env::vars() {
        if key == PIPE_FD_ENV_KEY {
            continue;
        }
        envp.push(cstring(&format!("{}={}", key, value))?);
    }
    envp.push(cstring(&format!(
        "{}={},{}",
        PIPE_FD_ENV_KEY, child_read, child_write
    ))?);
    envp.push(cstring(&format!(
        "{}={}",
        STATE_DIR_ENV_KEY,
        opt.state_dir.display()
    ))?);
    envp.push(cstring(&format!(
        "{}={}",
        PARENT_EUID_ENV_KEY,
        unistd::geteuid()
    ))?);
    envp.push(cstring(&format!(
        "{}={}",
        PARENT_EGID_ENV_KEY,
        unistd::getegid()
    ))?);

    let mut stack = vec![0u8; 1024 * 1024];
    // Runs in the cloned child before exec: only async-signal-safe calls.
    let callback = Box::new(move || -> isize {
        if nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL).is_err() {
            return 125;
        }
        if nix::sched::unshare(unshare_flags).is_err() {
            return 125;
        }
        if clear_cloexec(child_read) < 0 || clear_cloexec(child_write) < 0 {
            return 125;
        }
        let _ = unistd::execve(&exe, &argv, &envp);
        126
    });
    let pid = unsafe { nix::sched::clone(callback, &mut stack, clone_flags, Some(libc::SIGCHLD)) }
        .map_err(|errno| {
            preflight::warn_on_child_start_failure(errno);
            LifecycleError::ChildStart(errno.to_string())
        })?;
    Ok(pid)
}

/// Execute `newuidmap`/`newgidmap` against the child's pid, propagating
/// their stderr verbatim on failure.
fn apply_id_maps(child_pid: Pid, maps: &idmap::IdMaps) -> Result<(), LifecycleError> {
    for (tool, args) in [
        ("newuidmap", &maps.uid_args),
        ("newgidmap", &maps.gid_args),
    ] {
        let mut argv = vec![child_pid.to_string()];
        argv.extend(args.iter().cloned());
        log::debug!("executing {} {:?}", tool, argv);
        let output = Command::new(tool).args(&argv).output().map_err(|err| {
            LifecycleError::MappingToolFailed {
                tool,
                argv: argv.clone(),
                output: err.to_string(),
            }
        })?;
        if !output.status.success() {
            return Err(LifecycleError::MappingToolFailed {
                tool,
                argv,
                output: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
    }
    Ok(())
}

fn write_child_pid(state_dir: &Path, child_pid: Pid) -> Result<(), LifecycleError> {
    let path = state_dir.join(STATE_FILE_CHILD_PID);
    fs::write(&path, child_pid.to_string())?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o444))?;
    Ok(())
}

/// Steps 8-9 and shutdown: run the port driver, publish ports, expose the
/// API, proxy signals, wait for the child, and unwind in order.
fn serve(opt: &ParentOpt, child_pid: Pid, net_config: &NetworkConfig) -> Result<i32, LifecycleError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (driver_quit_tx, driver_quit_rx) = quit::channel();
        let (api_quit_tx, api_quit_rx) = quit::channel();

        let mut driver_task = None;
        if let Some(driver) = &opt.port_driver {
            let (init_tx, init_rx) = oneshot::channel();
            let child_ctx = port::ChildContext {
                child_ip: net_config.ip.parse().ok(),
            };
            let driver = driver.clone();
            let quit_rx = driver_quit_rx.clone();
            let mut task = tokio::spawn(async move {
                driver.run_parent_driver(init_tx, quit_rx, child_ctx).await
            });
            // The driver only signals readiness once the child half has
            // connected; a driver error before that aborts the launch.
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(())) => Err(LifecycleError::Port(
                            crate::errors::PortError::ShuttingDown,
                        )),
                        Ok(Err(err)) => Err(LifecycleError::Port(err)),
                        Err(err) => Err(LifecycleError::ChildStart(err.to_string())),
                    };
                }
                _ = init_rx => {}
            }
            driver_task = Some(task);

            let driver = opt.port_driver.as_ref().unwrap();
            for spec in &opt.publish_ports {
                let status = driver
                    .add_port(spec.clone())
                    .await
                    .map_err(LifecycleError::Port)?;
                log::debug!("published port {:?}", status);
            }
        } else if !opt.publish_ports.is_empty() {
            return Err(LifecycleError::Usage(
                "-p/--publish requires a port driver".to_string(),
            ));
        }

        // External consumers poll for child_pid; it appears only after all
        // drivers are up.
        write_child_pid(&opt.state_dir, child_pid)?;

        let sock_path = opt.state_dir.join(STATE_FILE_API_SOCK);
        let _ = fs::remove_file(&sock_path);
        let listener = tokio::net::UnixListener::bind(&sock_path)?;
        let backend = Arc::new(Backend {
            state_dir: opt.state_dir.clone(),
            child_pid: child_pid.as_raw(),
            network_driver_info: opt.network.driver().map(|driver| driver.info()),
            port_driver: opt.port_driver.clone(),
        });
        let api_task = tokio::spawn(api::server::serve(listener, backend, api_quit_rx.clone()));

        let _signal_tasks = sigproxy::forward_signals(child_pid, api_quit_rx);

        let status = tokio::task::spawn_blocking(move || wait_child(child_pid))
            .await
            .map_err(|err| LifecycleError::ChildStart(err.to_string()))??;

        // Ordered shutdown: API first, then the port driver, then drain its
        // error channel.
        let _ = api_quit_tx.send(true);
        let _ = api_task.await;
        let _ = driver_quit_tx.send(true);
        if let Some(task) = driver_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::warn!("port driver error during shutdown: {}", err),
                Err(err) => log::warn!("port driver task panicked: {}", err),
            }
        }
        Ok(status)
    })
}

/// Block until the child is gone, preserving the code/signal distinction.
fn wait_child(child_pid: Pid) -> Result<i32, LifecycleError> {
    loop {
        match waitpid(child_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(other) => log::debug!("child wait: {:?}", other),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(LifecycleError::sys("waitpid", errno)),
        }
    }
}
