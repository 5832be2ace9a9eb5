//! Child half of the builtin driver: receives descriptors over the control
//! socket, connects to the target inside the child's namespaces, and
//! shovels bytes until both sides hang up.

use super::{
    msg::{self, CtrlMessage},
    OPAQUE_SOCK_PATH, SHUTDOWN_GRACE, UDP_IDLE_TIMEOUT,
};
use crate::{errors::PortError, quit};
use fd_queue::DequeueFd;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    os::unix::io::{FromRawFd, RawFd},
    path::{Path, PathBuf},
    time::Instant,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket, UnixDatagram},
    sync::watch,
    task::JoinHandle,
    time,
};

pub struct Driver {}

impl Driver {
    pub fn new() -> Driver {
        Driver {}
    }
}

impl Default for Driver {
    fn default() -> Driver {
        Driver::new()
    }
}

impl crate::port::ChildDriver for Driver {
    fn run_child_driver(
        &self,
        opaque: HashMap<String, String>,
        quit_rx: watch::Receiver<bool>,
        detached_netns: Option<PathBuf>,
    ) -> Result<(), PortError> {
        let sock_path = opaque
            .get(OPAQUE_SOCK_PATH)
            .ok_or_else(|| PortError::Helper(format!("{} missing from opaque", OPAQUE_SOCK_PATH)))?
            .clone();
        if let Some(netns) = &detached_netns {
            enter_netns(netns)?;
        }
        // Everything stays on this thread so the sockets inherit the
        // namespace this thread just entered.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(run(&sock_path, quit_rx))
    }
}

/// Join the detached network namespace on the calling thread only.
fn enter_netns(path: &Path) -> Result<(), PortError> {
    let file = std::fs::File::open(path)?;
    nix::sched::setns(&file, nix::sched::CloneFlags::CLONE_NEWNET)
        .map_err(|errno| PortError::Helper(format!("setns({}): {}", path.display(), errno)))
}

async fn run(sock_path: &str, quit_rx: watch::Receiver<bool>) -> Result<(), PortError> {
    let mut stream = fd_queue::tokio::UnixStream::connect(sock_path).await?;
    log::debug!("builtin child: connected to {}", sock_path);
    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            _ = quit::fired(quit_rx.clone()) => break,
            res = msg::recv_ctrl(&mut stream) => {
                match res? {
                    None => {
                        log::debug!("builtin child: control socket closed");
                        break;
                    }
                    Some(CtrlMessage::Drain) => {
                        log::debug!("builtin child: drain requested");
                        break;
                    }
                    Some(CtrlMessage::Begin { id, proto, ip, port }) => {
                        let fd = stream
                            .dequeue()
                            .ok_or_else(|| PortError::Helper(
                                format!("no descriptor attached to connection {}", id),
                            ))?;
                        forwarders.retain(|task| !task.is_finished());
                        forwarders.push(spawn_forwarder(id, proto, ip, port, fd, quit_rx.clone()));
                    }
                }
            }
        }
    }
    // Let in-flight forwarders finish their conversations, then cut them.
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    for mut task in forwarders {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if time::timeout(remaining, &mut task).await.is_err() {
            task.abort();
        }
    }
    Ok(())
}

fn spawn_forwarder(
    id: u64,
    proto: String,
    ip: String,
    port: u16,
    fd: RawFd,
    quit_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match proto.as_str() {
            "tcp" => tcp_forward(fd, &ip, port).await,
            "udp" => udp_forward(fd, &ip, port, quit_rx).await,
            other => Err(PortError::InvalidProto(other.to_string())),
        };
        match result {
            Ok(()) => log::debug!("builtin child: forwarder {} finished", id),
            Err(err) => log::debug!("builtin child: forwarder {} failed: {}", id, err),
        }
    })
}

fn target_addr(ip: &str, port: u16) -> Result<SocketAddr, PortError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| PortError::InvalidIp(ip.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Connect to the target and run the two copy loops. Each side's EOF
/// half-closes the other direction; both EOFs close the pair.
async fn tcp_forward(fd: RawFd, ip: &str, port: u16) -> Result<(), PortError> {
    let host_side = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    host_side.set_nonblocking(true)?;
    let host_side = TcpStream::from_std(host_side)?;
    let target = TcpStream::connect(target_addr(ip, port)?).await?;

    let (mut host_read, mut host_write) = host_side.into_split();
    let (mut target_read, mut target_write) = target.into_split();
    let into_child = async move {
        let _ = tokio::io::copy(&mut host_read, &mut target_write).await;
        let _ = target_write.shutdown().await;
    };
    let out_of_child = async move {
        let _ = tokio::io::copy(&mut target_read, &mut host_write).await;
        let _ = host_write.shutdown().await;
    };
    tokio::join!(into_child, out_of_child);
    Ok(())
}

/// Relay datagrams between the passed socketpair end and a fresh UDP socket
/// connected to the target. Released after the idle timeout, matching the
/// parent's flow table.
async fn udp_forward(
    fd: RawFd,
    ip: &str,
    port: u16,
    quit_rx: watch::Receiver<bool>,
) -> Result<(), PortError> {
    let pair = unsafe { std::os::unix::net::UnixDatagram::from_raw_fd(fd) };
    pair.set_nonblocking(true)?;
    let pair = UnixDatagram::from_std(pair)?;

    let target = target_addr(ip, port)?;
    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(target).await?;

    let mut from_host = vec![0u8; 65536];
    let mut from_target = vec![0u8; 65536];
    let mut last_active = Instant::now();
    loop {
        let idle_deadline = time::Instant::from_std(last_active + UDP_IDLE_TIMEOUT);
        tokio::select! {
            _ = quit::fired(quit_rx.clone()) => break,
            _ = time::sleep_until(idle_deadline) => {
                log::debug!("builtin child: udp forwarder idle for {:?}, closing", UDP_IDLE_TIMEOUT);
                break;
            }
            res = pair.recv(&mut from_host) => {
                let len = match res {
                    Ok(len) => len,
                    Err(_) => break,
                };
                last_active = Instant::now();
                if socket.send(&from_host[..len]).await.is_err() {
                    break;
                }
            }
            res = socket.recv(&mut from_target) => {
                let len = match res {
                    Ok(len) => len,
                    Err(_) => break,
                };
                last_active = Instant::now();
                if pair.send(&from_target[..len]).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}
