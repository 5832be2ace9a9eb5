//! Parent half of the builtin driver: host-side listeners and the control
//! channel that hands accepted descriptors to the child.

use super::{
    msg::{self, CtrlMessage},
    CTRL_SOCK_NAME, DRIVER_NAME, OPAQUE_SOCK_PATH, SHUTDOWN_GRACE, STATE_SUBDIR, UDP_IDLE_TIMEOUT,
};
use crate::{
    api::PortDriverInfo,
    errors::PortError,
    port::{portutil, ChildContext, Family, PortSpec, PortStatus, ProtoBase},
    quit,
};
use async_trait::async_trait;
use fd_queue::EnqueueFd;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Instant,
};
use tokio::{
    net::{TcpListener, UdpSocket, UnixDatagram},
    sync::{oneshot, watch, Mutex, OnceCell},
    task::JoinHandle,
    time,
};

/// The single multiplexed control connection to the child driver.
/// Held under a lock so a `Begin` frame and its descriptor stay paired.
struct CtrlChannel {
    stream: Mutex<fd_queue::tokio::UnixStream>,
}

impl CtrlChannel {
    async fn send<F: AsRawFd>(
        &self,
        message: &CtrlMessage,
        fd: Option<&F>,
    ) -> Result<(), PortError> {
        let mut stream = self.stream.lock().await;
        if let Some(fd) = fd {
            stream
                .enqueue(fd)
                .map_err(|err| PortError::Helper(format!("fd queue full: {}", err)))?;
        }
        msg::send_ctrl(&mut *stream, message).await
    }
}

struct Entry {
    status: PortStatus,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Driver {
    ctrl_sock_path: PathBuf,
    ctrl: Arc<OnceCell<CtrlChannel>>,
    table: Mutex<HashMap<i32, Entry>>,
    next_port_id: AtomicI32,
    next_conn_id: Arc<AtomicU64>,
    shutting_down: AtomicBool,
}

impl Driver {
    pub fn new(state_dir: &Path) -> Result<Driver, PortError> {
        let subdir = state_dir.join(STATE_SUBDIR);
        fs::create_dir_all(&subdir)?;
        Ok(Driver {
            ctrl_sock_path: subdir.join(CTRL_SOCK_NAME),
            ctrl: Arc::new(OnceCell::new()),
            table: Mutex::new(HashMap::new()),
            next_port_id: AtomicI32::new(1),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            shutting_down: AtomicBool::new(false),
        })
    }

    async fn shutdown(&self) -> Result<(), PortError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<Entry> = {
            let mut table = self.table.lock().await;
            table.drain().map(|(_, entry)| entry).collect()
        };
        let mut tasks = Vec::new();
        for entry in entries {
            let _ = entry.cancel.send(true);
            tasks.extend(entry.tasks);
        }
        if let Some(ctrl) = self.ctrl.get() {
            if let Err(err) = ctrl
                .send::<std::net::TcpStream>(&CtrlMessage::Drain, None)
                .await
            {
                log::debug!("builtin: failed to send the drain message: {}", err);
            }
        }
        log::debug!(
            "builtin: waiting up to {:?} for in-flight forwarders",
            SHUTDOWN_GRACE
        );
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if time::timeout(remaining, &mut task).await.is_err() {
                log::debug!("builtin: grace period expired, hard-closing a forwarder");
                task.abort();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl crate::port::ParentDriver for Driver {
    fn info(&self) -> PortDriverInfo {
        PortDriverInfo {
            driver: DRIVER_NAME.to_string(),
            protos: ["tcp", "tcp4", "tcp6", "udp", "udp4", "udp6"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            disallow_loopback_child_ip: false,
        }
    }

    fn opaque_for_child(&self) -> HashMap<String, String> {
        let mut opaque = HashMap::new();
        opaque.insert(
            OPAQUE_SOCK_PATH.to_string(),
            self.ctrl_sock_path.to_string_lossy().into_owned(),
        );
        opaque
    }

    async fn run_parent_driver(
        &self,
        init_complete: oneshot::Sender<()>,
        quit_rx: watch::Receiver<bool>,
        _child_ctx: ChildContext,
    ) -> Result<(), PortError> {
        let _ = fs::remove_file(&self.ctrl_sock_path);
        let mut listener = fd_queue::tokio::UnixListener::bind(&self.ctrl_sock_path)?;
        log::debug!(
            "builtin: listening on the control socket {}",
            self.ctrl_sock_path.display()
        );
        tokio::select! {
            _ = quit::fired(quit_rx.clone()) => return Ok(()),
            res = listener.accept() => {
                let (stream, _) = res?;
                self.ctrl
                    .set(CtrlChannel { stream: Mutex::new(stream) })
                    .map_err(|_| PortError::Helper("control channel connected twice".to_string()))?;
            }
        }
        drop(listener);
        log::debug!("builtin: child driver connected");
        let _ = init_complete.send(());
        quit::fired(quit_rx).await;
        self.shutdown().await
    }

    async fn add_port(&self, spec: PortSpec) -> Result<PortStatus, PortError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PortError::ShuttingDown);
        }
        let mut table = self.table.lock().await;
        let existing: Vec<PortStatus> = table.values().map(|e| e.status.clone()).collect();
        portutil::validate_port_spec(&spec, &existing)?;

        let binds = bind_addrs(&spec)?;
        let dual = binds.len() > 1;
        let id = self.next_port_id.fetch_add(1, Ordering::SeqCst);
        let (cancel_tx, cancel_rx) = quit::channel();
        let mut tasks = Vec::new();

        match spec.proto.base() {
            ProtoBase::Tcp => {
                let mut listeners = Vec::new();
                let mut last_err = None;
                for (addr, v6only) in binds {
                    match bind_tcp(addr, v6only) {
                        Ok(listener) => listeners.push(listener),
                        Err(err) => last_err = Some(err),
                    }
                }
                match (listeners.is_empty(), last_err) {
                    (true, Some(err)) => return Err(err),
                    (false, Some(err)) if dual => {
                        log::debug!("builtin: partial dual-stack bind for {}: {}", spec, err)
                    }
                    (_, Some(err)) => return Err(err),
                    _ => {}
                }
                for listener in listeners {
                    tasks.push(tokio::spawn(tcp_accept_loop(
                        listener,
                        spec.clone(),
                        self.ctrl.clone(),
                        self.next_conn_id.clone(),
                        cancel_rx.clone(),
                    )));
                }
            }
            ProtoBase::Udp => {
                let mut sockets = Vec::new();
                let mut last_err = None;
                for (addr, v6only) in binds {
                    match bind_udp(addr, v6only) {
                        Ok(socket) => sockets.push(socket),
                        Err(err) => last_err = Some(err),
                    }
                }
                match (sockets.is_empty(), last_err) {
                    (true, Some(err)) => return Err(err),
                    (false, Some(err)) if dual => {
                        log::debug!("builtin: partial dual-stack bind for {}: {}", spec, err)
                    }
                    (_, Some(err)) => return Err(err),
                    _ => {}
                }
                for socket in sockets {
                    tasks.push(tokio::spawn(udp_relay_loop(
                        socket,
                        spec.clone(),
                        self.ctrl.clone(),
                        self.next_conn_id.clone(),
                        cancel_rx.clone(),
                    )));
                }
            }
        }

        let status = PortStatus { id, spec };
        log::debug!("builtin: published {:?}", status);
        table.insert(
            id,
            Entry {
                status: status.clone(),
                cancel: cancel_tx,
                tasks,
            },
        );
        Ok(status)
    }

    async fn list_ports(&self) -> Vec<PortStatus> {
        let table = self.table.lock().await;
        let mut ports: Vec<PortStatus> = table.values().map(|e| e.status.clone()).collect();
        ports.sort_by_key(|status| status.id);
        ports
    }

    async fn remove_port(&self, id: i32) -> Result<(), PortError> {
        let entry = {
            let mut table = self.table.lock().await;
            table.remove(&id).ok_or(PortError::NotFound(id))?
        };
        let _ = entry.cancel.send(true);
        // The listeners close when their accept loops unwind; existing
        // connections keep running in the child until their own EOF.
        for task in entry.tasks {
            let _ = task.await;
        }
        log::debug!("builtin: removed port {}", id);
        Ok(())
    }
}

/// The socket addresses a spec binds; unsuffixed protocols with no parent
/// IP expand to both wildcard families.
fn bind_addrs(spec: &PortSpec) -> Result<Vec<(SocketAddr, bool)>, PortError> {
    let port = spec.parent_port;
    match spec.parent_ip_addr()? {
        Some(ip) => Ok(vec![(SocketAddr::new(ip, port), ip.is_ipv6())]),
        None => {
            let family = spec.proto.family();
            let mut addrs = Vec::new();
            if family.wants_v4() {
                addrs.push((SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port), false));
            }
            if family.wants_v6() {
                addrs.push((SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), true));
            }
            Ok(addrs)
        }
    }
}

fn new_socket(addr: SocketAddr, v6only: bool, type_: Type, proto: Protocol) -> Result<Socket, PortError> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, type_, Some(proto))?;
    if addr.is_ipv6() {
        socket.set_only_v6(v6only)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_tcp(addr: SocketAddr, v6only: bool) -> Result<TcpListener, PortError> {
    let socket = new_socket(addr, v6only, Type::STREAM, Protocol::TCP)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn bind_udp(addr: SocketAddr, v6only: bool) -> Result<UdpSocket, PortError> {
    let socket = new_socket(addr, v6only, Type::DGRAM, Protocol::UDP)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Where the child should connect for this spec.
fn child_target_ip(spec: &PortSpec) -> String {
    if !spec.child_ip.is_empty() {
        return spec.child_ip.clone();
    }
    match spec.effective_family() {
        Ok(Family::V6) => "::1".to_string(),
        _ => "127.0.0.1".to_string(),
    }
}

async fn tcp_accept_loop(
    listener: TcpListener,
    spec: PortSpec,
    ctrl: Arc<OnceCell<CtrlChannel>>,
    conn_ids: Arc<AtomicU64>,
    cancel: watch::Receiver<bool>,
) {
    let target_ip = child_target_ip(&spec);
    loop {
        tokio::select! {
            _ = quit::fired(cancel.clone()) => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("builtin: accept failed on {}: {}", spec, err);
                        continue;
                    }
                };
                // Keepalive with the kernel defaults, so a dead peer cannot
                // pin the forwarder forever.
                if let Err(err) = SockRef::from(&stream).set_keepalive(true) {
                    log::debug!("builtin: cannot enable keepalive for {}: {}", peer, err);
                }
                let std_stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::warn!("builtin: cannot detach the accepted socket: {}", err);
                        continue;
                    }
                };
                let id = conn_ids.fetch_add(1, Ordering::SeqCst);
                let begin = CtrlMessage::Begin {
                    id,
                    proto: "tcp".to_string(),
                    ip: target_ip.clone(),
                    port: spec.child_port,
                };
                match ctrl.get() {
                    None => log::warn!(
                        "builtin: dropping connection from {}: child driver not connected",
                        peer
                    ),
                    Some(channel) => {
                        if let Err(err) = channel.send(&begin, Some(&std_stream)).await {
                            log::warn!("builtin: handoff of connection from {} failed: {}", peer, err);
                        }
                    }
                }
                // Our copy of the descriptor closes here; the child owns
                // the transferred duplicate.
                drop(std_stream);
            }
        }
    }
    // Dropping the listener here is what makes RemovePort observable.
    drop(listener);
}

struct UdpFlow {
    tx: Arc<UnixDatagram>,
    last_active: Arc<StdMutex<Instant>>,
    task: JoinHandle<()>,
}

async fn udp_relay_loop(
    socket: UdpSocket,
    spec: PortSpec,
    ctrl: Arc<OnceCell<CtrlChannel>>,
    conn_ids: Arc<AtomicU64>,
    cancel: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let target_ip = child_target_ip(&spec);
    let mut flows: HashMap<SocketAddr, UdpFlow> = HashMap::new();
    let mut sweep = time::interval(UDP_IDLE_TIMEOUT / 2);
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = quit::fired(cancel.clone()) => break,
            _ = sweep.tick() => {
                let now = Instant::now();
                flows.retain(|src, flow| {
                    let idle = now.duration_since(*flow.last_active.lock().unwrap());
                    if idle >= UDP_IDLE_TIMEOUT {
                        log::debug!("builtin: udp flow from {} idle for {:?}, releasing", src, idle);
                        flow.task.abort();
                        false
                    } else {
                        true
                    }
                });
            }
            res = socket.recv_from(&mut buf) => {
                let (len, src) = match res {
                    Ok(received) => received,
                    Err(err) => {
                        log::warn!("builtin: udp recv failed on {}: {}", spec, err);
                        continue;
                    }
                };
                if !flows.contains_key(&src) {
                    match open_udp_flow(
                        socket.clone(),
                        src,
                        &target_ip,
                        spec.child_port,
                        &ctrl,
                        &conn_ids,
                        cancel.clone(),
                    )
                    .await
                    {
                        Ok(flow) => {
                            flows.insert(src, flow);
                        }
                        Err(err) => {
                            log::warn!("builtin: cannot open udp flow for {}: {}", src, err);
                            continue;
                        }
                    }
                }
                let send_failed = {
                    let flow = flows.get(&src).unwrap();
                    *flow.last_active.lock().unwrap() = Instant::now();
                    flow.tx.send(&buf[..len]).await.is_err()
                };
                if send_failed {
                    if let Some(flow) = flows.remove(&src) {
                        flow.task.abort();
                    }
                }
            }
        }
    }
    for (_, flow) in flows {
        flow.task.abort();
    }
}

async fn open_udp_flow(
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    target_ip: &str,
    target_port: u16,
    ctrl: &Arc<OnceCell<CtrlChannel>>,
    conn_ids: &Arc<AtomicU64>,
    cancel: watch::Receiver<bool>,
) -> Result<UdpFlow, PortError> {
    let (parent_end, child_end) = std::os::unix::net::UnixDatagram::pair()?;
    parent_end.set_nonblocking(true)?;
    let parent_end = Arc::new(UnixDatagram::from_std(parent_end)?);
    let id = conn_ids.fetch_add(1, Ordering::SeqCst);
    let begin = CtrlMessage::Begin {
        id,
        proto: "udp".to_string(),
        ip: target_ip.to_string(),
        port: target_port,
    };
    let channel = ctrl.get().ok_or(PortError::ChildNotConnected)?;
    channel.send(&begin, Some(&child_end)).await?;
    drop(child_end);
    log::debug!("builtin: new udp flow {} from {}", id, src);

    let last_active = Arc::new(StdMutex::new(Instant::now()));
    let task = tokio::spawn(udp_return_loop(
        parent_end.clone(),
        socket,
        src,
        last_active.clone(),
        cancel,
    ));
    Ok(UdpFlow {
        tx: parent_end,
        last_active,
        task,
    })
}

/// Relay replies from the child's socket back to the original source.
async fn udp_return_loop(
    pair: Arc<UnixDatagram>,
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    last_active: Arc<StdMutex<Instant>>,
    cancel: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = quit::fired(cancel.clone()) => break,
            res = pair.recv(&mut buf) => {
                let len = match res {
                    Ok(len) => len,
                    Err(_) => break,
                };
                *last_active.lock().unwrap() = Instant::now();
                if socket.send_to(&buf[..len], src).await.is_err() {
                    break;
                }
            }
        }
    }
}
