//! Error types you might see while launching or operating a namespace

use std::path::PathBuf;
use thiserror::Error;

/// Errors in the length-prefixed message codec and the handshake protocol
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// io error on the handshake pipe
    #[error("io error on the handshake pipe: {0}")]
    Io(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// frame length outside the accepted bounds
    #[error("invalid frame length {0} (accepted range is 1..={max})", max = crate::message::MAX_FRAME_LEN)]
    FrameLength(u32),

    /// peer sent a message out of order
    #[error("expected message {expected:?}, got {got:?}")]
    UnexpectedMessage { expected: String, got: String },
}

/// Errors while resolving subordinate UID/GID ranges
#[derive(Error, Debug)]
pub enum IdmapError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// no subordinate ranges allocated to the caller
    #[error("no sub{kind} ranges found for user {uid} ({username:?})")]
    NoRanges {
        kind: &'static str,
        uid: u32,
        username: String,
    },

    /// a subuid/subgid line did not have the name:start:length shape
    #[error("cannot parse line {lineno} of {path}: {line:?}")]
    MalformedLine {
        path: PathBuf,
        lineno: usize,
        line: String,
    },

    /// getsubids printed something unparsable
    #[error("cannot parse getsubids output line {lineno}: {line:?}")]
    MalformedGetsubids { lineno: usize, line: String },

    /// a range exceeds the 32-bit id space
    #[error("id range ({start}, {length}) exceeds the 32-bit id space")]
    RangeOverflow { start: u32, length: u32 },

    /// the helper executable failed
    #[error("failed to execute {argv:?}: {message}")]
    HelperFailed { argv: Vec<String>, message: String },

    /// the caller has no passwd entry
    #[error("failed to look up the current user (uid {0})")]
    UnknownUser(u32),
}

/// Errors around the per-invocation state directory
#[derive(Error, Debug)]
pub enum StateDirError {
    /// io error
    #[error("io error on state dir entry {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// another instance already holds the lock
    #[error(
        "failed to lock {0}, another rootlesskit is running with the same state directory? \
         (try pointing --state-dir elsewhere)"
    )]
    Busy(PathBuf),

    /// the state dir path must be absolute
    #[error("state dir {0} must be an absolute path")]
    NotAbsolute(PathBuf),

    /// the state dir is missing or not a directory
    #[error("state dir {0} is inaccessible")]
    Inaccessible(PathBuf),
}

/// Errors from network drivers and the in-child interface configuration
#[derive(Error, Debug)]
pub enum NetworkError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// a required external tool is missing from PATH
    #[error("required command {0:?} is not installed")]
    MissingTool(String),

    /// an external helper exited unsuccessfully
    #[error("command {argv:?} failed: {status}: {stderr}")]
    CommandFailed {
        argv: Vec<String>,
        status: String,
        stderr: String,
    },

    /// the selected driver is not compiled into this binary
    #[error("network driver {0:?} is not compiled in")]
    NotCompiledIn(String),

    /// the driver failed with its own diagnosis
    #[error("network driver {driver:?}: {message}")]
    Driver {
        driver: &'static str,
        message: String,
    },

    /// a CIDR string whose host bits are set, or otherwise invalid
    #[error("invalid CIDR {0:?} (must be a network address like 10.0.2.0/24)")]
    InvalidCidr(String),

    /// ipv4 arithmetic walked off the end of the address space
    #[error("{ip} + {offset} overflows")]
    AddressOverflow { ip: std::net::Ipv4Addr, offset: u32 },
}

/// Errors from port drivers, including the REST-visible conflict/not-found kinds
#[derive(Error, Debug)]
pub enum PortError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// json error on the control channel
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// port number outside 1..=65535
    #[error("invalid port {0} (must be in 1..=65535)")]
    InvalidPort(i64),

    /// unknown protocol tag
    #[error("invalid proto {0:?} (must be one of tcp, tcp4, tcp6, udp, udp4, udp6)")]
    InvalidProto(String),

    /// unparsable textual port spec
    #[error("unexpected port spec string {0:?} (expected [PARENT_IP:]PARENT_PORT:[CHILD_IP:]CHILD_PORT/PROTO)")]
    InvalidSpecString(String),

    /// unparsable IP address inside a spec
    #[error("invalid IP {0:?}")]
    InvalidIp(String),

    /// address family does not match the proto suffix
    #[error("IP {ip:?} does not match the address family of proto {proto:?}")]
    FamilyMismatch { ip: String, proto: String },

    /// the spec collides with an already-published port
    #[error("port {new} conflicts with already-published port {existing}")]
    Conflict { new: String, existing: String },

    /// no such port id
    #[error("unknown port id {0}")]
    NotFound(i32),

    /// the driver does not support this protocol
    #[error("protocol {proto:?} is not supported by the {driver} port driver")]
    UnsupportedProto {
        driver: &'static str,
        proto: String,
    },

    /// the selected driver is not compiled into this binary
    #[error("port driver {0:?} is not compiled in")]
    NotCompiledIn(String),

    /// the control channel to the child is not established (or already gone)
    #[error("the child-side port driver is not connected")]
    ChildNotConnected,

    /// the driver is shutting down
    #[error("the port driver is shutting down")]
    ShuttingDown,

    /// an external helper's API replied with an error
    #[error("port driver helper error: {0}")]
    Helper(String),
}

/// Errors in the parent or child lifecycle engines
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// low-level system call failure
    #[error("{operation}: {errno}")]
    Sys {
        operation: String,
        errno: nix::errno::Errno,
    },

    /// handshake protocol error
    #[error("handshake error: {0}")]
    Protocol(#[from] ProtocolError),

    /// subordinate id resolution failed
    #[error("failed to set up UID/GID map: {0}")]
    Idmap(#[from] IdmapError),

    /// state dir error
    #[error(transparent)]
    StateDir(#[from] StateDirError),

    /// network driver error
    #[error("failed to set up network: {0}")]
    Network(#[from] NetworkError),

    /// port driver error
    #[error("failed to set up port forwarding: {0}")]
    Port(#[from] PortError),

    /// the child could not be started
    #[error("failed to start the child: {0}")]
    ChildStart(String),

    /// an external mapping tool failed, stderr attached
    #[error("{tool} {argv:?} failed: {output}")]
    MappingToolFailed {
        tool: &'static str,
        argv: Vec<String>,
        output: String,
    },

    /// capabilities never became effective despite repeated re-exec
    #[error("failed to gain effective capabilities after {0} re-execs")]
    CapsNotGained(u32),

    /// cgroup2 evacuation failed
    #[error("failed to evacuate processes into cgroup {name:?}: {message}")]
    Cgroup { name: String, message: String },

    /// a mount inside the child failed
    #[error("failed to mount {target} ({fstype}): {errno}")]
    Mount {
        target: PathBuf,
        fstype: &'static str,
        errno: nix::errno::Errno,
    },

    /// usage error, surfaced verbatim
    #[error("{0}")]
    Usage(String),
}

impl LifecycleError {
    pub(crate) fn sys(operation: impl Into<String>, errno: nix::errno::Errno) -> Self {
        LifecycleError::Sys {
            operation: operation.into(),
            errno,
        }
    }
}
