//! Rootless user-namespace launcher.
//!
//! A single unprivileged executable that re-executes itself as a child in
//! fresh Linux namespaces, maps the caller's subordinate uid/gid ranges,
//! optionally wires up userspace networking with host-to-namespace port
//! forwarding, and runs a target command inside the result. A small REST
//! API over a Unix socket manages published ports at runtime.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("rootlesskit only works on linux or android");

pub mod activation;
pub mod api;
pub mod capgate;
pub mod child;
pub mod errors;
pub mod idmap;
pub mod message;
pub mod network;
pub mod parent;
pub mod port;
pub mod quit;
pub mod sigproxy;
pub mod statedir;

/// Pipe descriptors for the handshake, as `"<readFD>,<writeFD>"`.
/// Implementation-private; do not rely on it.
pub const PIPE_FD_ENV_KEY: &str = "_ROOTLESSKIT_PIPEFD";

/// Absolute path of the state directory, published to the child and to API
/// clients.
pub const STATE_DIR_ENV_KEY: &str = "ROOTLESSKIT_STATE_DIR";

/// Informational: the parent's effective uid/gid before mapping.
pub const PARENT_EUID_ENV_KEY: &str = "ROOTLESSKIT_PARENT_EUID";
pub const PARENT_EGID_ENV_KEY: &str = "ROOTLESSKIT_PARENT_EGID";
