//! The builtin port driver.
//!
//! The parent holds real listening sockets in the host's network namespace;
//! the child can `connect()` inside its own. Each accepted connection's
//! descriptor is transferred to the child over a single control socket with
//! SCM_RIGHTS, together with the target, and the child shovels bytes from
//! there. UDP flows travel the same way as one end of a datagram socketpair.

pub mod child;
pub mod msg;
pub mod parent;

use std::time::Duration;

pub const DRIVER_NAME: &str = "builtin";

/// Driver-private directory under the state dir.
pub const STATE_SUBDIR: &str = "builtin";
pub const CTRL_SOCK_NAME: &str = "ctrl.sock";
/// Key under which the control socket path travels in the handshake opaque.
pub const OPAQUE_SOCK_PATH: &str = "builtin.socketpath";

/// A UDP flow with no traffic for this long releases its child socket.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long shutdown waits for in-flight forwarders before hard-closing.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
