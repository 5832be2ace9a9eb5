//! Systemd socket-activation helper mode.
//!
//! When a socket-activated service wraps its payload in this launcher, the
//! `LISTEN_PID` protocol breaks: systemd points it at us, not at the final
//! command. The helper mode re-stamps `LISTEN_PID` with its own pid and
//! execs the target in place, so the inherited listen descriptors stay
//! valid where they end up.

use crate::errors::LifecycleError;
use std::{env, os::unix::process::CommandExt, process::Command};

/// Env var that routes an exec into helper mode. Implementation-private.
pub const ACTIVATION_ENV_KEY: &str = "_ROOTLESSKIT_SYSTEMD_ACTIVATION";

/// Replace the current process with `target`, fixing up `LISTEN_PID`.
/// Only returns on failure.
pub fn run(target: &[String]) -> Result<std::convert::Infallible, LifecycleError> {
    if target.is_empty() {
        return Err(LifecycleError::Usage("no command specified".to_string()));
    }
    env::remove_var(ACTIVATION_ENV_KEY);
    env::set_var("LISTEN_PID", std::process::id().to_string());
    let err = Command::new(&target[0]).args(&target[1..]).exec();
    Err(LifecycleError::ChildStart(format!(
        "failed to exec {:?}: {}",
        target[0], err
    )))
}
