//! Capability gate.
//!
//! A process inside a freshly mapped user namespace only acquires its full
//! capability set on the next `exec`. The child therefore re-executes itself
//! once after the parent finishes the id mapping; the re-exec is counted in
//! an environment variable keyed by pid-namespace inode and pid so nested
//! invocations never share a counter, and gives up after a bound in case the
//! environment never grants capabilities.

use crate::errors::LifecycleError;
use std::{env, fs, io, os::unix::process::CommandExt, process::Command};

/// Abort when the re-exec counter passes this.
pub const MAX_REEXEC_COUNT: u32 = 10;

const REEXEC_ENV_PREFIX: &str = "_ROOTLESSKIT_REEXEC_COUNT";

/// Current effective capability mask, from `/proc/self/status`.
pub fn effective_caps() -> io::Result<u64> {
    let status = fs::read_to_string("/proc/self/status")?;
    parse_cap_eff(&status).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "no CapEff line in /proc/self/status",
        )
    })
}

fn parse_cap_eff(status: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("CapEff:") {
            return u64::from_str_radix(rest.trim(), 16).ok();
        }
    }
    None
}

/// The counter key for this (pidns, pid) pair.
pub fn reexec_env_key() -> io::Result<String> {
    let link = fs::read_link("/proc/self/ns/pid")?;
    let ino = parse_ns_inode(&link.to_string_lossy()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "unparsable pid ns link")
    })?;
    Ok(format!(
        "{}_{}_{}",
        REEXEC_ENV_PREFIX,
        ino,
        std::process::id()
    ))
}

// link text is like "pid:[4026531836]"
fn parse_ns_inode(link: &str) -> Option<u64> {
    let open = link.find('[')?;
    let close = link.find(']')?;
    link.get(open + 1..close)?.parse().ok()
}

/// How many times this (pidns, pid) has already re-executed.
pub fn reexec_count() -> io::Result<u32> {
    let key = reexec_env_key()?;
    Ok(env::var(&key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// Whether the current process already went through the re-exec.
/// The child uses this to skip the already-consumed handshake steps.
pub fn already_reexeced() -> bool {
    reexec_count().map(|c| c > 0).unwrap_or(false)
}

/// Re-execute `/proc/self/exe` with the same argv to pick up capabilities.
/// Only returns on failure; aborts once the counter exceeds the bound.
pub fn reexec_to_gain_caps() -> Result<std::convert::Infallible, LifecycleError> {
    let key = reexec_env_key()?;
    let count = reexec_count()?;
    if count >= MAX_REEXEC_COUNT {
        return Err(LifecycleError::CapsNotGained(count));
    }
    log::debug!("re-executing to gain effective capabilities (attempt {})", count + 1);
    let err = Command::new("/proc/self/exe")
        .args(env::args_os().skip(1))
        .env(key, (count + 1).to_string())
        .exec();
    Err(LifecycleError::Io(err))
}

/// Drop the counter so descendants start fresh.
pub fn clear_reexec_env() {
    if let Ok(key) = reexec_env_key() {
        env::remove_var(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_eff_parsing() {
        let status = "Name:\ttrue\nCapInh:\t0000000000000000\nCapPrm:\t000001ffffffffff\nCapEff:\t000001ffffffffff\n";
        assert_eq!(parse_cap_eff(status), Some(0x000001ffffffffff));

        let unprivileged = "CapEff:\t0000000000000000\n";
        assert_eq!(parse_cap_eff(unprivileged), Some(0));

        assert_eq!(parse_cap_eff("Name:\ttrue\n"), None);
    }

    #[test]
    fn ns_inode_parsing() {
        assert_eq!(parse_ns_inode("pid:[4026531836]"), Some(4026531836));
        assert_eq!(parse_ns_inode("pid:[]"), None);
        assert_eq!(parse_ns_inode("garbage"), None);
    }

    #[test]
    fn effective_caps_readable() {
        // Whatever the test environment is, the file must parse.
        effective_caps().unwrap();
    }
}
