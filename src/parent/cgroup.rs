//! Cgroup2 evacuation.
//!
//! Unsharing a cgroup namespace pins the namespace root at the process's
//! current cgroup. When that cgroup also holds other processes (a shell's
//! session scope, say), controllers cannot be delegated to the child. The
//! parent therefore moves every process of its current cgroup, itself
//! included, into a fresh leaf before the child unshares cgroupns.

use crate::errors::LifecycleError;
use std::{fs, path::PathBuf};

const CGROUP2_MOUNT: &str = "/sys/fs/cgroup";

pub fn evacuate_cgroup2(name: &str) -> Result<(), LifecycleError> {
    let fail = |message: String| LifecycleError::Cgroup {
        name: name.to_string(),
        message,
    };
    let self_cgroup = fs::read_to_string("/proc/self/cgroup")
        .map_err(|err| fail(format!("reading /proc/self/cgroup: {}", err)))?;
    let current = parse_cgroup2_path(&self_cgroup)
        .ok_or_else(|| fail("process is not on the cgroup2 hierarchy".to_string()))?;
    let current_dir = PathBuf::from(CGROUP2_MOUNT).join(current.trim_start_matches('/'));
    let leaf = current_dir.join(name);
    fs::create_dir_all(&leaf).map_err(|err| fail(format!("creating {:?}: {}", leaf, err)))?;

    let procs = fs::read_to_string(current_dir.join("cgroup.procs"))
        .map_err(|err| fail(format!("listing {:?}: {}", current_dir, err)))?;
    let leaf_procs = leaf.join("cgroup.procs");
    for pid in procs.lines().filter(|line| !line.is_empty()) {
        // Racing processes may exit between the listing and the move.
        if let Err(err) = fs::write(&leaf_procs, pid) {
            log::debug!("cannot move pid {} into {:?}: {}", pid, leaf, err);
        }
    }
    log::debug!("evacuated the current cgroup into {:?}", leaf);
    Ok(())
}

/// `0::/user.slice/...` -> `/user.slice/...`
fn parse_cgroup2_path(content: &str) -> Option<String> {
    for line in content.lines() {
        if let Some(path) = line.strip_prefix("0::") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup2_path_parsing() {
        let hybrid = "12:pids:/user.slice\n0::/user.slice/user-1000.slice\n";
        assert_eq!(
            parse_cgroup2_path(hybrid).unwrap(),
            "/user.slice/user-1000.slice"
        );
        assert!(parse_cgroup2_path("12:pids:/user.slice\n").is_none());
    }
}
