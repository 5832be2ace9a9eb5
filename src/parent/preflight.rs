//! Pre-flight environment checks.
//!
//! None of these stop the launch on their own; they turn the most common
//! misconfigurations into actionable warnings before the child start either
//! succeeds or produces a less helpful kernel error.

use crate::child::mount::Propagation;
use nix::errno::Errno;
use std::fs;

pub fn warn_if_root() {
    if nix::unistd::geteuid().is_root() {
        log::warn!("running rootlesskit as the root user is unsupported");
    }
}

/// Inspect the sysctls that can disable unprivileged user namespaces.
pub fn warn_sysctl() {
    // Only exists on distros carrying the unprivileged-userns-clone patch.
    if let Ok(content) = fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        match content.trim().parse::<i64>() {
            Ok(0) => {
                log::warn!("/proc/sys/kernel/unprivileged_userns_clone needs to be set to 1")
            }
            Ok(_) => {}
            Err(_) => log::warn!(
                "failed to parse /proc/sys/kernel/unprivileged_userns_clone ({:?})",
                content.trim()
            ),
        }
    }
    if let Ok(content) = fs::read_to_string("/proc/sys/user/max_user_namespaces") {
        match content.trim().parse::<i64>() {
            Ok(0) => {
                log::warn!("/proc/sys/user/max_user_namespaces needs to be set to non-zero")
            }
            Ok(n) if n < 1024 => {
                log::warn!(
                    "/proc/sys/user/max_user_namespaces={} may be low, consider setting to >= 1024",
                    n
                )
            }
            Ok(_) => {}
            Err(_) => log::warn!(
                "failed to parse /proc/sys/user/max_user_namespaces ({:?})",
                content.trim()
            ),
        }
    }
}

/// Non-private child propagation only works when the host root mount is
/// shared; inside a container it typically is not.
pub fn warn_propagation(propagation: Propagation) {
    if propagation.as_str().contains("private") {
        return;
    }
    let mountinfo = match fs::read_to_string("/proc/self/mountinfo") {
        Ok(content) => content,
        Err(err) => {
            log::warn!("failed to parse mountinfo: {}", err);
            return;
        }
    };
    match root_optional_fields(&mountinfo) {
        None => log::warn!("failed to parse mountinfo"),
        Some(optional) => {
            if !optional.iter().any(|field| field.starts_with("shared:")) {
                log::warn!(
                    "the host root filesystem is mounted as {:?}; setting child propagation to {:?} is not supported",
                    optional.join(" "),
                    propagation.as_str()
                );
            }
        }
    }
}

/// Optional fields (`shared:N`, `master:N`, ...) of the `/` mountinfo entry.
fn root_optional_fields(mountinfo: &str) -> Option<Vec<String>> {
    for line in mountinfo.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        // id parent major:minor root mountpoint opts [optional...] - fstype ...
        if fields.len() < 7 || fields[4] != "/" {
            continue;
        }
        let mut optional = Vec::new();
        for field in &fields[6..] {
            if *field == "-" {
                break;
            }
            optional.push(field.to_string());
        }
        return Some(optional);
    }
    None
}

/// Surface the AppArmor remediation when a child start fails with a
/// permission error and the restriction sysctl is on.
pub fn warn_on_child_start_failure(errno: Errno) {
    if errno != Errno::EACCES && errno != Errno::EPERM {
        return;
    }
    let content =
        match fs::read_to_string("/proc/sys/kernel/apparmor_restrict_unprivileged_userns") {
            Ok(content) => content,
            Err(_) => return,
        };
    if content.trim() != "1" {
        return;
    }
    let self_exe = fs::read_link("/proc/self/exe")
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/usr/local/bin/rootlesskit".to_string());
    let profile_name = self_exe.trim_start_matches('/').replace('/', ".");
    log::warn!(
        "the child start failed with {}; this might be because \
         /proc/sys/kernel/apparmor_restrict_unprivileged_userns is set to 1",
        errno
    );
    log::warn!(
        "hint: try running the following commands:\n\
         ########## BEGIN ##########\n\
         cat <<EOT | sudo tee \"/etc/apparmor.d/{profile}\"\n\
         abi <abi/4.0>,\n\
         include <tunables/global>\n\
         \n\
         {exe} flags=(unconfined) {{\n\
         \x20 userns,\n\
         \n\
         \x20 # Site-specific additions and overrides. See local/README for details.\n\
         \x20 include if exists <local/{profile}>\n\
         }}\n\
         EOT\n\
         sudo systemctl restart apparmor.service\n\
         ########## END ##########",
        profile = profile_name,
        exe = self_exe,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mountinfo_optional_fields() {
        let shared = "22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n";
        assert_eq!(
            root_optional_fields(shared).unwrap(),
            vec!["shared:1".to_string()]
        );

        let slave = "418 276 0:63 / / rw,relatime master:363 - overlay overlay rw\n";
        assert_eq!(
            root_optional_fields(slave).unwrap(),
            vec!["master:363".to_string()]
        );

        let none = "22 1 8:1 / / rw,relatime - ext4 /dev/sda1 rw\n";
        assert_eq!(root_optional_fields(none).unwrap(), Vec::<String>::new());

        assert!(root_optional_fields("garbage\n").is_none());
    }
}
