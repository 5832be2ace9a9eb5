//! resolv.conf and hosts for the child.
//!
//! Generated under the state dir and bind-mounted over `/etc/...`, or
//! written in place when `/etc` itself was copied up (a bind mount would be
//! shadowed by the tmpfs there).

use crate::errors::LifecycleError;
use nix::mount::{mount, MsFlags};
use std::{fs, path::Path};

fn install(state_dir: &Path, name: &str, content: &str, etc_was_copied: bool) -> Result<(), LifecycleError> {
    let etc_path = Path::new("/etc").join(name);
    if etc_was_copied {
        fs::write(&etc_path, content)?;
        return Ok(());
    }
    let state_path = state_dir.join(name);
    fs::write(&state_path, content)?;
    if !etc_path.exists() {
        // Cannot bind over nothing; write through instead.
        fs::write(&etc_path, content)?;
        return Ok(());
    }
    mount(
        Some(&state_path),
        &etc_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|errno| LifecycleError::Mount {
        target: etc_path,
        fstype: "bind",
        errno,
    })
}

pub fn write_resolv_conf(
    state_dir: &Path,
    dns: &[String],
    etc_was_copied: bool,
) -> Result<(), LifecycleError> {
    let content = generate_resolv_conf(dns);
    install(state_dir, "resolv.conf", &content, etc_was_copied)
}

fn generate_resolv_conf(dns: &[String]) -> String {
    let mut content = String::new();
    for server in dns {
        content.push_str("nameserver ");
        content.push_str(server);
        content.push('\n');
    }
    content
}

pub fn write_etc_hosts(
    state_dir: &Path,
    child_ip: &str,
    etc_was_copied: bool,
) -> Result<(), LifecycleError> {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let content = generate_etc_hosts(child_ip, &hostname);
    install(state_dir, "hosts", &content, etc_was_copied)
}

fn generate_etc_hosts(child_ip: &str, hostname: &str) -> String {
    let mut content = String::from(
        "127.0.0.1\tlocalhost\n\
         ::1\tlocalhost ip6-localhost ip6-loopback\n\
         fe00::0\tip6-localnet\n\
         ff00::0\tip6-mcastprefix\n\
         ff02::1\tip6-allnodes\n\
         ff02::2\tip6-allrouters\n",
    );
    if !hostname.is_empty() {
        let addr = if child_ip.is_empty() {
            "127.0.1.1"
        } else {
            child_ip
        };
        content.push_str(addr);
        content.push('\t');
        content.push_str(hostname);
        content.push('\n');
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolv_conf_content() {
        assert_eq!(
            generate_resolv_conf(&["10.0.2.3".to_string(), "8.8.8.8".to_string()]),
            "nameserver 10.0.2.3\nnameserver 8.8.8.8\n"
        );
        assert_eq!(generate_resolv_conf(&[]), "");
    }

    #[test]
    fn hosts_content() {
        let content = generate_etc_hosts("10.0.2.100", "box");
        assert!(content.contains("127.0.0.1\tlocalhost"));
        assert!(content.ends_with("10.0.2.100\tbox\n"));

        let content = generate_etc_hosts("", "box");
        assert!(content.ends_with("127.0.1.1\tbox\n"));
    }
}
