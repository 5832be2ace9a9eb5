//! Parsing and validation of port specs.

use super::{Family, PortSpec, PortStatus, Proto};
use crate::errors::PortError;
use std::net::IpAddr;

/// Parse a Docker-like textual port spec,
/// e.g. `127.0.0.1:8080:80/tcp` or `[::1]:8080:[::2]:80/udp`.
pub fn parse_port_spec(s: &str) -> Result<PortSpec, PortError> {
    let bad = || PortError::InvalidSpecString(s.to_string());
    let (addr_part, proto_part) = s.rsplit_once('/').ok_or_else(bad)?;
    let proto: Proto = proto_part.parse()?;
    let segments = split_segments(addr_part).ok_or_else(bad)?;

    let (parent_ip, parent_port, child_ip, child_port) = match segments.len() {
        // PARENT_PORT:CHILD_PORT
        2 => (String::new(), &segments[0], String::new(), &segments[1]),
        // Either PARENT_IP:PARENT_PORT:CHILD_PORT or PARENT_PORT:CHILD_IP:CHILD_PORT;
        // a leading run of digits can only be a port.
        3 if is_port_like(&segments[0]) => {
            (String::new(), &segments[0], segments[1].clone(), &segments[2])
        }
        3 => (segments[0].clone(), &segments[1], String::new(), &segments[2]),
        // PARENT_IP:PARENT_PORT:CHILD_IP:CHILD_PORT
        4 => (
            segments[0].clone(),
            &segments[1],
            segments[2].clone(),
            &segments[3],
        ),
        _ => return Err(bad()),
    };

    let spec = PortSpec {
        proto,
        parent_ip: normalize_ip(&parent_ip)?,
        parent_port: parse_port(parent_port)?,
        child_ip: normalize_ip(&child_ip)?,
        child_port: parse_port(child_port)?,
    };
    Ok(spec)
}

fn is_port_like(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_port(s: &str) -> Result<u16, PortError> {
    let n: i64 = s
        .parse()
        .map_err(|_| PortError::InvalidSpecString(s.to_string()))?;
    if !(1..=65535).contains(&n) {
        return Err(PortError::InvalidPort(n));
    }
    Ok(n as u16)
}

fn normalize_ip(s: &str) -> Result<String, PortError> {
    if s.is_empty() {
        return Ok(String::new());
    }
    let ip: IpAddr = s.parse().map_err(|_| PortError::InvalidIp(s.to_string()))?;
    Ok(ip.to_string())
}

/// Split `addr_part` on colons, honoring `[bracketed]` IPv6 segments.
fn split_segments(s: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut rest = s;
    loop {
        if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']')?;
            segments.push(after[..end].to_string());
            rest = &after[end + 1..];
            match rest.strip_prefix(':') {
                Some(after_colon) => rest = after_colon,
                None if rest.is_empty() => break,
                None => return None,
            }
        } else {
            match rest.find(':') {
                Some(i) => {
                    segments.push(rest[..i].to_string());
                    rest = &rest[i + 1..];
                }
                None => {
                    segments.push(rest.to_string());
                    break;
                }
            }
        }
    }
    Some(segments)
}

/// Validate one spec in isolation and against the currently-published set.
pub fn validate_port_spec(spec: &PortSpec, existing: &[PortStatus]) -> Result<(), PortError> {
    if spec.parent_port == 0 {
        return Err(PortError::InvalidPort(0));
    }
    if spec.child_port == 0 {
        return Err(PortError::InvalidPort(0));
    }
    check_family(&spec.parent_ip, spec.parent_ip_addr()?, spec.proto)?;
    check_family(&spec.child_ip, spec.child_ip_addr()?, spec.proto)?;
    for status in existing {
        if specs_conflict(spec, &status.spec)? {
            return Err(PortError::Conflict {
                new: spec.to_string(),
                existing: status.spec.to_string(),
            });
        }
    }
    Ok(())
}

fn check_family(raw: &str, ip: Option<IpAddr>, proto: Proto) -> Result<(), PortError> {
    let matches = match (ip, proto.family()) {
        (None, _) | (_, Family::Dual) => true,
        (Some(IpAddr::V4(_)), family) => family == Family::V4,
        (Some(IpAddr::V6(_)), family) => family == Family::V6,
    };
    if matches {
        Ok(())
    } else {
        Err(PortError::FamilyMismatch {
            ip: raw.to_string(),
            proto: proto.as_str().to_string(),
        })
    }
}

/// Two specs conflict when they share the transport, the parent port, an
/// address family, and their parent addresses overlap. An empty or
/// unspecified parent IP overlaps every address of the same family.
pub fn specs_conflict(a: &PortSpec, b: &PortSpec) -> Result<bool, PortError> {
    if a.proto.base() != b.proto.base() || a.parent_port != b.parent_port {
        return Ok(false);
    }
    if !a.effective_family()?.intersects(b.effective_family()?) {
        return Ok(false);
    }
    let a_ip = a.parent_ip_addr()?;
    let b_ip = b.parent_ip_addr()?;
    Ok(match (a_ip, b_ip) {
        (None, _) | (_, None) => true,
        (Some(a_ip), Some(b_ip)) => {
            a_ip.is_unspecified() || b_ip.is_unspecified() || a_ip == b_ip
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> PortSpec {
        parse_port_spec(s).unwrap()
    }

    fn status(id: i32, s: &str) -> PortStatus {
        PortStatus { id, spec: spec(s) }
    }

    #[test]
    fn parse_forms() {
        let p = spec("127.0.0.1:8080:80/tcp");
        assert_eq!(p.proto, Proto::Tcp);
        assert_eq!(p.parent_ip, "127.0.0.1");
        assert_eq!(p.parent_port, 8080);
        assert_eq!(p.child_ip, "");
        assert_eq!(p.child_port, 80);

        let p = spec("8080:80/tcp");
        assert_eq!(p.parent_ip, "");
        assert_eq!(p.parent_port, 8080);
        assert_eq!(p.child_port, 80);

        let p = spec("[::1]:8080:[::2]:80/udp");
        assert_eq!(p.proto, Proto::Udp);
        assert_eq!(p.parent_ip, "::1");
        assert_eq!(p.child_ip, "::2");

        let p = spec("8080:[::2]:80/tcp6");
        assert_eq!(p.parent_ip, "");
        assert_eq!(p.child_ip, "::2");

        let p = spec("10.0.0.1:53:10.0.2.100:53/udp4");
        assert_eq!(p.parent_ip, "10.0.0.1");
        assert_eq!(p.child_ip, "10.0.2.100");
    }

    #[test]
    fn parse_rejects_garbage() {
        for s in [
            "",
            "80",
            "80/tcp",
            "8080:80",
            "8080:80/bogus",
            "a:b/tcp",
            "1:2:3:4:5/tcp",
            "[::1:8080:80/tcp",
            "999.0.0.1:8080:80/tcp",
        ] {
            assert!(parse_port_spec(s).is_err(), "{:?} should not parse", s);
        }
    }

    #[test]
    fn port_boundaries() {
        assert!(parse_port_spec("1:1/tcp").is_ok());
        assert!(parse_port_spec("65535:65535/tcp").is_ok());
        assert!(matches!(
            parse_port_spec("0:80/tcp"),
            Err(PortError::InvalidPort(0))
        ));
        assert!(matches!(
            parse_port_spec("65536:80/tcp"),
            Err(PortError::InvalidPort(65536))
        ));
        assert!(matches!(
            parse_port_spec("8080:0/tcp"),
            Err(PortError::InvalidPort(0))
        ));
    }

    #[test]
    fn format_parse_roundtrip() {
        for s in [
            "127.0.0.1:8080:80/tcp",
            "8080:80/tcp",
            "[::1]:8080:[::2]:80/udp",
            "8080:[::2]:80/tcp6",
            "10.0.0.1:53:10.0.2.100:53/udp4",
            "1:65535/udp6",
        ] {
            let parsed = spec(s);
            assert_eq!(parse_port_spec(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn family_mismatch_rejected() {
        let p = spec("[::1]:8080:80/tcp4");
        assert!(matches!(
            validate_port_spec(&p, &[]),
            Err(PortError::FamilyMismatch { .. })
        ));
        let p = spec("127.0.0.1:8080:80/udp6");
        assert!(matches!(
            validate_port_spec(&p, &[]),
            Err(PortError::FamilyMismatch { .. })
        ));
    }

    #[test]
    fn wildcard_conflicts_with_concrete() {
        let existing = vec![status(1, "127.0.0.1:19000:90/tcp")];
        let err = validate_port_spec(&spec(":19000:91/tcp"), &existing).unwrap_err();
        assert!(matches!(err, PortError::Conflict { .. }));
    }

    #[test]
    fn unspecified_behaves_as_wildcard() {
        let existing = vec![status(1, "0.0.0.0:19000:90/tcp")];
        let err = validate_port_spec(&spec("127.0.0.1:19000:91/tcp"), &existing).unwrap_err();
        assert!(matches!(err, PortError::Conflict { .. }));
    }

    #[test]
    fn distinct_addresses_coexist() {
        let existing = vec![status(1, "127.0.0.1:19000:90/tcp")];
        validate_port_spec(&spec("127.0.0.2:19000:91/tcp"), &existing).unwrap();
    }

    #[test]
    fn different_transport_coexists() {
        let existing = vec![status(1, "127.0.0.1:19000:90/tcp")];
        validate_port_spec(&spec("127.0.0.1:19000:90/udp"), &existing).unwrap();
    }

    #[test]
    fn different_family_coexists() {
        let existing = vec![status(1, ":19000:90/tcp4")];
        validate_port_spec(&spec(":19000:90/tcp6"), &existing).unwrap();
        // ...but the dual-stack tag overlaps both suffixed families.
        let err = validate_port_spec(&spec(":19000:90/tcp"), &existing).unwrap_err();
        assert!(matches!(err, PortError::Conflict { .. }));
    }

    #[test]
    fn same_spec_conflicts() {
        let existing = vec![status(1, "127.0.0.1:19000:90/tcp")];
        let err = validate_port_spec(&spec("127.0.0.1:19000:95/tcp"), &existing).unwrap_err();
        assert!(matches!(err, PortError::Conflict { .. }));
    }
}
