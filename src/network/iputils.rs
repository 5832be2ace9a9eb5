//! Small IPv4 helpers for subnet address plans.

use crate::errors::NetworkError;
use std::net::Ipv4Addr;

/// `ip + offset`, failing instead of wrapping.
pub fn add_ip_int(ip: Ipv4Addr, offset: u32) -> Result<Ipv4Addr, NetworkError> {
    u32::from(ip)
        .checked_add(offset)
        .map(Ipv4Addr::from)
        .ok_or(NetworkError::AddressOverflow { ip, offset })
}

/// Parse `a.b.c.d/len`, requiring a network address (no host bits set).
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8), NetworkError> {
    let invalid = || NetworkError::InvalidCidr(s.to_string());
    let (addr, len) = s.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let len: u8 = len.parse().map_err(|_| invalid())?;
    if len > 32 {
        return Err(invalid());
    }
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    if u32::from(addr) & !mask != 0 {
        return Err(invalid());
    }
    Ok((addr, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition() {
        assert_eq!(
            add_ip_int(Ipv4Addr::new(10, 0, 2, 0), 100).unwrap(),
            Ipv4Addr::new(10, 0, 2, 100)
        );
        assert_eq!(
            add_ip_int(Ipv4Addr::new(255, 255, 255, 100), 155).unwrap(),
            Ipv4Addr::new(255, 255, 255, 255)
        );
        assert!(add_ip_int(Ipv4Addr::new(255, 255, 255, 100), 156).is_err());
    }

    #[test]
    fn cidr_parsing() {
        assert_eq!(
            parse_cidr("10.0.2.0/24").unwrap(),
            (Ipv4Addr::new(10, 0, 2, 0), 24)
        );
        assert_eq!(parse_cidr("0.0.0.0/0").unwrap(), (Ipv4Addr::UNSPECIFIED, 0));
        // host bits must be zero
        assert!(parse_cidr("10.0.2.100/24").is_err());
        assert!(parse_cidr("10.0.2.0/33").is_err());
        assert!(parse_cidr("10.0.2.0").is_err());
        assert!(parse_cidr("bogus/24").is_err());
    }
}
