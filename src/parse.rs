use crate::error::CtlError;
use crate::model::{Netmask, Protocol};
use crate::resolver::NameResolver;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Outcome of parsing a `host[:port]` token. Callers use the distinction to
/// decide whether a missing port should be filled in from the paired
/// service endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPort {
    /// The token cannot name a host here (e.g. it is all digits, which is
    /// reserved for firewall marks).
    None,
    AddrOnly(IpAddr),
    AddrPort(IpAddr, u16),
}

impl HostPort {
    pub fn addr(self) -> Option<IpAddr> {
        match self {
            HostPort::None => None,
            HostPort::AddrOnly(addr) | HostPort::AddrPort(addr, _) => Some(addr),
        }
    }

    pub fn port(self) -> Option<u16> {
        match self {
            HostPort::AddrPort(_, port) => Some(port),
            _ => None,
        }
    }
}

/// Parse `host`, `host:port` or `[v6-host]:port`. A token consisting only of
/// digits is never treated as a host: digits name firewall marks, and the
/// caller decides whether a mark is acceptable in this position.
pub fn parse_host_port(
    token: &str,
    protocol: Protocol,
    resolver: &dyn NameResolver,
) -> Result<HostPort, CtlError> {
    if token.is_empty() {
        return Err(CtlError::usage("empty address"));
    }
    if token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(HostPort::None);
    }
    if let Some(rest) = token.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| CtlError::usage(format!("missing ']' in address {token:?}")))?;
        let addr: Ipv6Addr = host
            .parse()
            .map_err(|_| CtlError::usage(format!("invalid IPv6 address {host:?}")))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok(HostPort::AddrPort(
                addr.into(),
                parse_port(port, protocol, resolver)?,
            )),
            None if tail.is_empty() => Ok(HostPort::AddrOnly(addr.into())),
            _ => Err(CtlError::usage(format!(
                "trailing garbage after ']' in {token:?}"
            ))),
        };
    }
    // A bare IPv6 literal contains colons of its own; only bracketed tokens
    // carry a port for that family.
    if let Ok(v6) = token.parse::<Ipv6Addr>() {
        return Ok(HostPort::AddrOnly(v6.into()));
    }
    match token.rsplit_once(':') {
        Some((host, port)) => {
            let addr = parse_host(host, resolver)?;
            Ok(HostPort::AddrPort(
                addr,
                parse_port(port, protocol, resolver)?,
            ))
        }
        None => Ok(HostPort::AddrOnly(parse_host(token, resolver)?)),
    }
}

fn parse_host(host: &str, resolver: &dyn NameResolver) -> Result<IpAddr, CtlError> {
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return Ok(v4.into());
    }
    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        return Ok(v6.into());
    }
    resolver
        .resolve_host(host)
        .ok_or_else(|| CtlError::usage(format!("host {host:?} not found")))
}

fn parse_port(
    port: &str,
    protocol: Protocol,
    resolver: &dyn NameResolver,
) -> Result<u16, CtlError> {
    if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
        return port
            .parse::<u16>()
            .map_err(|_| CtlError::usage(format!("port {port:?} out of range")));
    }
    resolver
        .resolve_service_port(port, protocol)
        .ok_or_else(|| {
            CtlError::usage(format!(
                "unknown {} service {port:?}",
                protocol.lookup_name()
            ))
        })
}

pub fn parse_fwmark(token: &str) -> Result<u32, CtlError> {
    let mark = token
        .parse::<u32>()
        .map_err(|_| CtlError::usage(format!("illegal firewall mark {token:?}")))?;
    if mark == 0 {
        return Err(CtlError::usage("firewall mark must not be 0"));
    }
    Ok(mark)
}

/// Parse a persistence netmask: dotted quad for IPv4 services, a prefix
/// length 1-128 for IPv6 ones.
pub fn parse_netmask(token: &str, ipv6: bool) -> Result<Netmask, CtlError> {
    if ipv6 {
        let plen = token
            .parse::<u8>()
            .ok()
            .filter(|p| (1..=128).contains(p))
            .ok_or_else(|| {
                CtlError::usage(format!("IPv6 netmask must be a prefix length 1-128, got {token:?}"))
            })?;
        Ok(Netmask::Plen(plen))
    } else {
        let mask: Ipv4Addr = token
            .parse()
            .map_err(|_| CtlError::usage(format!("invalid netmask {token:?}")))?;
        ipnet::ipv4_mask_to_prefix(mask)
            .map_err(|_| CtlError::usage(format!("netmask {mask} is not contiguous")))?;
        Ok(Netmask::V4(mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    struct StaticResolver;

    impl NameResolver for StaticResolver {
        fn resolve_host(&self, name: &str) -> Option<IpAddr> {
            match name {
                "web1" => Some("10.0.0.2".parse().unwrap()),
                _ => None,
            }
        }

        fn resolve_addr(&self, _addr: IpAddr) -> Option<String> {
            None
        }

        fn resolve_service_port(&self, name: &str, _protocol: Protocol) -> Option<u16> {
            match name {
                "http" => Some(80),
                _ => None,
            }
        }

        fn resolve_port_name(&self, _port: u16, _protocol: Protocol) -> Option<String> {
            None
        }
    }

    fn parse(token: &str) -> Result<HostPort, CtlError> {
        parse_host_port(token, Protocol::Tcp, &StaticResolver)
    }

    #[test]
    fn digits_are_never_a_host() {
        assert_eq!(parse("5").unwrap(), HostPort::None);
        assert_eq!(parse("80").unwrap(), HostPort::None);
    }

    #[test]
    fn addr_with_port() {
        assert_eq!(
            parse("10.0.0.1:80").unwrap(),
            HostPort::AddrPort("10.0.0.1".parse().unwrap(), 80)
        );
    }

    #[test]
    fn addr_without_port() {
        assert_eq!(
            parse("10.0.0.1").unwrap(),
            HostPort::AddrOnly("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn bracketed_ipv6_with_port() {
        assert_eq!(
            parse("[2001:db8::1]:80").unwrap(),
            HostPort::AddrPort("2001:db8::1".parse().unwrap(), 80)
        );
    }

    #[test]
    fn bare_ipv6_literal_has_no_port() {
        assert_eq!(
            parse("2001:db8::1").unwrap(),
            HostPort::AddrOnly("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn named_host_and_service() {
        assert_eq!(
            parse("web1:http").unwrap(),
            HostPort::AddrPort("10.0.0.2".parse().unwrap(), 80)
        );
    }

    #[test]
    fn unknown_host_is_a_hard_failure() {
        assert!(parse("nosuch:80").is_err());
    }

    #[test]
    fn unknown_service_is_a_hard_failure() {
        assert!(parse("10.0.0.1:nosuch").is_err());
    }

    #[test]
    fn port_out_of_range() {
        assert!(parse("10.0.0.1:65536").is_err());
        assert_eq!(
            parse("10.0.0.1:0").unwrap(),
            HostPort::AddrPort("10.0.0.1".parse().unwrap(), 0)
        );
    }

    #[test]
    fn fwmark_rejects_zero_and_text() {
        assert_eq!(parse_fwmark("5").unwrap(), 5);
        assert!(parse_fwmark("0").is_err());
        assert!(parse_fwmark("x").is_err());
    }

    #[test]
    fn netmask_forms() {
        assert_eq!(
            parse_netmask("255.255.255.0", false).unwrap(),
            Netmask::V4("255.255.255.0".parse().unwrap())
        );
        assert!(parse_netmask("255.0.255.0", false).is_err());
        assert_eq!(parse_netmask("64", true).unwrap(), Netmask::Plen(64));
        assert!(parse_netmask("0", true).is_err());
        assert!(parse_netmask("129", true).is_err());
    }
}
