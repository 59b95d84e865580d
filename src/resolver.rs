use crate::model::Protocol;
use std::net::{IpAddr, ToSocketAddrs};

/// Host/service name resolution boundary. Lookup failures on output paths
/// degrade to numeric rendering; input paths treat them as parse failures.
pub trait NameResolver {
    fn resolve_host(&self, name: &str) -> Option<IpAddr>;
    fn resolve_addr(&self, addr: IpAddr) -> Option<String>;
    fn resolve_service_port(&self, name: &str, protocol: Protocol) -> Option<u16>;
    fn resolve_port_name(&self, port: u16, protocol: Protocol) -> Option<String>;
}

/// Resolver backed by the system libc (getaddrinfo, getnameinfo and the
/// services database).
#[derive(Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn resolve_host(&self, name: &str) -> Option<IpAddr> {
        let mut addrs = (name, 0u16).to_socket_addrs().ok()?;
        addrs.next().map(|sa| sa.ip())
    }

    fn resolve_addr(&self, addr: IpAddr) -> Option<String> {
        imp::addr_name(addr)
    }

    fn resolve_service_port(&self, name: &str, protocol: Protocol) -> Option<u16> {
        imp::service_port(name, protocol)
    }

    fn resolve_port_name(&self, port: u16, protocol: Protocol) -> Option<String> {
        imp::port_name(port, protocol)
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::ffi::{CStr, CString};
    use std::mem;
    use std::ptr;

    pub fn service_port(name: &str, protocol: Protocol) -> Option<u16> {
        let name = CString::new(name).ok()?;
        let proto = CString::new(protocol.lookup_name()).ok()?;
        // getservbyname hands out a pointer into static libc storage; the
        // process is single-threaded, so reading it without copying is safe.
        let ent = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
        if ent.is_null() {
            return None;
        }
        Some(u16::from_be(unsafe { (*ent).s_port } as u16))
    }

    pub fn port_name(port: u16, protocol: Protocol) -> Option<String> {
        let proto = CString::new(protocol.lookup_name()).ok()?;
        let ent = unsafe { libc::getservbyport(i32::from(port.to_be()), proto.as_ptr()) };
        if ent.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr((*ent).s_name) };
        name.to_str().ok().map(str::to_owned)
    }

    pub fn addr_name(addr: IpAddr) -> Option<String> {
        let mut host = [0 as libc::c_char; 1025];
        let rc = match addr {
            IpAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: 0,
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    libc::getnameinfo(
                        &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                        host.as_mut_ptr(),
                        host.len() as libc::socklen_t,
                        ptr::null_mut(),
                        0,
                        libc::NI_NAMEREQD,
                    )
                }
            }
            IpAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: v6.octets(),
                };
                unsafe {
                    libc::getnameinfo(
                        &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                        host.as_mut_ptr(),
                        host.len() as libc::socklen_t,
                        ptr::null_mut(),
                        0,
                        libc::NI_NAMEREQD,
                    )
                }
            }
        };
        if rc != 0 {
            return None;
        }
        let name = unsafe { CStr::from_ptr(host.as_ptr()) };
        name.to_str().ok().map(str::to_owned)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn service_port(_name: &str, _protocol: Protocol) -> Option<u16> {
        None
    }

    pub fn port_name(_port: u16, _protocol: Protocol) -> Option<String> {
        None
    }

    pub fn addr_name(_addr: IpAddr) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_resolves() {
        let resolver = SystemResolver;
        let addr = resolver.resolve_host("localhost");
        assert!(addr.is_some());
    }

    #[test]
    fn garbage_host_does_not_resolve() {
        let resolver = SystemResolver;
        assert!(resolver
            .resolve_host("no-such-host.invalid.")
            .is_none());
    }
}
