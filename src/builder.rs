use crate::error::CtlError;
use crate::model::{
    Command, Destination, ForwardMethod, Netmask, Protocol, ServiceAddr, VirtualService,
    DEF_SCHED, SCHED_NAME_MAX,
};
use crate::parse::{self, HostPort};

/// Raw service options as supplied on the command line, before defaults.
#[derive(Debug, Default)]
pub struct ServiceOptions {
    pub scheduler: Option<String>,
    /// Persistence timeout in seconds; `Some` when `-p` was given.
    pub persistent: Option<u32>,
    /// Unparsed `-M` argument. Parsed here because its form depends on the
    /// address family, which is only known once the service spec is folded.
    pub netmask: Option<String>,
    pub one_packet: bool,
}

/// Raw destination options as supplied on the command line.
#[derive(Debug, Default)]
pub struct DestOptions {
    pub fwd: Option<ForwardMethod>,
    pub weight: Option<i32>,
    pub upper_threshold: Option<u32>,
    pub lower_threshold: Option<u32>,
}

/// Fold options into a service record and apply command-scoped defaults.
/// The rules run in a fixed order: persistence and family classification
/// come first because the netmask and port-zero rules depend on them.
pub fn build_service(
    cmd: Command,
    addr: ServiceAddr,
    opts: ServiceOptions,
) -> Result<VirtualService, CtlError> {
    let mut svc = VirtualService::new(addr);

    match opts.scheduler {
        Some(name) => {
            if name.is_empty() || name.len() >= SCHED_NAME_MAX {
                return Err(CtlError::usage(format!(
                    "scheduler name {name:?} must be 1-{} characters",
                    SCHED_NAME_MAX - 1
                )));
            }
            svc.scheduler = name;
        }
        None => {
            if matches!(cmd, Command::Add | Command::Edit) {
                svc.scheduler = DEF_SCHED.to_string();
            }
        }
    }

    if let Some(timeout) = opts.persistent {
        if timeout == 0 {
            return Err(CtlError::usage("illegal persistence timeout 0"));
        }
        svc.persistent = true;
        svc.timeout = timeout;
    }

    if let ServiceAddr::Addr { port: 0, .. } = svc.addr {
        if matches!(cmd, Command::Add | Command::Edit) && !svc.persistent {
            return Err(CtlError::usage(
                "zero port specified for a non-persistent service",
            ));
        }
    }

    svc.one_packet = opts.one_packet;
    if svc.one_packet {
        let udp = svc.addr.protocol() == Some(Protocol::Udp);
        if !udp && !svc.addr.is_fwmark() {
            return Err(CtlError::usage(
                "one-packet scheduling is only valid for UDP or firewall-mark services",
            ));
        }
    }

    // Mark-based IPv6 services always persist on the whole address.
    if let ServiceAddr::FwMark { ipv6: true, .. } = svc.addr {
        svc.netmask = Some(Netmask::Plen(128));
    } else if let Some(raw) = opts.netmask.as_deref() {
        svc.netmask = Some(parse::parse_netmask(raw, svc.addr.is_ipv6())?);
    }

    Ok(svc)
}

/// Fold options into a destination record for the given service. A
/// destination token without a port inherits the service port; an explicit
/// port is preserved unchanged.
pub fn build_dest(
    svc: &VirtualService,
    target: HostPort,
    opts: DestOptions,
) -> Result<Destination, CtlError> {
    let addr = target
        .addr()
        .ok_or_else(|| CtlError::usage("illegal real server address"))?;
    if addr.is_ipv6() != svc.addr.is_ipv6() {
        return Err(CtlError::usage(
            "real server and virtual service address families differ",
        ));
    }

    let port = target.port().unwrap_or_else(|| svc.addr.port());
    let mut dest = Destination::new(addr, port);

    dest.fwd = opts.fwd.unwrap_or(ForwardMethod::DirectRoute);

    match opts.weight {
        Some(weight) if weight < 0 => {
            return Err(CtlError::usage(format!("illegal weight {weight}")));
        }
        Some(weight) => dest.weight = weight,
        None => dest.weight = 1,
    }

    dest.upper_threshold = opts.upper_threshold.unwrap_or(0);
    dest.lower_threshold = opts.lower_threshold.unwrap_or(0);
    if dest.upper_threshold != 0 && dest.lower_threshold > dest.upper_threshold {
        return Err(CtlError::usage(
            "lower connection threshold is higher than the upper threshold",
        ));
    }

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn tcp_service(port: u16) -> ServiceAddr {
        ServiceAddr::Addr {
            protocol: Protocol::Tcp,
            addr: "10.0.0.1".parse().unwrap(),
            port,
        }
    }

    fn udp_service(port: u16) -> ServiceAddr {
        ServiceAddr::Addr {
            protocol: Protocol::Udp,
            addr: "10.0.0.1".parse().unwrap(),
            port,
        }
    }

    #[test]
    fn scheduler_defaults_for_add() {
        let svc = build_service(Command::Add, tcp_service(80), ServiceOptions::default()).unwrap();
        assert_eq!(svc.scheduler, DEF_SCHED);
    }

    #[test]
    fn explicit_scheduler_is_kept() {
        let opts = ServiceOptions {
            scheduler: Some("rr".into()),
            ..Default::default()
        };
        let svc = build_service(Command::Add, tcp_service(80), opts).unwrap();
        assert_eq!(svc.scheduler, "rr");
    }

    #[test]
    fn oversize_scheduler_is_rejected() {
        let opts = ServiceOptions {
            scheduler: Some("x".repeat(SCHED_NAME_MAX)),
            ..Default::default()
        };
        assert!(build_service(Command::Add, tcp_service(80), opts).is_err());
    }

    #[test]
    fn port_zero_requires_persistence() {
        let err = build_service(Command::Add, tcp_service(0), ServiceOptions::default());
        assert!(err.is_err());

        let opts = ServiceOptions {
            persistent: Some(300),
            ..Default::default()
        };
        let svc = build_service(Command::Add, tcp_service(0), opts).unwrap();
        assert!(svc.persistent);
        assert_eq!(svc.timeout, 300);
    }

    #[test]
    fn one_packet_only_for_udp_or_fwmark() {
        let opts = ServiceOptions {
            one_packet: true,
            ..Default::default()
        };
        assert!(build_service(Command::Add, tcp_service(80), opts).is_err());

        let opts = ServiceOptions {
            one_packet: true,
            ..Default::default()
        };
        assert!(build_service(Command::Add, udp_service(53), opts).is_ok());

        let opts = ServiceOptions {
            one_packet: true,
            ..Default::default()
        };
        let mark = ServiceAddr::FwMark {
            mark: 1,
            ipv6: false,
        };
        assert!(build_service(Command::Add, mark, opts).is_ok());
    }

    #[test]
    fn ipv6_fwmark_forces_full_prefix() {
        let opts = ServiceOptions {
            netmask: Some("255.255.255.0".into()),
            ..Default::default()
        };
        let mark = ServiceAddr::FwMark {
            mark: 5,
            ipv6: true,
        };
        let svc = build_service(Command::Add, mark, opts).unwrap();
        assert_eq!(svc.netmask, Some(Netmask::Plen(128)));
    }

    #[test]
    fn netmask_parses_by_family() {
        let opts = ServiceOptions {
            netmask: Some("255.255.255.0".into()),
            ..Default::default()
        };
        let svc = build_service(Command::Add, tcp_service(80), opts).unwrap();
        assert_eq!(
            svc.netmask,
            Some(Netmask::V4("255.255.255.0".parse().unwrap()))
        );
    }

    fn built(port_token: HostPort, opts: DestOptions) -> Result<Destination, CtlError> {
        let svc =
            build_service(Command::Add, tcp_service(80), ServiceOptions::default()).unwrap();
        build_dest(&svc, port_token, opts)
    }

    #[test]
    fn dest_port_mirrors_service_port_when_absent() {
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        let dest = built(HostPort::AddrOnly(addr), DestOptions::default()).unwrap();
        assert_eq!(dest.port, 80);
    }

    #[test]
    fn explicit_dest_port_is_preserved() {
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        let opts = DestOptions {
            fwd: Some(ForwardMethod::DirectRoute),
            ..Default::default()
        };
        let dest = built(HostPort::AddrPort(addr, 8080), opts).unwrap();
        assert_eq!(dest.port, 8080);
        assert_eq!(dest.fwd, ForwardMethod::DirectRoute);
        assert_eq!(dest.weight, 1);
    }

    #[test]
    fn numeric_dest_token_is_rejected() {
        assert!(built(HostPort::None, DestOptions::default()).is_err());
    }

    #[test]
    fn negative_weight_is_rejected() {
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        let opts = DestOptions {
            weight: Some(-1),
            ..Default::default()
        };
        assert!(built(HostPort::AddrOnly(addr), opts).is_err());
    }

    #[test]
    fn zero_weight_quiesces() {
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        let opts = DestOptions {
            weight: Some(0),
            ..Default::default()
        };
        assert_eq!(built(HostPort::AddrOnly(addr), opts).unwrap().weight, 0);
    }

    #[test]
    fn mixed_family_dest_is_rejected() {
        let addr: IpAddr = "2001:db8::2".parse().unwrap();
        assert!(built(HostPort::AddrOnly(addr), DestOptions::default()).is_err());
    }

    #[test]
    fn threshold_ordering_is_checked() {
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        let opts = DestOptions {
            upper_threshold: Some(10),
            lower_threshold: Some(20),
            ..Default::default()
        };
        assert!(built(HostPort::AddrOnly(addr), opts).is_err());

        let opts = DestOptions {
            upper_threshold: Some(0),
            lower_threshold: Some(20),
            ..Default::default()
        };
        assert!(built(HostPort::AddrOnly(addr), opts).is_ok());
    }
}
