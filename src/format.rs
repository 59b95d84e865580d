use crate::model::{
    ConnEntry, DaemonConfig, Destination, Netmask, Protocol, ServiceAddr, Timeouts,
    VirtualService,
};
use crate::resolver::NameResolver;
use std::cmp::Ordering;
use std::net::IpAddr;

/// Output-shaping options for the lister.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    pub numeric: bool,
    pub rule: bool,
    pub stats: bool,
    pub rate: bool,
    pub thresholds: bool,
    pub persistent_conn: bool,
    pub exact: bool,
    pub no_sort: bool,
}

pub fn banner(version: &str, conn_table_size: u32) -> String {
    format!("IP Virtual Server version {version} (size={conn_table_size})")
}

pub fn table_header(fopts: &FormatOptions) -> &'static str {
    if fopts.stats {
        "Prot LocalAddress:Port               Conns   InPkts  OutPkts  InBytes OutBytes\n  -> RemoteAddress:Port"
    } else if fopts.rate {
        "Prot LocalAddress:Port                 CPS    InPPS   OutPPS    InBPS   OutBPS\n  -> RemoteAddress:Port"
    } else if fopts.thresholds {
        "Prot LocalAddress:Port            Uthreshold Lthreshold ActiveConn InActConn\n  -> RemoteAddress:Port"
    } else if fopts.persistent_conn {
        "Prot LocalAddress:Port            Weight    PersistConn ActiveConn InActConn\n  -> RemoteAddress:Port"
    } else {
        "Prot LocalAddress:Port Scheduler Flags\n  -> RemoteAddress:Port           Forward Weight ActiveConn InActConn"
    }
}

pub const CONN_HEADER: &str =
    "IPVS connection entries\npro expire state       source             virtual            destination";

/// Render one service line. In rule syntax the output re-parses into an
/// equal record; in table form wide counters are abbreviated unless exact
/// output was requested.
pub fn format_service(
    svc: &VirtualService,
    fopts: &FormatOptions,
    resolver: &dyn NameResolver,
) -> String {
    if fopts.rule {
        return service_rule(svc, fopts.numeric, resolver);
    }

    let (proto_name, ep) = match &svc.addr {
        ServiceAddr::Addr {
            protocol,
            addr,
            port,
        } => (
            protocol.name(),
            endpoint(*addr, *port, Some(*protocol), fopts, resolver),
        ),
        ServiceAddr::FwMark { mark, ipv6 } => {
            let suffix = if *ipv6 { " IPv6" } else { "" };
            ("FWM", format!("{mark}{suffix}"))
        }
    };

    if fopts.stats || fopts.rate {
        let stats = svc.stats.unwrap_or_default();
        return format!(
            "{:<4} {} {:>8} {:>8} {:>8} {:>8} {:>8}",
            proto_name,
            fit(&ep, 27, !svc.addr.is_ipv6()),
            human_count(stats.conns, fopts.exact),
            human_count(stats.in_pkts, fopts.exact),
            human_count(stats.out_pkts, fopts.exact),
            human_count(stats.in_bytes, fopts.exact),
            human_count(stats.out_bytes, fopts.exact),
        );
    }

    let mut line = format!("{:<4} {} {}", proto_name, ep, svc.scheduler);
    if svc.one_packet {
        line.push_str(" ops");
    }
    if svc.persistent {
        line.push_str(&format!(" persistent {}", svc.timeout));
        if let Some(mask) = svc.netmask.filter(|m| !m.is_host_exact()) {
            line.push_str(&format!(" mask {}", netmask_text(mask)));
        }
    }
    line
}

/// Render one indented destination line under its service.
pub fn format_dest(
    svc: &VirtualService,
    dest: &Destination,
    fopts: &FormatOptions,
    resolver: &dyn NameResolver,
) -> String {
    if fopts.rule {
        return dest_rule(svc, dest, fopts.numeric, resolver);
    }

    let proto = svc.addr.protocol();
    let ep = endpoint(dest.addr, dest.port, proto, fopts, resolver);
    let truncate = !dest.addr.is_ipv6();

    if fopts.stats || fopts.rate {
        let stats = dest.stats.unwrap_or_default();
        return format!(
            "  -> {} {:>8} {:>8} {:>8} {:>8} {:>8}",
            fit(&ep, 28, truncate),
            human_count(stats.conns, fopts.exact),
            human_count(stats.in_pkts, fopts.exact),
            human_count(stats.out_pkts, fopts.exact),
            human_count(stats.in_bytes, fopts.exact),
            human_count(stats.out_bytes, fopts.exact),
        );
    }
    if fopts.thresholds {
        return format!(
            "  -> {} {:<10} {:<10} {:<10} {:<10}",
            fit(&ep, 28, truncate),
            dest.upper_threshold,
            dest.lower_threshold,
            dest.active_conns,
            dest.inactive_conns,
        );
    }
    if fopts.persistent_conn {
        return format!(
            "  -> {} {:<9} {:<11} {:<10} {:<10}",
            fit(&ep, 28, truncate),
            dest.weight,
            dest.persistent_conns,
            dest.active_conns,
            dest.inactive_conns,
        );
    }
    format!(
        "  -> {} {:<7} {:<6} {:<10} {:<10}",
        fit(&ep, 28, truncate),
        dest.fwd.name(),
        dest.weight,
        dest.active_conns,
        dest.inactive_conns,
    )
}

pub fn format_conn(entry: &ConnEntry, fopts: &FormatOptions, resolver: &dyn NameResolver) -> String {
    let proto = Some(entry.protocol);
    format!(
        "{:<3} {:02}:{:02}  {:<11} {:<18} {:<18} {}",
        entry.protocol.name(),
        entry.expires / 60,
        entry.expires % 60,
        entry.state,
        endpoint(entry.client_addr, entry.client_port, proto, fopts, resolver),
        endpoint(entry.virt_addr, entry.virt_port, proto, fopts, resolver),
        endpoint(entry.dest_addr, entry.dest_port, proto, fopts, resolver),
    )
}

pub fn format_timeouts(timeouts: &Timeouts) -> String {
    format!(
        "Timeout (tcp tcpfin udp): {} {} {}",
        timeouts.tcp, timeouts.tcp_fin, timeouts.udp
    )
}

pub fn format_daemon(daemon: &DaemonConfig) -> String {
    format!(
        "{} sync daemon (mcast={}, syncid={})",
        daemon.role.name(),
        daemon.mcast_ifn,
        daemon.sync_id
    )
}

fn service_rule(svc: &VirtualService, numeric: bool, resolver: &dyn NameResolver) -> String {
    let mut out = String::from("-A");
    out.push_str(&service_spec(svc, numeric, resolver));
    out.push_str(&format!(" -s {}", svc.scheduler));
    if svc.persistent {
        out.push_str(&format!(" -p {}", svc.timeout));
    }
    // The host-exact mask is the default the builder re-creates, so it is
    // left implicit; anything else must survive the round trip.
    if let Some(mask) = svc.netmask.filter(|m| !m.is_host_exact()) {
        out.push_str(&format!(" -M {}", netmask_text(mask)));
    }
    if svc.one_packet {
        out.push_str(" -o");
    }
    out
}

fn dest_rule(
    svc: &VirtualService,
    dest: &Destination,
    numeric: bool,
    resolver: &dyn NameResolver,
) -> String {
    let fopts = FormatOptions {
        numeric,
        ..Default::default()
    };
    let mut out = String::from("-a");
    out.push_str(&service_spec(svc, numeric, resolver));
    out.push_str(&format!(
        " -r {} {} -w {}",
        endpoint(dest.addr, dest.port, svc.addr.protocol(), &fopts, resolver),
        dest.fwd.rule_flag(),
        dest.weight
    ));
    if dest.upper_threshold != 0 {
        out.push_str(&format!(" -x {}", dest.upper_threshold));
    }
    if dest.lower_threshold != 0 {
        out.push_str(&format!(" -y {}", dest.lower_threshold));
    }
    out
}

fn service_spec(svc: &VirtualService, numeric: bool, resolver: &dyn NameResolver) -> String {
    let fopts = FormatOptions {
        numeric,
        ..Default::default()
    };
    match &svc.addr {
        ServiceAddr::Addr {
            protocol,
            addr,
            port,
        } => {
            let flag = match protocol {
                Protocol::Tcp => "-t",
                Protocol::Udp => "-u",
            };
            format!(
                " {flag} {}",
                endpoint(*addr, *port, Some(*protocol), &fopts, resolver)
            )
        }
        ServiceAddr::FwMark { mark, ipv6 } => {
            let suffix = if *ipv6 { " -6" } else { "" };
            format!(" -f {mark}{suffix}")
        }
    }
}

fn netmask_text(mask: Netmask) -> String {
    match mask {
        Netmask::V4(mask) => mask.to_string(),
        Netmask::Plen(plen) => plen.to_string(),
    }
}

/// `addr:port` with optional name lookups. Lookup failures fall back to the
/// numeric form, they never fail the listing.
fn endpoint(
    addr: IpAddr,
    port: u16,
    protocol: Option<Protocol>,
    fopts: &FormatOptions,
    resolver: &dyn NameResolver,
) -> String {
    let host = if fopts.numeric {
        None
    } else {
        resolver.resolve_addr(addr)
    };
    let host = match host {
        Some(name) => name,
        None => match addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        },
    };
    let port_name = match (fopts.numeric, protocol) {
        (false, Some(protocol)) => resolver.resolve_port_name(port, protocol),
        _ => None,
    };
    match port_name {
        Some(name) => format!("{host}:{name}"),
        None => format!("{host}:{port}"),
    }
}

/// Pad to the column width; plain IPv4 columns also truncate so that the
/// fixed table stays aligned. IPv6 and rule output never truncate.
fn fit(s: &str, width: usize, truncate: bool) -> String {
    if truncate && s.len() > width {
        s[..width].to_string()
    } else {
        format!("{s:<width$}")
    }
}

/// Abbreviate a counter with K/M/G/T suffixes unless exact output was asked
/// for.
fn human_count(n: u64, exact: bool) -> String {
    if exact || n < 1_000 {
        return n.to_string();
    }
    let (divisor, suffix) = if n < 1_000_000 {
        (1_000f64, "K")
    } else if n < 1_000_000_000 {
        (1_000_000f64, "M")
    } else if n < 1_000_000_000_000 {
        (1_000_000_000f64, "G")
    } else {
        (1_000_000_000_000f64, "T")
    };
    let value = n as f64 / divisor;
    if value < 100.0 {
        format!("{value:.1}{suffix}")
    } else {
        format!("{value:.0}{suffix}")
    }
}

/// Stable service order: address-based entries by protocol, address and
/// port; mark-based entries afterwards by mark.
pub fn sort_services(entries: &mut [(VirtualService, Vec<Destination>)]) {
    entries.sort_by(|(a, _), (b, _)| service_cmp(&a.addr, &b.addr));
    for (_, dests) in entries.iter_mut() {
        sort_dests(dests);
    }
}

pub fn sort_dests(dests: &mut [Destination]) {
    dests.sort_by(|a, b| a.addr.cmp(&b.addr).then(a.port.cmp(&b.port)));
}

fn service_cmp(a: &ServiceAddr, b: &ServiceAddr) -> Ordering {
    match (a, b) {
        (
            ServiceAddr::Addr {
                protocol: pa,
                addr: aa,
                port: na,
            },
            ServiceAddr::Addr {
                protocol: pb,
                addr: ab,
                port: nb,
            },
        ) => pa.cmp(pb).then(aa.cmp(ab)).then(na.cmp(nb)),
        (ServiceAddr::Addr { .. }, ServiceAddr::FwMark { .. }) => Ordering::Less,
        (ServiceAddr::FwMark { .. }, ServiceAddr::Addr { .. }) => Ordering::Greater,
        (ServiceAddr::FwMark { mark: ma, .. }, ServiceAddr::FwMark { mark: mb, .. }) => ma.cmp(mb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, ForwardMethod, Protocol};

    struct Numeric;

    impl NameResolver for Numeric {
        fn resolve_host(&self, _name: &str) -> Option<IpAddr> {
            None
        }
        fn resolve_addr(&self, _addr: IpAddr) -> Option<String> {
            None
        }
        fn resolve_service_port(&self, _name: &str, _protocol: Protocol) -> Option<u16> {
            None
        }
        fn resolve_port_name(&self, _port: u16, _protocol: Protocol) -> Option<String> {
            None
        }
    }

    fn persistent_service() -> VirtualService {
        let mut svc = VirtualService::new(ServiceAddr::Addr {
            protocol: Protocol::Tcp,
            addr: "192.168.0.1".parse().unwrap(),
            port: 80,
        });
        svc.scheduler = "rr".into();
        svc.persistent = true;
        svc.timeout = 120;
        svc
    }

    #[test]
    fn rule_output_matches_save_format() {
        let fopts = FormatOptions {
            rule: true,
            numeric: true,
            ..Default::default()
        };
        let line = format_service(&persistent_service(), &fopts, &Numeric);
        assert_eq!(line, "-A -t 192.168.0.1:80 -s rr -p 120");
    }

    #[test]
    fn rule_output_keeps_explicit_netmask() {
        let mut svc = persistent_service();
        svc.netmask = Some(Netmask::V4("255.255.255.0".parse().unwrap()));
        let fopts = FormatOptions {
            rule: true,
            numeric: true,
            ..Default::default()
        };
        let line = format_service(&svc, &fopts, &Numeric);
        assert_eq!(line, "-A -t 192.168.0.1:80 -s rr -p 120 -M 255.255.255.0");
    }

    #[test]
    fn rule_output_for_ipv6_fwmark() {
        let mut svc = VirtualService::new(ServiceAddr::FwMark {
            mark: 5,
            ipv6: true,
        });
        svc.scheduler = "wlc".into();
        svc.netmask = Some(Netmask::Plen(128));
        let fopts = FormatOptions {
            rule: true,
            numeric: true,
            ..Default::default()
        };
        assert_eq!(format_service(&svc, &fopts, &Numeric), "-A -f 5 -6 -s wlc");
    }

    #[test]
    fn dest_rule_includes_forward_and_weight() {
        let svc = persistent_service();
        let mut dest = Destination::new("10.0.0.2".parse().unwrap(), 8080);
        dest.fwd = ForwardMethod::Masq;
        dest.weight = 3;
        let fopts = FormatOptions {
            rule: true,
            numeric: true,
            ..Default::default()
        };
        assert_eq!(
            format_dest(&svc, &dest, &fopts, &Numeric),
            "-a -t 192.168.0.1:80 -r 10.0.0.2:8080 -m -w 3"
        );
    }

    #[test]
    fn dest_rule_emits_nonzero_thresholds() {
        let svc = persistent_service();
        let mut dest = Destination::new("10.0.0.2".parse().unwrap(), 80);
        dest.upper_threshold = 1000;
        dest.lower_threshold = 700;
        let fopts = FormatOptions {
            rule: true,
            numeric: true,
            ..Default::default()
        };
        assert_eq!(
            format_dest(&svc, &dest, &fopts, &Numeric),
            "-a -t 192.168.0.1:80 -r 10.0.0.2:80 -g -w 1 -x 1000 -y 700"
        );
    }

    #[test]
    fn formatting_is_idempotent() {
        let fopts = FormatOptions::default();
        let svc = persistent_service();
        let first = format_service(&svc, &fopts, &Numeric);
        let second = format_service(&svc, &fopts, &Numeric);
        assert_eq!(first, second);
    }

    #[test]
    fn table_line_shows_persistence() {
        let fopts = FormatOptions {
            numeric: true,
            ..Default::default()
        };
        let line = format_service(&persistent_service(), &fopts, &Numeric);
        assert_eq!(line, "TCP  192.168.0.1:80 rr persistent 120");
    }

    #[test]
    fn counters_abbreviate_unless_exact() {
        assert_eq!(human_count(999, false), "999");
        assert_eq!(human_count(1_500, false), "1.5K");
        assert_eq!(human_count(2_300_000, false), "2.3M");
        assert_eq!(human_count(5_000_000_000, false), "5.0G");
        assert_eq!(human_count(7_200_000_000_000, false), "7.2T");
        assert_eq!(human_count(7_200_000_000_000, true), "7200000000000");
    }

    #[test]
    fn ipv6_endpoints_are_not_truncated() {
        let long = "[2001:db8:aaaa:bbbb:cccc:dddd:eeee:1]:65535";
        assert_eq!(fit(long, 28, false), long);
        assert_eq!(fit("10.0.0.1:80", 4, true), "10.0");
    }

    #[test]
    fn services_sort_stably() {
        let mk = |addr: ServiceAddr| (VirtualService::new(addr), Vec::new());
        let mut entries = vec![
            mk(ServiceAddr::FwMark {
                mark: 2,
                ipv6: false,
            }),
            mk(ServiceAddr::Addr {
                protocol: Protocol::Udp,
                addr: "10.0.0.1".parse().unwrap(),
                port: 53,
            }),
            mk(ServiceAddr::FwMark {
                mark: 1,
                ipv6: false,
            }),
            mk(ServiceAddr::Addr {
                protocol: Protocol::Tcp,
                addr: "10.0.0.1".parse().unwrap(),
                port: 443,
            }),
            mk(ServiceAddr::Addr {
                protocol: Protocol::Tcp,
                addr: "10.0.0.1".parse().unwrap(),
                port: 80,
            }),
        ];
        sort_services(&mut entries);
        let ports: Vec<u16> = entries.iter().map(|(svc, _)| svc.addr.port()).collect();
        assert_eq!(ports, vec![80, 443, 53, 0, 0]);
        assert!(matches!(
            entries[3].0.addr,
            ServiceAddr::FwMark { mark: 1, .. }
        ));
    }

    #[test]
    fn dests_sort_by_addr_then_port() {
        let mut dests = vec![
            Destination::new("10.0.0.3".parse().unwrap(), 80),
            Destination::new("10.0.0.2".parse().unwrap(), 90),
            Destination::new("10.0.0.2".parse().unwrap(), 80),
        ];
        sort_dests(&mut dests);
        assert_eq!(dests[0].port, 80);
        assert_eq!(dests[0].addr, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(dests[2].addr, "10.0.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn conn_lines_render_expiry_clock() {
        let entry = ConnEntry {
            protocol: Protocol::Tcp,
            client_addr: "192.168.0.1".parse().unwrap(),
            client_port: 443,
            virt_addr: "192.168.0.2".parse().unwrap(),
            virt_port: 80,
            dest_addr: "10.0.0.1".parse().unwrap(),
            dest_port: 80,
            state: "ESTABLISHED".into(),
            expires: 117,
        };
        let fopts = FormatOptions {
            numeric: true,
            ..Default::default()
        };
        let line = format_conn(&entry, &fopts, &Numeric);
        assert!(line.starts_with("TCP 01:57  ESTABLISHED"));
        assert!(line.contains("192.168.0.1:443"));
    }
}
