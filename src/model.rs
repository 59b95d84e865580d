use std::net::{IpAddr, Ipv4Addr};

/// Kernel field widths for the bounded strings carried on the wire.
pub const SCHED_NAME_MAX: usize = 16;
pub const MCAST_IFN_MAX: usize = 16;

pub const DEF_SCHED: &str = "wlc";
pub const DEF_MCAST_IFN: &str = "eth0";
pub const DEF_SYNC_ID: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    /// Lower-case name used for service-name lookups.
    pub fn lookup_name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn number(self) -> u16 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    pub fn from_name(name: &str) -> Option<Protocol> {
        match name {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

/// Identity of a virtual service. A service is either address-based
/// (protocol + address + port) or grouped by a firewall mark; the two forms
/// never mix and every consumer can re-derive which one it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAddr {
    Addr {
        protocol: Protocol,
        addr: IpAddr,
        port: u16,
    },
    FwMark {
        mark: u32,
        ipv6: bool,
    },
}

impl ServiceAddr {
    pub fn is_fwmark(&self) -> bool {
        matches!(self, ServiceAddr::FwMark { .. })
    }

    pub fn is_ipv6(&self) -> bool {
        match self {
            ServiceAddr::Addr { addr, .. } => addr.is_ipv6(),
            ServiceAddr::FwMark { ipv6, .. } => *ipv6,
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            ServiceAddr::Addr { protocol, .. } => Some(*protocol),
            ServiceAddr::FwMark { .. } => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ServiceAddr::Addr { port, .. } => *port,
            ServiceAddr::FwMark { .. } => 0,
        }
    }
}

/// Persistence granularity mask. `None` on a service means the host-exact
/// default; an explicitly supplied host-exact mask stays `Some` so that the
/// sentinel wire value never doubles as "not set" in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Netmask {
    V4(Ipv4Addr),
    Plen(u8),
}

impl Netmask {
    pub fn host_exact(ipv6: bool) -> Netmask {
        if ipv6 {
            Netmask::Plen(128)
        } else {
            Netmask::V4(Ipv4Addr::BROADCAST)
        }
    }

    pub fn is_host_exact(&self) -> bool {
        match self {
            Netmask::V4(mask) => *mask == Ipv4Addr::BROADCAST,
            Netmask::Plen(plen) => *plen == 128,
        }
    }
}

/// Traffic counters reported by the kernel. Never sent on the encode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub conns: u64,
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualService {
    pub addr: ServiceAddr,
    pub scheduler: String,
    pub persistent: bool,
    /// Persistence window in seconds; meaningful only when persistent.
    pub timeout: u32,
    pub netmask: Option<Netmask>,
    pub one_packet: bool,
    pub stats: Option<Stats>,
}

impl VirtualService {
    pub fn new(addr: ServiceAddr) -> Self {
        VirtualService {
            addr,
            scheduler: String::new(),
            persistent: false,
            timeout: 0,
            netmask: None,
            one_packet: false,
            stats: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMethod {
    Masq,
    Tunnel,
    DirectRoute,
}

impl ForwardMethod {
    /// Column label used by the kernel listing.
    pub fn name(self) -> &'static str {
        match self {
            ForwardMethod::Masq => "Masq",
            ForwardMethod::Tunnel => "Tunnel",
            ForwardMethod::DirectRoute => "Route",
        }
    }

    pub fn from_name(name: &str) -> Option<ForwardMethod> {
        match name {
            "Masq" => Some(ForwardMethod::Masq),
            "Tunnel" => Some(ForwardMethod::Tunnel),
            "Route" => Some(ForwardMethod::DirectRoute),
            _ => None,
        }
    }

    pub fn rule_flag(self) -> &'static str {
        match self {
            ForwardMethod::Masq => "-m",
            ForwardMethod::Tunnel => "-i",
            ForwardMethod::DirectRoute => "-g",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: IpAddr,
    pub port: u16,
    pub fwd: ForwardMethod,
    pub weight: i32,
    pub upper_threshold: u32,
    pub lower_threshold: u32,
    /// Connection counters, populated on decode only.
    pub active_conns: u32,
    pub inactive_conns: u32,
    pub persistent_conns: u32,
    pub stats: Option<Stats>,
}

impl Destination {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Destination {
            addr,
            port,
            fwd: ForwardMethod::DirectRoute,
            weight: 1,
            upper_threshold: 0,
            lower_threshold: 0,
            active_conns: 0,
            inactive_conns: 0,
            persistent_conns: 0,
            stats: None,
        }
    }
}

/// Connection timeout triple. Overwrite-only: the kernel replaces all three
/// values at once, there is no partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub tcp: u32,
    pub tcp_fin: u32,
    pub udp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonRole {
    Master,
    Backup,
}

impl DaemonRole {
    pub fn name(self) -> &'static str {
        match self {
            DaemonRole::Master => "master",
            DaemonRole::Backup => "backup",
        }
    }

    pub fn state(self) -> i32 {
        match self {
            DaemonRole::Master => 1,
            DaemonRole::Backup => 2,
        }
    }

    pub fn from_state(state: i32) -> Option<DaemonRole> {
        match state {
            1 => Some(DaemonRole::Master),
            2 => Some(DaemonRole::Backup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub role: DaemonRole,
    pub mcast_ifn: String,
    pub sync_id: u8,
}

/// One entry of the kernel connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnEntry {
    pub protocol: Protocol,
    pub client_addr: IpAddr,
    pub client_port: u16,
    pub virt_addr: IpAddr,
    pub virt_port: u16,
    pub dest_addr: IpAddr,
    pub dest_port: u16,
    pub state: String,
    pub expires: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Edit,
    Del,
    Flush,
    List,
    AddDest,
    EditDest,
    DelDest,
    SetTimeout,
    StartDaemon,
    StopDaemon,
    Save,
    Restore,
    Zero,
}

impl Command {
    pub const ALL: [Command; 14] = [
        Command::Add,
        Command::Edit,
        Command::Del,
        Command::Flush,
        Command::List,
        Command::AddDest,
        Command::EditDest,
        Command::DelDest,
        Command::SetTimeout,
        Command::StartDaemon,
        Command::StopDaemon,
        Command::Save,
        Command::Restore,
        Command::Zero,
    ];

    /// Spelling used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Command::Add => "--add-service (-A)",
            Command::Edit => "--edit-service (-E)",
            Command::Del => "--delete-service (-D)",
            Command::Flush => "--clear (-C)",
            Command::List => "--list (-L)",
            Command::AddDest => "--add-server (-a)",
            Command::EditDest => "--edit-server (-e)",
            Command::DelDest => "--delete-server (-d)",
            Command::SetTimeout => "--set",
            Command::StartDaemon => "--start-daemon",
            Command::StopDaemon => "--stop-daemon",
            Command::Save => "--save (-S)",
            Command::Restore => "--restore (-R)",
            Command::Zero => "--zero (-Z)",
        }
    }

    pub fn index(self) -> usize {
        Command::ALL.iter().position(|c| *c == self).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_addr_forms_are_distinguishable() {
        let addr = ServiceAddr::Addr {
            protocol: Protocol::Tcp,
            addr: "10.0.0.1".parse().unwrap(),
            port: 80,
        };
        let mark = ServiceAddr::FwMark {
            mark: 1,
            ipv6: false,
        };
        assert!(!addr.is_fwmark());
        assert!(mark.is_fwmark());
        assert_eq!(mark.protocol(), None);
    }

    #[test]
    fn host_exact_masks() {
        assert!(Netmask::host_exact(false).is_host_exact());
        assert!(Netmask::host_exact(true).is_host_exact());
        assert!(!Netmask::V4("255.255.255.0".parse().unwrap()).is_host_exact());
        assert!(!Netmask::Plen(64).is_host_exact());
    }

    #[test]
    fn daemon_state_round_trips() {
        for role in [DaemonRole::Master, DaemonRole::Backup] {
            assert_eq!(DaemonRole::from_state(role.state()), Some(role));
        }
        assert_eq!(DaemonRole::from_state(0), None);
    }
}
