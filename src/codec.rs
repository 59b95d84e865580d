use crate::error::CtlError;
use crate::model::{
    ConnEntry, DaemonConfig, DaemonRole, Destination, ForwardMethod, Netmask, Protocol,
    ServiceAddr, Stats, Timeouts, VirtualService, MCAST_IFN_MAX, SCHED_NAME_MAX,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Control numbers of the virtual-server sockopt interface. The base and the
/// per-command offsets are a kernel contract and must not drift.
pub const BASE_CTL: i32 = 64 + 1024 + 64;

pub const SET_ADD: i32 = BASE_CTL + 2;
pub const SET_EDIT: i32 = BASE_CTL + 3;
pub const SET_DEL: i32 = BASE_CTL + 4;
pub const SET_FLUSH: i32 = BASE_CTL + 5;
pub const SET_ADD_DEST: i32 = BASE_CTL + 7;
pub const SET_DEL_DEST: i32 = BASE_CTL + 8;
pub const SET_EDIT_DEST: i32 = BASE_CTL + 9;
pub const SET_TIMEOUT: i32 = BASE_CTL + 10;
pub const SET_START_DAEMON: i32 = BASE_CTL + 11;
pub const SET_STOP_DAEMON: i32 = BASE_CTL + 12;
pub const SET_ZERO: i32 = BASE_CTL + 15;

pub const GET_INFO: i32 = BASE_CTL + 2;
pub const GET_TIMEOUT: i32 = BASE_CTL + 7;
pub const GET_DAEMON: i32 = BASE_CTL + 8;

const SVC_F_PERSISTENT: u32 = 0x1;
const SVC_F_ONEPACKET: u32 = 0x4;

const CONN_F_MASQ: u32 = 0;
const CONN_F_TUNNEL: u32 = 2;
const CONN_F_DROUTE: u32 = 3;
const CONN_F_FWD_MASK: u32 = 0x7;

const AF_INET: u16 = libc::AF_INET as u16;
const AF_INET6: u16 = libc::AF_INET6 as u16;

/// Combined service+destination rule record sent with every SET command.
/// Addresses and ports are network order, everything else host order.
///
///  0  u16  address family          44  u32  service flags
///  2  u16  protocol                48  u32  persistence timeout
///  4  [16] virtual address         52  be32 netmask / prefix length
/// 20  be16 virtual port            56  [16] destination address
/// 24  u32  firewall mark           72  be16 destination port
/// 28  [16] scheduler name          76  u32  connection flags
///                                  80  i32  weight
///                                  84  u32  upper threshold
///                                  88  u32  lower threshold
pub const RULE_LEN: usize = 92;
pub const TIMEOUT_LEN: usize = 12;
pub const DAEMON_LEN: usize = 24;
pub const INFO_LEN: usize = 12;

pub fn encode_rule(svc: &VirtualService, dest: Option<&Destination>) -> Vec<u8> {
    let mut buf = vec![0u8; RULE_LEN];
    let af = if svc.addr.is_ipv6() { AF_INET6 } else { AF_INET };
    buf[0..2].copy_from_slice(&af.to_ne_bytes());

    match &svc.addr {
        ServiceAddr::Addr {
            protocol,
            addr,
            port,
        } => {
            buf[2..4].copy_from_slice(&protocol.number().to_ne_bytes());
            put_addr(&mut buf, 4, *addr);
            buf[20..22].copy_from_slice(&port.to_be_bytes());
        }
        ServiceAddr::FwMark { mark, .. } => {
            buf[24..28].copy_from_slice(&mark.to_ne_bytes());
        }
    }

    put_name(&mut buf, 28, SCHED_NAME_MAX, &svc.scheduler);

    let mut flags = 0u32;
    if svc.persistent {
        flags |= SVC_F_PERSISTENT;
    }
    if svc.one_packet {
        flags |= SVC_F_ONEPACKET;
    }
    buf[44..48].copy_from_slice(&flags.to_ne_bytes());
    buf[48..52].copy_from_slice(&svc.timeout.to_ne_bytes());

    let mask = svc
        .netmask
        .unwrap_or_else(|| Netmask::host_exact(svc.addr.is_ipv6()));
    match mask {
        Netmask::V4(mask) => buf[52..56].copy_from_slice(&u32::from(mask).to_be_bytes()),
        Netmask::Plen(plen) => buf[52..56].copy_from_slice(&u32::from(plen).to_ne_bytes()),
    }

    if let Some(dest) = dest {
        put_addr(&mut buf, 56, dest.addr);
        buf[72..74].copy_from_slice(&dest.port.to_be_bytes());
        let conn_flags = match dest.fwd {
            ForwardMethod::Masq => CONN_F_MASQ,
            ForwardMethod::Tunnel => CONN_F_TUNNEL,
            ForwardMethod::DirectRoute => CONN_F_DROUTE,
        } & CONN_F_FWD_MASK;
        buf[76..80].copy_from_slice(&conn_flags.to_ne_bytes());
        buf[80..84].copy_from_slice(&dest.weight.to_ne_bytes());
        buf[84..88].copy_from_slice(&dest.upper_threshold.to_ne_bytes());
        buf[88..92].copy_from_slice(&dest.lower_threshold.to_ne_bytes());
    }

    buf
}

/// All-zero rule used by commands that address the whole table.
pub fn encode_empty_rule() -> Vec<u8> {
    vec![0u8; RULE_LEN]
}

pub fn encode_timeouts(timeouts: &Timeouts) -> Vec<u8> {
    let mut buf = vec![0u8; TIMEOUT_LEN];
    buf[0..4].copy_from_slice(&timeouts.tcp.to_ne_bytes());
    buf[4..8].copy_from_slice(&timeouts.tcp_fin.to_ne_bytes());
    buf[8..12].copy_from_slice(&timeouts.udp.to_ne_bytes());
    buf
}

pub fn decode_timeouts(buf: &[u8]) -> Result<Timeouts, CtlError> {
    if buf.len() < TIMEOUT_LEN {
        return Err(CtlError::Listing("short timeout record".into()));
    }
    Ok(Timeouts {
        tcp: get_u32(buf, 0),
        tcp_fin: get_u32(buf, 4),
        udp: get_u32(buf, 8),
    })
}

pub fn encode_daemon(role: DaemonRole, mcast_ifn: &str, sync_id: u8) -> Vec<u8> {
    let mut buf = vec![0u8; DAEMON_LEN];
    buf[0..4].copy_from_slice(&role.state().to_ne_bytes());
    put_name(&mut buf, 4, MCAST_IFN_MAX, mcast_ifn);
    buf[20..24].copy_from_slice(&i32::from(sync_id).to_ne_bytes());
    buf
}

/// The kernel reports one record per possible role; inactive slots carry a
/// zero state and are skipped.
pub fn decode_daemons(buf: &[u8]) -> Result<Vec<DaemonConfig>, CtlError> {
    if buf.len() % DAEMON_LEN != 0 {
        return Err(CtlError::Listing("short daemon record".into()));
    }
    let mut daemons = Vec::new();
    for chunk in buf.chunks_exact(DAEMON_LEN) {
        let state = i32::from_ne_bytes(chunk[0..4].try_into().unwrap_or_default());
        let Some(role) = DaemonRole::from_state(state) else {
            continue;
        };
        daemons.push(DaemonConfig {
            role,
            mcast_ifn: get_name(chunk, 4, MCAST_IFN_MAX),
            sync_id: get_u32(chunk, 20) as u8,
        });
    }
    Ok(daemons)
}

/// Version and table-size header of the kernel subsystem. The 12-byte wire
/// record also carries a service count, which nothing here needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInfo {
    pub version: u32,
    pub conn_table_size: u32,
}

impl KernelInfo {
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version >> 16,
            (self.version >> 8) & 0xff,
            self.version & 0xff
        )
    }
}

pub fn decode_info(buf: &[u8]) -> Result<KernelInfo, CtlError> {
    if buf.len() < INFO_LEN {
        return Err(CtlError::Listing("short info record".into()));
    }
    Ok(KernelInfo {
        version: get_u32(buf, 0),
        conn_table_size: get_u32(buf, 4),
    })
}

fn put_addr(buf: &mut [u8], off: usize, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf[off..off + 4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => buf[off..off + 16].copy_from_slice(&v6.octets()),
    }
}

fn put_name(buf: &mut [u8], off: usize, max: usize, name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(max - 1);
    buf[off..off + len].copy_from_slice(&bytes[..len]);
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap_or_default())
}

fn get_name(buf: &[u8], off: usize, max: usize) -> String {
    let field = &buf[off..off + max];
    let len = field.iter().position(|b| *b == 0).unwrap_or(max);
    String::from_utf8_lossy(&field[..len]).into_owned()
}

/// One decoded line of the kernel listing.
#[derive(Debug, Clone, PartialEq)]
pub enum ListingLine {
    /// Banner or column-header line; carries no state.
    Header,
    Service(VirtualService),
    Dest(Destination),
    Conn(ConnEntry),
}

/// Decode one line of the kernel's textual listing. The four entry shapes
/// are told apart by their leading token and field count; a line matching
/// none of them is a hard error, silently misreading balancer state is
/// worse than stopping.
pub fn decode_line(line: &str) -> Result<ListingLine, CtlError> {
    let trimmed = line.trim();
    if trimmed.is_empty()
        || line.starts_with("IP Virtual Server")
        || line.starts_with("Prot ")
        || line.starts_with("Pro ")
        || trimmed.starts_with("-> RemoteAddress:Port")
    {
        return Ok(ListingLine::Header);
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let bad = || CtlError::Listing(line.to_string());

    match tokens[0] {
        "->" => decode_dest(&tokens[1..], line).map(ListingLine::Dest),
        "FWM" => decode_fwm_service(&tokens[1..], line).map(ListingLine::Service),
        "TCP" | "UDP" => {
            // A connection entry has nine columns and a bare (or bracketed)
            // client address where a service line carries address:port.
            let conn_shaped = tokens.len() == 9
                && (!tokens[1].contains(':') || tokens[1].ends_with(']'));
            if conn_shaped {
                decode_conn(&tokens, line).map(ListingLine::Conn)
            } else {
                decode_addr_service(&tokens, line).map(ListingLine::Service)
            }
        }
        _ => Err(bad()),
    }
}

fn decode_addr_service(tokens: &[&str], line: &str) -> Result<VirtualService, CtlError> {
    let bad = || CtlError::Listing(line.to_string());
    if tokens.len() < 3 {
        return Err(bad());
    }
    let protocol = Protocol::from_name(tokens[0]).ok_or_else(bad)?;
    let (addr, port) = decode_endpoint(tokens[1]).ok_or_else(bad)?;
    let mut svc = VirtualService::new(ServiceAddr::Addr {
        protocol,
        addr,
        port,
    });
    svc.scheduler = tokens[2].to_string();
    decode_service_tail(&mut svc, &tokens[3..], line)?;
    Ok(svc)
}

fn decode_fwm_service(tokens: &[&str], line: &str) -> Result<VirtualService, CtlError> {
    let bad = || CtlError::Listing(line.to_string());
    if tokens.len() < 2 {
        return Err(bad());
    }
    let mark = u32::from_str_radix(tokens[0], 16).map_err(|_| bad())?;
    let mut rest = &tokens[2..];
    let ipv6 = rest.first() == Some(&"ipv6");
    if ipv6 {
        rest = &rest[1..];
    }
    let mut svc = VirtualService::new(ServiceAddr::FwMark { mark, ipv6 });
    svc.scheduler = tokens[1].to_string();
    decode_service_tail(&mut svc, rest, line)?;
    Ok(svc)
}

fn decode_service_tail(
    svc: &mut VirtualService,
    tokens: &[&str],
    line: &str,
) -> Result<(), CtlError> {
    let bad = || CtlError::Listing(line.to_string());
    let mut rest = tokens;
    if rest.first() == Some(&"ops") {
        svc.one_packet = true;
        rest = &rest[1..];
    }
    if rest.first() == Some(&"persistent") {
        if rest.len() < 3 {
            return Err(bad());
        }
        svc.persistent = true;
        svc.timeout = rest[1].parse().map_err(|_| bad())?;
        svc.netmask = decode_netmask(rest[2], svc.addr.is_ipv6()).ok_or_else(bad)?;
        rest = &rest[3..];
    }
    match rest.len() {
        0 => {}
        5 => svc.stats = Some(decode_stats(rest, line)?),
        _ => return Err(bad()),
    }
    Ok(())
}

fn decode_dest(tokens: &[&str], line: &str) -> Result<Destination, CtlError> {
    let bad = || CtlError::Listing(line.to_string());
    // Base shape, optionally followed by the persistence/threshold detail
    // columns and the counter group.
    if !matches!(tokens.len(), 5 | 8 | 13) {
        return Err(bad());
    }
    let (addr, port) = decode_endpoint(tokens[0]).ok_or_else(bad)?;
    let mut dest = Destination::new(addr, port);
    dest.fwd = ForwardMethod::from_name(tokens[1]).ok_or_else(bad)?;
    dest.weight = tokens[2].parse().map_err(|_| bad())?;
    dest.active_conns = tokens[3].parse().map_err(|_| bad())?;
    dest.inactive_conns = tokens[4].parse().map_err(|_| bad())?;
    if tokens.len() >= 8 {
        dest.persistent_conns = tokens[5].parse().map_err(|_| bad())?;
        dest.upper_threshold = tokens[6].parse().map_err(|_| bad())?;
        dest.lower_threshold = tokens[7].parse().map_err(|_| bad())?;
    }
    if tokens.len() == 13 {
        dest.stats = Some(decode_stats(&tokens[8..], line)?);
    }
    Ok(dest)
}

fn decode_conn(tokens: &[&str], line: &str) -> Result<ConnEntry, CtlError> {
    let bad = || CtlError::Listing(line.to_string());
    let protocol = Protocol::from_name(tokens[0]).ok_or_else(bad)?;
    let client_addr = decode_bare_addr(tokens[1]).ok_or_else(bad)?;
    let client_port = u16::from_str_radix(tokens[2], 16).map_err(|_| bad())?;
    let virt_addr = decode_bare_addr(tokens[3]).ok_or_else(bad)?;
    let virt_port = u16::from_str_radix(tokens[4], 16).map_err(|_| bad())?;
    let dest_addr = decode_bare_addr(tokens[5]).ok_or_else(bad)?;
    let dest_port = u16::from_str_radix(tokens[6], 16).map_err(|_| bad())?;
    Ok(ConnEntry {
        protocol,
        client_addr,
        client_port,
        virt_addr,
        virt_port,
        dest_addr,
        dest_port,
        state: tokens[7].to_string(),
        expires: tokens[8].parse().map_err(|_| bad())?,
    })
}

fn decode_stats(tokens: &[&str], line: &str) -> Result<Stats, CtlError> {
    let bad = || CtlError::Listing(line.to_string());
    Ok(Stats {
        conns: tokens[0].parse().map_err(|_| bad())?,
        in_pkts: tokens[1].parse().map_err(|_| bad())?,
        out_pkts: tokens[2].parse().map_err(|_| bad())?,
        in_bytes: tokens[3].parse().map_err(|_| bad())?,
        out_bytes: tokens[4].parse().map_err(|_| bad())?,
    })
}

/// `C0A80001:0050` or `[v6-literal]:0050`; both the address and the port are
/// hexadecimal by listing convention.
fn decode_endpoint(token: &str) -> Option<(IpAddr, u16)> {
    if let Some(rest) = token.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let addr: Ipv6Addr = host.parse().ok()?;
        let port = u16::from_str_radix(tail.strip_prefix(':')?, 16).ok()?;
        return Some((addr.into(), port));
    }
    let (host, port) = token.rsplit_once(':')?;
    if host.len() != 8 {
        return None;
    }
    let bits = u32::from_str_radix(host, 16).ok()?;
    let port = u16::from_str_radix(port, 16).ok()?;
    Some((Ipv4Addr::from(bits).into(), port))
}

fn decode_bare_addr(token: &str) -> Option<IpAddr> {
    if let Some(rest) = token.strip_prefix('[') {
        let host = rest.strip_suffix(']')?;
        let addr: Ipv6Addr = host.parse().ok()?;
        return Some(addr.into());
    }
    if token.len() != 8 {
        return None;
    }
    let bits = u32::from_str_radix(token, 16).ok()?;
    Some(Ipv4Addr::from(bits).into())
}

/// The listing prints the host-exact sentinel for "no explicit mask"; map it
/// back to the absent form so re-encoding reproduces a fresh record.
fn decode_netmask(token: &str, ipv6: bool) -> Option<Option<Netmask>> {
    let bits = u32::from_str_radix(token, 16).ok()?;
    if ipv6 {
        let plen = u8::try_from(bits).ok().filter(|p| (1..=128).contains(p))?;
        if plen == 128 {
            Some(None)
        } else {
            Some(Some(Netmask::Plen(plen)))
        }
    } else if bits == u32::MAX {
        Some(None)
    } else {
        Some(Some(Netmask::V4(Ipv4Addr::from(bits))))
    }
}
