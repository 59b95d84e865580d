mod builder;
mod codec;
mod compat;
mod control;
mod error;
mod format;
mod model;
mod parse;
mod resolver;

use anyhow::{Context, Result};
use builder::{DestOptions, ServiceOptions};
use clap::{Parser, ValueEnum};
use codec::ListingLine;
use compat::{Opt, OptSet};
use error::CtlError;
use format::FormatOptions;
use model::{
    Command, DaemonRole, Destination, ForwardMethod, Protocol, ServiceAddr, Timeouts,
    VirtualService, DEF_MCAST_IFN, DEF_SYNC_ID, MCAST_IFN_MAX,
};
use resolver::{NameResolver, SystemResolver};
use std::io::{self, BufRead};
use std::process::ExitCode;

/// Command-line surface. clap only tokenizes; which option combinations are
/// legal for which command is decided by the compatibility table in
/// `compat.rs` after folding.
#[derive(Parser, Debug)]
#[command(
    name = "ipvsctl",
    version,
    about = "administration tool for the kernel IP virtual server table"
)]
struct Args {
    /// Add a virtual service
    #[arg(short = 'A', long = "add-service")]
    add_service: bool,
    /// Edit a virtual service
    #[arg(short = 'E', long = "edit-service")]
    edit_service: bool,
    /// Delete a virtual service
    #[arg(short = 'D', long = "delete-service")]
    delete_service: bool,
    /// Clear the whole table
    #[arg(short = 'C', long = "clear")]
    clear: bool,
    /// List the table
    #[arg(short = 'L', long = "list", short_alias = 'l')]
    list: bool,
    /// Add a real server to a service
    #[arg(short = 'a', long = "add-server")]
    add_server: bool,
    /// Edit a real server
    #[arg(short = 'e', long = "edit-server")]
    edit_server: bool,
    /// Delete a real server
    #[arg(short = 'd', long = "delete-server")]
    delete_server: bool,
    /// Set connection timeout values (tcp, tcpfin, udp)
    #[arg(long = "set", num_args = 3, value_names = ["TCP", "TCPFIN", "UDP"])]
    set: Option<Vec<u32>>,
    /// Start the connection sync daemon in the given role
    #[arg(long = "start-daemon", value_enum, value_name = "ROLE")]
    start_daemon: Option<RoleArg>,
    /// Stop the connection sync daemon in the given role
    #[arg(long = "stop-daemon", value_enum, value_name = "ROLE")]
    stop_daemon: Option<RoleArg>,
    /// Dump the table in rule syntax
    #[arg(short = 'S', long = "save")]
    save: bool,
    /// Restore rules read from standard input
    #[arg(short = 'R', long = "restore")]
    restore: bool,
    /// Zero the counters of a service, or of the whole table
    #[arg(short = 'Z', long = "zero")]
    zero: bool,

    /// TCP virtual service (host[:port])
    #[arg(short = 't', long = "tcp-service", value_name = "ADDR")]
    tcp_service: Option<String>,
    /// UDP virtual service (host[:port])
    #[arg(short = 'u', long = "udp-service", value_name = "ADDR")]
    udp_service: Option<String>,
    /// Firewall-mark virtual service
    #[arg(short = 'f', long = "fwmark-service", value_name = "MARK")]
    fwmark_service: Option<String>,
    /// The firewall-mark service groups IPv6 traffic
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,
    /// Scheduling algorithm
    #[arg(short = 's', long = "scheduler", value_name = "NAME")]
    scheduler: Option<String>,
    /// Persistent service, with an optional timeout in seconds
    #[arg(
        short = 'p',
        long = "persistent",
        value_name = "TIMEOUT",
        num_args = 0..=1,
        default_missing_value = "300"
    )]
    persistent: Option<u32>,
    /// Persistence granularity mask
    #[arg(short = 'M', long = "netmask", value_name = "MASK")]
    netmask: Option<String>,
    /// Real server (host[:port])
    #[arg(short = 'r', long = "real-server", value_name = "ADDR")]
    real_server: Option<String>,
    /// Direct routing (the default forwarding method)
    #[arg(short = 'g', long = "gatewaying")]
    gatewaying: bool,
    /// Masquerading (network address translation)
    #[arg(short = 'm', long = "masquerading")]
    masquerading: bool,
    /// IP-in-IP encapsulation (tunneling)
    #[arg(short = 'i', long = "ipip")]
    ipip: bool,
    /// Capacity of the real server
    #[arg(short = 'w', long = "weight", value_name = "WEIGHT", allow_negative_numbers = true)]
    weight: Option<i32>,
    /// Upper connection threshold
    #[arg(short = 'x', long = "u-threshold", value_name = "UTHRESHOLD")]
    u_threshold: Option<u32>,
    /// Lower connection threshold
    #[arg(short = 'y', long = "l-threshold", value_name = "LTHRESHOLD")]
    l_threshold: Option<u32>,
    /// Multicast interface for the sync daemon
    #[arg(long = "mcast-interface", value_name = "IFNAME")]
    mcast_interface: Option<String>,
    /// Sync daemon group id
    #[arg(long = "syncid", value_name = "SID")]
    syncid: Option<u8>,
    /// List the connection table instead of the services
    #[arg(short = 'c', long = "connection")]
    connection: bool,
    /// List the configured timeout values
    #[arg(long = "timeout")]
    timeout: bool,
    /// List the sync daemon state
    #[arg(long = "daemon")]
    daemon: bool,
    /// Show traffic counters
    #[arg(long = "stats")]
    stats: bool,
    /// Show traffic rates
    #[arg(long = "rate")]
    rate: bool,
    /// Show connection thresholds
    #[arg(long = "thresholds")]
    thresholds: bool,
    /// Show persistent-connection detail
    #[arg(long = "persistent-conn")]
    persistent_conn: bool,
    /// Keep the kernel's entry order
    #[arg(long = "nosort")]
    nosort: bool,
    /// Do not resolve addresses or ports to names
    #[arg(short = 'n', long = "numeric")]
    numeric: bool,
    /// Print counters without abbreviation
    #[arg(long = "exact")]
    exact: bool,
    /// One-packet scheduling (UDP and firewall-mark services only)
    #[arg(short = 'o', long = "ops")]
    ops: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoleArg {
    Master,
    Backup,
}

impl RoleArg {
    fn role(self) -> DaemonRole {
        match self {
            RoleArg::Master => DaemonRole::Master,
            RoleArg::Backup => DaemonRole::Backup,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let resolver = SystemResolver;
    match run(&args, &resolver, false) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ipvsctl: {err:#}");
            let code = err
                .downcast_ref::<CtlError>()
                .map(CtlError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(args: &Args, resolver: &dyn NameResolver, nested: bool) -> Result<()> {
    let cmd = fold_command(args)?;
    if nested && cmd == Command::Restore {
        return Err(CtlError::usage("--restore cannot appear inside a restore stream").into());
    }
    compat::validate(cmd, fold_options(args)?)?;

    match cmd {
        Command::Add => apply_service(args, cmd, codec::SET_ADD, resolver),
        Command::Edit => apply_service(args, cmd, codec::SET_EDIT, resolver),
        Command::Del => apply_service(args, cmd, codec::SET_DEL, resolver),
        Command::Flush => {
            let ctl = control::Control::open()?;
            ctl.set(cmd, codec::SET_FLUSH, &codec::encode_empty_rule())?;
            Ok(())
        }
        Command::AddDest => apply_dest(args, cmd, codec::SET_ADD_DEST, resolver),
        Command::EditDest => apply_dest(args, cmd, codec::SET_EDIT_DEST, resolver),
        Command::DelDest => apply_dest(args, cmd, codec::SET_DEL_DEST, resolver),
        Command::SetTimeout => {
            let values = args
                .set
                .as_deref()
                .ok_or_else(|| CtlError::usage("--set needs tcp, tcpfin and udp values"))?;
            if values.len() != 3 {
                return Err(CtlError::usage("--set needs tcp, tcpfin and udp values").into());
            }
            let timeouts = Timeouts {
                tcp: values[0],
                tcp_fin: values[1],
                udp: values[2],
            };
            let ctl = control::Control::open()?;
            ctl.set(cmd, codec::SET_TIMEOUT, &codec::encode_timeouts(&timeouts))?;
            Ok(())
        }
        Command::StartDaemon => {
            let role = args
                .start_daemon
                .ok_or_else(|| CtlError::usage("--start-daemon needs master or backup"))?
                .role();
            let ifn = args
                .mcast_interface
                .clone()
                .unwrap_or_else(|| DEF_MCAST_IFN.to_string());
            if ifn.is_empty() || ifn.len() >= MCAST_IFN_MAX {
                return Err(CtlError::usage(format!(
                    "multicast interface name {ifn:?} must be 1-{} characters",
                    MCAST_IFN_MAX - 1
                ))
                .into());
            }
            let sync_id = args.syncid.unwrap_or(DEF_SYNC_ID);
            let ctl = control::Control::open()?;
            ctl.set(
                cmd,
                codec::SET_START_DAEMON,
                &codec::encode_daemon(role, &ifn, sync_id),
            )?;
            Ok(())
        }
        Command::StopDaemon => {
            let role = args
                .stop_daemon
                .ok_or_else(|| CtlError::usage("--stop-daemon needs master or backup"))?
                .role();
            let ctl = control::Control::open()?;
            ctl.set(cmd, codec::SET_STOP_DAEMON, &codec::encode_daemon(role, "", 0))?;
            Ok(())
        }
        Command::List => list(args, resolver),
        Command::Save => save(args, resolver),
        Command::Zero => {
            let payload = match service_filter(args, resolver)? {
                Some(addr) => codec::encode_rule(&VirtualService::new(addr), None),
                None => codec::encode_empty_rule(),
            };
            let ctl = control::Control::open()?;
            ctl.set(cmd, codec::SET_ZERO, &payload)?;
            Ok(())
        }
        Command::Restore => restore(resolver),
    }
}

fn apply_service(args: &Args, cmd: Command, ctl_no: i32, resolver: &dyn NameResolver) -> Result<()> {
    let svc = service_record(cmd, args, resolver)?;
    let ctl = control::Control::open()?;
    ctl.set(cmd, ctl_no, &codec::encode_rule(&svc, None))?;
    Ok(())
}

fn apply_dest(args: &Args, cmd: Command, ctl_no: i32, resolver: &dyn NameResolver) -> Result<()> {
    let svc = service_record(cmd, args, resolver)?;
    let dest = dest_record(args, &svc, resolver)?;
    let ctl = control::Control::open()?;
    ctl.set(cmd, ctl_no, &codec::encode_rule(&svc, Some(&dest)))?;
    Ok(())
}

/// Pick the single command the invocation names. A bare invocation lists
/// the table, more than one command is a usage error.
fn fold_command(args: &Args) -> Result<Command, CtlError> {
    let mut commands = Vec::new();
    let mut push = |cond: bool, cmd: Command| {
        if cond {
            commands.push(cmd);
        }
    };
    push(args.add_service, Command::Add);
    push(args.edit_service, Command::Edit);
    push(args.delete_service, Command::Del);
    push(args.clear, Command::Flush);
    push(args.list, Command::List);
    push(args.add_server, Command::AddDest);
    push(args.edit_server, Command::EditDest);
    push(args.delete_server, Command::DelDest);
    push(args.set.is_some(), Command::SetTimeout);
    push(args.start_daemon.is_some(), Command::StartDaemon);
    push(args.stop_daemon.is_some(), Command::StopDaemon);
    push(args.save, Command::Save);
    push(args.restore, Command::Restore);
    push(args.zero, Command::Zero);

    match commands.as_slice() {
        [] => Ok(Command::List),
        [cmd] => Ok(*cmd),
        [first, second, ..] => Err(CtlError::usage(format!(
            "{} conflicts with {}",
            second.name(),
            first.name()
        ))),
    }
}

/// Fold flag presence into the option set the compatibility engine checks.
/// Duplicate members of one logical option are rejected here, before the
/// table is consulted.
fn fold_options(args: &Args) -> Result<OptSet, CtlError> {
    let mut opts = OptSet::default();

    let service_specs = [&args.tcp_service, &args.udp_service, &args.fwmark_service];
    if service_specs.iter().filter(|s| s.is_some()).count() > 1 {
        return Err(CtlError::usage("protocol already specified"));
    }
    if service_specs.iter().any(|s| s.is_some()) {
        opts.insert(Opt::Service);
    }
    if args.ipv6 {
        if args.tcp_service.is_some() || args.udp_service.is_some() {
            return Err(CtlError::usage(
                "the --ipv6 (-6) option applies only to firewall-mark services",
            ));
        }
        opts.insert(Opt::Ipv6);
    }
    if forward_method(args)?.is_some() {
        opts.insert(Opt::Forward);
    }

    if args.numeric {
        opts.insert(Opt::Numeric);
    }
    if args.connection {
        opts.insert(Opt::Connection);
    }
    if args.scheduler.is_some() {
        opts.insert(Opt::Scheduler);
    }
    if args.persistent.is_some() {
        opts.insert(Opt::Persistent);
    }
    if args.netmask.is_some() {
        opts.insert(Opt::Netmask);
    }
    if args.real_server.is_some() {
        opts.insert(Opt::Dest);
    }
    if args.weight.is_some() {
        opts.insert(Opt::Weight);
    }
    if args.u_threshold.is_some() {
        opts.insert(Opt::UThreshold);
    }
    if args.l_threshold.is_some() {
        opts.insert(Opt::LThreshold);
    }
    if args.mcast_interface.is_some() {
        opts.insert(Opt::McastInterface);
    }
    if args.syncid.is_some() {
        opts.insert(Opt::SyncId);
    }
    if args.timeout {
        opts.insert(Opt::TimeoutView);
    }
    if args.daemon {
        opts.insert(Opt::DaemonView);
    }
    if args.stats {
        opts.insert(Opt::Stats);
    }
    if args.rate {
        opts.insert(Opt::Rate);
    }
    if args.thresholds {
        opts.insert(Opt::Thresholds);
    }
    if args.persistent_conn {
        opts.insert(Opt::PersistentConn);
    }
    if args.nosort {
        opts.insert(Opt::NoSort);
    }
    if args.ops {
        opts.insert(Opt::OnePacket);
    }
    if args.exact {
        opts.insert(Opt::Exact);
    }
    Ok(opts)
}

fn forward_method(args: &Args) -> Result<Option<ForwardMethod>, CtlError> {
    let mut chosen: Option<(ForwardMethod, &str)> = None;
    for (present, method, name) in [
        (args.gatewaying, ForwardMethod::DirectRoute, "-g"),
        (args.masquerading, ForwardMethod::Masq, "-m"),
        (args.ipip, ForwardMethod::Tunnel, "-i"),
    ] {
        if !present {
            continue;
        }
        if let Some((_, prev)) = chosen {
            return Err(CtlError::usage(format!("{name} conflicts with {prev}")));
        }
        chosen = Some((method, name));
    }
    Ok(chosen.map(|(method, _)| method))
}

/// Parse the service spec options into a service identity, if any were
/// given.
fn service_filter(
    args: &Args,
    resolver: &dyn NameResolver,
) -> Result<Option<ServiceAddr>, CtlError> {
    if let Some(token) = args.fwmark_service.as_deref() {
        let mark = parse::parse_fwmark(token)?;
        return Ok(Some(ServiceAddr::FwMark {
            mark,
            ipv6: args.ipv6,
        }));
    }
    let (protocol, token) = match (&args.tcp_service, &args.udp_service) {
        (Some(token), _) => (Protocol::Tcp, token),
        (_, Some(token)) => (Protocol::Udp, token),
        _ => return Ok(None),
    };
    match parse::parse_host_port(token, protocol, resolver)? {
        parse::HostPort::None => Err(CtlError::usage(
            "illegal virtual server address:port specified",
        )),
        parse::HostPort::AddrOnly(addr) => Ok(Some(ServiceAddr::Addr {
            protocol,
            addr,
            port: 0,
        })),
        parse::HostPort::AddrPort(addr, port) => Ok(Some(ServiceAddr::Addr {
            protocol,
            addr,
            port,
        })),
    }
}

fn require_service(addr: Option<ServiceAddr>) -> Result<ServiceAddr, CtlError> {
    addr.ok_or_else(|| CtlError::usage("virtual service address is required"))
}

fn service_record(
    cmd: Command,
    args: &Args,
    resolver: &dyn NameResolver,
) -> Result<VirtualService, CtlError> {
    let addr = require_service(service_filter(args, resolver)?)?;
    match cmd {
        Command::Add | Command::Edit => builder::build_service(
            cmd,
            addr,
            ServiceOptions {
                scheduler: args.scheduler.clone(),
                persistent: args.persistent,
                netmask: args.netmask.clone(),
                one_packet: args.ops,
            },
        ),
        _ => Ok(VirtualService::new(addr)),
    }
}

fn dest_record(
    args: &Args,
    svc: &VirtualService,
    resolver: &dyn NameResolver,
) -> Result<Destination, CtlError> {
    let token = args
        .real_server
        .as_deref()
        .ok_or_else(|| CtlError::usage("real server address is required"))?;
    let protocol = svc.addr.protocol().unwrap_or(Protocol::Tcp);
    let target = parse::parse_host_port(token, protocol, resolver)?;
    builder::build_dest(
        svc,
        target,
        DestOptions {
            fwd: forward_method(args)?,
            weight: args.weight,
            upper_threshold: args.u_threshold,
            lower_threshold: args.l_threshold,
        },
    )
}

fn format_options(args: &Args, rule: bool) -> FormatOptions {
    FormatOptions {
        numeric: args.numeric,
        rule,
        stats: args.stats,
        rate: args.rate,
        thresholds: args.thresholds,
        persistent_conn: args.persistent_conn,
        exact: args.exact,
        no_sort: args.nosort,
    }
}

/// Group the decoded listing into services with their destinations. The
/// kernel banner line is kept verbatim for re-display.
fn read_state<R: BufRead>(
    reader: R,
) -> Result<(Option<String>, Vec<(VirtualService, Vec<Destination>)>)> {
    let mut banner = None;
    let mut entries: Vec<(VirtualService, Vec<Destination>)> = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read the kernel listing")?;
        if line.starts_with("IP Virtual Server") {
            banner = Some(line);
            continue;
        }
        match codec::decode_line(&line)? {
            ListingLine::Header => {}
            ListingLine::Service(svc) => entries.push((svc, Vec::new())),
            ListingLine::Dest(dest) => {
                let Some((_, dests)) = entries.last_mut() else {
                    return Err(CtlError::Listing(line).into());
                };
                dests.push(dest);
            }
            ListingLine::Conn(_) => return Err(CtlError::Listing(line).into()),
        }
    }
    Ok((banner, entries))
}

fn list(args: &Args, resolver: &dyn NameResolver) -> Result<()> {
    let fopts = format_options(args, false);
    if args.timeout {
        let ctl = control::Control::open()?;
        println!("{}", format::format_timeouts(&ctl.timeouts()?));
        return Ok(());
    }
    if args.daemon {
        let ctl = control::Control::open()?;
        for daemon in ctl.daemons()? {
            println!("{}", format::format_daemon(&daemon));
        }
        return Ok(());
    }
    if args.connection {
        let reader = control::open_listing(control::PROC_CONNS)?;
        println!("{}", format::CONN_HEADER);
        for line in reader.lines() {
            let line = line.context("failed to read the connection listing")?;
            match codec::decode_line(&line)? {
                ListingLine::Header => {}
                ListingLine::Conn(entry) => {
                    println!("{}", format::format_conn(&entry, &fopts, resolver));
                }
                _ => return Err(CtlError::Listing(line).into()),
            }
        }
        return Ok(());
    }

    let filter = service_filter(args, resolver)?;
    let reader = control::open_listing(control::PROC_SERVICES)?;
    let (banner, mut entries) = read_state(reader)?;
    if let Some(filter) = &filter {
        entries.retain(|(svc, _)| svc.addr == *filter);
    }
    if !fopts.no_sort {
        format::sort_services(&mut entries);
    }
    match banner {
        Some(banner) => println!("{banner}"),
        // Listing streams without a banner: ask the kernel directly.
        None => {
            if let Ok(ctl) = control::Control::open() {
                if let Ok(info) = ctl.info() {
                    println!(
                        "{}",
                        format::banner(&info.version_string(), info.conn_table_size)
                    );
                }
            }
        }
    }
    println!("{}", format::table_header(&fopts));
    for (svc, dests) in &entries {
        println!("{}", format::format_service(svc, &fopts, resolver));
        for dest in dests {
            println!("{}", format::format_dest(svc, dest, &fopts, resolver));
        }
    }
    Ok(())
}

fn save(args: &Args, resolver: &dyn NameResolver) -> Result<()> {
    let fopts = format_options(args, true);
    let reader = control::open_listing(control::PROC_SERVICES)?;
    let (_, entries) = read_state(reader)?;
    for (svc, dests) in &entries {
        println!("{}", format::format_service(svc, &fopts, resolver));
        for dest in dests {
            println!("{}", format::format_dest(svc, dest, &fopts, resolver));
        }
    }
    Ok(())
}

/// Re-enter the normal command path once per rule line read from standard
/// input. A restore stream must not itself request another restore.
fn restore(resolver: &dyn NameResolver) -> Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read the restore stream")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let argv = std::iter::once("ipvsctl").chain(trimmed.split_whitespace());
        let parsed = Args::try_parse_from(argv)
            .map_err(|err| CtlError::usage(format!("bad rule {trimmed:?}: {err}")))?;
        run(&parsed, resolver, true)?;
    }
    Ok(())
}
