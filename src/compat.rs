use crate::error::CtlError;
use crate::model::Command;

/// Logical options a command line can carry. The declaration order is the
/// matrix column order and therefore the tie-break order for reporting the
/// first violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opt {
    Numeric,
    Connection,
    Service,
    Scheduler,
    Persistent,
    Netmask,
    Dest,
    Forward,
    Weight,
    UThreshold,
    LThreshold,
    McastInterface,
    SyncId,
    TimeoutView,
    DaemonView,
    Stats,
    Rate,
    Thresholds,
    PersistentConn,
    NoSort,
    Ipv6,
    OnePacket,
    Exact,
}

pub const OPT_COUNT: usize = 23;

impl Opt {
    pub const ALL: [Opt; OPT_COUNT] = [
        Opt::Numeric,
        Opt::Connection,
        Opt::Service,
        Opt::Scheduler,
        Opt::Persistent,
        Opt::Netmask,
        Opt::Dest,
        Opt::Forward,
        Opt::Weight,
        Opt::UThreshold,
        Opt::LThreshold,
        Opt::McastInterface,
        Opt::SyncId,
        Opt::TimeoutView,
        Opt::DaemonView,
        Opt::Stats,
        Opt::Rate,
        Opt::Thresholds,
        Opt::PersistentConn,
        Opt::NoSort,
        Opt::Ipv6,
        Opt::OnePacket,
        Opt::Exact,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Opt::Numeric => "--numeric (-n)",
            Opt::Connection => "--connection (-c)",
            Opt::Service => "-t|-u|-f",
            Opt::Scheduler => "--scheduler (-s)",
            Opt::Persistent => "--persistent (-p)",
            Opt::Netmask => "--netmask (-M)",
            Opt::Dest => "--real-server (-r)",
            Opt::Forward => "-g|-m|-i",
            Opt::Weight => "--weight (-w)",
            Opt::UThreshold => "--u-threshold (-x)",
            Opt::LThreshold => "--l-threshold (-y)",
            Opt::McastInterface => "--mcast-interface",
            Opt::SyncId => "--syncid",
            Opt::TimeoutView => "--timeout",
            Opt::DaemonView => "--daemon",
            Opt::Stats => "--stats",
            Opt::Rate => "--rate",
            Opt::Thresholds => "--thresholds",
            Opt::PersistentConn => "--persistent-conn",
            Opt::NoSort => "--nosort",
            Opt::Ipv6 => "--ipv6 (-6)",
            Opt::OnePacket => "--ops (-o)",
            Opt::Exact => "--exact",
        }
    }
}

/// Set of options actually supplied by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptSet(u32);

impl OptSet {
    pub fn insert(&mut self, opt: Opt) {
        self.0 |= 1 << opt as u32;
    }

    pub fn contains(self, opt: Opt) -> bool {
        self.0 & (1 << opt as u32) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Optional,
    Required,
    Forbidden,
    /// At most one option of the same group may be supplied.
    Exclusive(u8),
}

use Marker::{Forbidden as F, Optional as O, Required as R};
const X1: Marker = Marker::Exclusive(1);
const X2: Marker = Marker::Exclusive(2);

/// The command/option legality table. Rows follow `Command::ALL`, columns
/// follow `Opt::ALL`. This is the single source of truth for which option
/// combinations each command accepts.
#[rustfmt::skip]
static MATRIX: [[Marker; OPT_COUNT]; 14] = [
    /*                 -n -c  svc -s -p -M -r fwd -w -x -y mci sid tot dmn sts rte thr pcn srt -6 ops exact */
    /* Add         */ [F, F,  R,  O, O, O, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  O, O,  F],
    /* Edit        */ [F, F,  R,  O, O, O, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  O, O,  F],
    /* Del         */ [F, F,  R,  F, F, F, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  O, F,  F],
    /* Flush       */ [F, F,  F,  F, F, F, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  F, F,  F],
    /* List        */ [O, X1, X1, F, F, F, F, F,  F, F, F, F,  F,  X1, X1, X2, X2, X2, X2, O,  O, F,  O],
    /* AddDest     */ [F, F,  R,  F, F, F, R, O,  O, O, O, F,  F,  F,  F,  F,  F,  F,  F,  F,  O, F,  F],
    /* EditDest    */ [F, F,  R,  F, F, F, R, O,  O, O, O, F,  F,  F,  F,  F,  F,  F,  F,  F,  O, F,  F],
    /* DelDest     */ [F, F,  R,  F, F, F, R, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  O, F,  F],
    /* SetTimeout  */ [F, F,  F,  F, F, F, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  F, F,  F],
    /* StartDaemon */ [F, F,  F,  F, F, F, F, F,  F, F, F, O,  O,  F,  F,  F,  F,  F,  F,  F,  F, F,  F],
    /* StopDaemon  */ [F, F,  F,  F, F, F, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  F, F,  F],
    /* Save        */ [O, F,  F,  F, F, F, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  F, F,  F],
    /* Restore     */ [F, F,  F,  F, F, F, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  F, F,  F],
    /* Zero        */ [F, F,  O,  F, F, F, F, F,  F, F, F, F,  F,  F,  F,  F,  F,  F,  F,  F,  O, F,  F],
];

pub fn marker(cmd: Command, opt: Opt) -> Marker {
    MATRIX[cmd.index()][opt as usize]
}

/// Check the supplied option set against the matrix. Reports the first
/// violation in column order; an exclusive-group violation names both
/// conflicting options.
pub fn validate(cmd: Command, opts: OptSet) -> Result<(), CtlError> {
    let mut groups: [Option<Opt>; 4] = [None; 4];
    for opt in Opt::ALL {
        let present = opts.contains(opt);
        match marker(cmd, opt) {
            Marker::Required => {
                if !present {
                    return Err(CtlError::usage(format!(
                        "the {} option is required with {}",
                        opt.name(),
                        cmd.name()
                    )));
                }
            }
            Marker::Forbidden => {
                if present {
                    return Err(CtlError::usage(format!(
                        "the {} option may not be used with {}",
                        opt.name(),
                        cmd.name()
                    )));
                }
            }
            Marker::Exclusive(group) => {
                if present {
                    let slot = &mut groups[group as usize];
                    if let Some(prev) = *slot {
                        return Err(CtlError::usage(format!(
                            "{} conflicts with {}",
                            opt.name(),
                            prev.name()
                        )));
                    }
                    *slot = Some(opt);
                }
            }
            Marker::Optional => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(cmd: Command) -> OptSet {
        let mut set = OptSet::default();
        for opt in Opt::ALL {
            if marker(cmd, opt) == Marker::Required {
                set.insert(opt);
            }
        }
        set
    }

    fn with(mut set: OptSet, opt: Opt) -> OptSet {
        set.insert(opt);
        set
    }

    fn without(mut set: OptSet, opt: Opt) -> OptSet {
        set.0 &= !(1 << opt as u32);
        set
    }

    #[test]
    fn minimal_sets_are_accepted() {
        for cmd in Command::ALL {
            assert!(validate(cmd, minimal(cmd)).is_ok(), "{}", cmd.name());
        }
    }

    #[test]
    fn every_cell_is_honored() {
        for cmd in Command::ALL {
            for opt in Opt::ALL {
                let base = minimal(cmd);
                match marker(cmd, opt) {
                    Marker::Required => {
                        let err = validate(cmd, without(base, opt)).unwrap_err();
                        assert!(
                            err.to_string().contains(opt.name()),
                            "{} / {}",
                            cmd.name(),
                            opt.name()
                        );
                    }
                    Marker::Forbidden => {
                        let err = validate(cmd, with(base, opt)).unwrap_err();
                        assert!(
                            err.to_string().contains(opt.name()),
                            "{} / {}",
                            cmd.name(),
                            opt.name()
                        );
                    }
                    Marker::Optional | Marker::Exclusive(_) => {
                        assert!(
                            validate(cmd, with(base, opt)).is_ok(),
                            "{} / {}",
                            cmd.name(),
                            opt.name()
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn exclusive_pairs_conflict_and_name_both() {
        for cmd in Command::ALL {
            for first in Opt::ALL {
                for second in Opt::ALL {
                    if first as u32 >= second as u32 {
                        continue;
                    }
                    let (Marker::Exclusive(a), Marker::Exclusive(b)) =
                        (marker(cmd, first), marker(cmd, second))
                    else {
                        continue;
                    };
                    if a != b {
                        continue;
                    }
                    let set = with(with(minimal(cmd), first), second);
                    let msg = validate(cmd, set).unwrap_err().to_string();
                    assert!(msg.contains(first.name()) && msg.contains(second.name()));
                }
            }
        }
    }

    #[test]
    fn different_exclusive_groups_do_not_conflict() {
        let set = with(with(OptSet::default(), Opt::Connection), Opt::Stats);
        assert!(validate(Command::List, set).is_ok());
    }

    #[test]
    fn first_violation_follows_column_order() {
        // Missing the service spec (column 3) is reported before the
        // forbidden destination option (column 7).
        let err = validate(Command::Add, with(OptSet::default(), Opt::Dest)).unwrap_err();
        assert!(err.to_string().contains(Opt::Service.name()));
    }

    #[test]
    fn list_views_are_mutually_exclusive() {
        let set = with(with(OptSet::default(), Opt::Connection), Opt::TimeoutView);
        let msg = validate(Command::List, set).unwrap_err().to_string();
        assert!(msg.contains("--timeout") && msg.contains("--connection (-c)"));
    }
}
