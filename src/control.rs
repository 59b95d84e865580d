use crate::codec;
use crate::error::CtlError;
use crate::model::{Command, DaemonConfig, Timeouts};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;

pub const PROC_SERVICES: &str = "/proc/net/ip_vs";
pub const PROC_CONNS: &str = "/proc/net/ip_vs_conn";

const KERNEL_HINT: &str = "is IP virtual server support built into the kernel?";

/// Open one of the kernel listing files as a line stream.
pub fn open_listing(path: &str) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("could not open {path}; {KERNEL_HINT}"))?;
    Ok(BufReader::new(file))
}

/// Map a kernel rejection to the conventional short message for the failed
/// command. Anything unlisted falls back to the system error text.
pub fn classify(cmd: Command, errno: i32) -> String {
    let msg = match (cmd, errno) {
        (Command::Add, libc::EEXIST) => "Service already exists",
        (Command::Add | Command::Edit, libc::ENOENT) => "Scheduler not found",
        (Command::Edit | Command::Del | Command::Zero, libc::ESRCH) => "No such service",
        (Command::AddDest | Command::EditDest | Command::DelDest, libc::ESRCH) => {
            "Service not defined"
        }
        (Command::AddDest, libc::EEXIST) => "Destination already exists",
        (Command::EditDest | Command::DelDest, libc::ENOENT) => "No such destination",
        (Command::StartDaemon, libc::EEXIST) => "Daemon is already running",
        (Command::StopDaemon, libc::ESRCH) => "No daemon is running",
        _ => return std::io::Error::from_raw_os_error(errno).to_string(),
    };
    msg.to_string()
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use socket2::{Domain, Protocol, Socket, Type};
    use std::io;
    use std::os::fd::AsRawFd;

    /// Raw control socket for the virtual-server sockopt interface.
    pub struct Control {
        socket: Socket,
    }

    impl Control {
        pub fn open() -> Result<Self> {
            let socket = Socket::new(
                Domain::IPV4,
                Type::RAW,
                Some(Protocol::from(libc::IPPROTO_RAW)),
            )
            .with_context(|| format!("failed to open the control socket; {KERNEL_HINT}"))?;
            Ok(Control { socket })
        }

        pub fn set(&self, cmd: Command, ctl: i32, payload: &[u8]) -> Result<(), CtlError> {
            let rc = unsafe {
                libc::setsockopt(
                    self.socket.as_raw_fd(),
                    libc::IPPROTO_IP,
                    ctl,
                    payload.as_ptr() as *const libc::c_void,
                    payload.len() as libc::socklen_t,
                )
            };
            if rc < 0 {
                let errno = io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EINVAL);
                return Err(CtlError::Kernel {
                    errno,
                    message: classify(cmd, errno),
                });
            }
            Ok(())
        }

        pub fn get(&self, ctl: i32, len: usize) -> Result<Vec<u8>, CtlError> {
            let mut buf = vec![0u8; len];
            let mut optlen = len as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    self.socket.as_raw_fd(),
                    libc::IPPROTO_IP,
                    ctl,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    &mut optlen,
                )
            };
            if rc < 0 {
                let errno = io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EINVAL);
                return Err(CtlError::Kernel {
                    errno,
                    message: io::Error::from_raw_os_error(errno).to_string(),
                });
            }
            buf.truncate(optlen as usize);
            Ok(buf)
        }

        pub fn info(&self) -> Result<codec::KernelInfo, CtlError> {
            codec::decode_info(&self.get(codec::GET_INFO, codec::INFO_LEN)?)
        }

        pub fn timeouts(&self) -> Result<Timeouts, CtlError> {
            codec::decode_timeouts(&self.get(codec::GET_TIMEOUT, codec::TIMEOUT_LEN)?)
        }

        pub fn daemons(&self) -> Result<Vec<DaemonConfig>, CtlError> {
            codec::decode_daemons(&self.get(codec::GET_DAEMON, 2 * codec::DAEMON_LEN)?)
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use anyhow::anyhow;

    pub struct Control;

    fn unsupported() -> CtlError {
        CtlError::Kernel {
            errno: libc::ENOSYS,
            message: "the virtual-server control interface is only available on linux".into(),
        }
    }

    impl Control {
        pub fn open() -> Result<Self> {
            Err(anyhow!(
                "the virtual-server control interface is only available on linux"
            ))
        }

        pub fn set(&self, _cmd: Command, _ctl: i32, _payload: &[u8]) -> Result<(), CtlError> {
            Err(unsupported())
        }

        pub fn get(&self, _ctl: i32, _len: usize) -> Result<Vec<u8>, CtlError> {
            Err(unsupported())
        }

        pub fn info(&self) -> Result<codec::KernelInfo, CtlError> {
            Err(unsupported())
        }

        pub fn timeouts(&self) -> Result<Timeouts, CtlError> {
            Err(unsupported())
        }

        pub fn daemons(&self) -> Result<Vec<DaemonConfig>, CtlError> {
            Err(unsupported())
        }
    }
}

pub use imp::Control;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejections_have_conventional_messages() {
        assert_eq!(
            classify(Command::Add, libc::EEXIST),
            "Service already exists"
        );
        assert_eq!(classify(Command::Add, libc::ENOENT), "Scheduler not found");
    }

    #[test]
    fn dest_rejections_are_command_specific() {
        assert_eq!(
            classify(Command::AddDest, libc::ESRCH),
            "Service not defined"
        );
        assert_eq!(
            classify(Command::AddDest, libc::EEXIST),
            "Destination already exists"
        );
        assert_eq!(
            classify(Command::DelDest, libc::ENOENT),
            "No such destination"
        );
    }

    #[test]
    fn unknown_errnos_fall_back_to_system_text() {
        let msg = classify(Command::Flush, libc::EPERM);
        assert!(!msg.is_empty());
        assert_ne!(msg, "Service already exists");
    }
}
