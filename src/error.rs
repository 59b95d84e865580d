use thiserror::Error;

/// Failure classes that decide the process exit status.
///
/// Usage errors are detected before any kernel interaction and exit with a
/// fixed status. Kernel rejections keep the raw errno so the exit status can
/// surface it unchanged.
#[derive(Debug, Error)]
pub enum CtlError {
    #[error("{0}")]
    Usage(String),

    #[error("{message}")]
    Kernel { errno: i32, message: String },

    #[error("unrecognized entry in kernel listing: {0:?}")]
    Listing(String),
}

pub const USAGE_EXIT: u8 = 2;

impl CtlError {
    pub fn usage(msg: impl Into<String>) -> Self {
        CtlError::Usage(msg.into())
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            CtlError::Usage(_) => USAGE_EXIT,
            CtlError::Kernel { errno, .. } => {
                // errno fits the 8-bit exit status range on Linux.
                u8::try_from(*errno).unwrap_or(1)
            }
            CtlError::Listing(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_two() {
        assert_eq!(CtlError::usage("bad option").exit_code(), 2);
    }

    #[test]
    fn kernel_errors_exit_with_errno() {
        let err = CtlError::Kernel {
            errno: libc::EEXIST,
            message: "Service already exists".into(),
        };
        assert_eq!(err.exit_code(), libc::EEXIST as u8);
    }
}
