//! Error types for meshtun.

use std::io;
use thiserror::Error;

/// Outcome of a single kernel-facing call (netlink send, group join/leave).
///
/// `AlreadyPresent` and `NotPresent` are expected races rather than failures;
/// callers match on them instead of inspecting errno values.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("already present")]
    AlreadyPresent,

    #[error("not present")]
    NotPresent,

    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    #[error(transparent)]
    Io(io::Error),
}

impl KernelError {
    /// Classify an I/O error by errno.
    pub fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EEXIST) | Some(libc::EADDRINUSE) => KernelError::AlreadyPresent,
            Some(libc::EADDRNOTAVAIL) | Some(libc::ENOENT) | Some(libc::ESRCH)
            | Some(libc::ENODEV) => KernelError::NotPresent,
            _ => KernelError::Io(err),
        }
    }

    /// Whether this is one of the benign races.
    pub fn is_expected_race(&self) -> bool {
        matches!(self, KernelError::AlreadyPresent | KernelError::NotPresent)
    }
}

impl From<io::Error> for KernelError {
    fn from(err: io::Error) -> Self {
        KernelError::from_io(err)
    }
}

/// Controller errors. Only initialization and state misuse surface here;
/// everything after a successful initialization is best-effort.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid interface name '{0}' (1-15 bytes, no NUL)")]
    InvalidInterfaceName(String),

    #[error("MTU {0} is below the IPv6 minimum of 1280")]
    InvalidMtu(u32),

    #[error("failed to resolve interface index for '{0}': {1}")]
    InterfaceIndex(String, io::Error),

    #[error("failed to open netlink route socket: {0}")]
    RouteSocket(io::Error),

    #[error("failed to open multicast socket on '{0}': {1}")]
    MulticastSocket(String, io::Error),

    #[error("TUN device '{0}': {1}")]
    Device(String, io::Error),

    #[error("failed to set '{0}' {1}: {2}")]
    LinkState(String, &'static str, io::Error),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::controller::ControllerState,
    },
}

/// A snapshot entry that cannot be turned into an address or prefix.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("address must be 16 bytes, got {0}")]
    AddressLength(usize),

    #[error("prefix length {0} exceeds 128")]
    PrefixLength(u8),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_errno() {
        let err = KernelError::from_io(io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert!(matches!(err, KernelError::AlreadyPresent));

        let err = KernelError::from_io(io::Error::from_raw_os_error(libc::EADDRNOTAVAIL));
        assert!(matches!(err, KernelError::NotPresent));
        assert!(err.is_expected_race());

        let err = KernelError::from_io(io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, KernelError::Io(_)));
        assert!(!err.is_expected_race());
    }
}
