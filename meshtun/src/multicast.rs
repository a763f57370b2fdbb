//! Multicast group membership on the mesh interface.

use crate::error::KernelError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::Ipv6Addr;
use tracing::{debug, warn};

/// Socket-option level operations for joining and leaving IPv6 groups.
pub trait GroupSocket: Send {
    fn join_group(&self, group: &Ipv6Addr, if_index: u32) -> io::Result<()>;
    fn leave_group(&self, group: &Ipv6Addr, if_index: u32) -> io::Result<()>;
}

impl GroupSocket for Socket {
    fn join_group(&self, group: &Ipv6Addr, if_index: u32) -> io::Result<()> {
        self.join_multicast_v6(group, if_index)
    }

    fn leave_group(&self, group: &Ipv6Addr, if_index: u32) -> io::Result<()> {
        self.leave_multicast_v6(group, if_index)
    }
}

/// UDP/IPv6 socket used only for membership socket options.
pub fn open_group_socket(if_index: u32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_if_v6(if_index)?;
    Ok(socket)
}

/// Joins and leaves groups on one interface through one long-lived socket.
///
/// Keeps no membership cache; the controller's mirrored set decides what
/// should be joined.
pub struct MulticastManager<S: GroupSocket> {
    socket: S,
    if_index: u32,
}

impl<S: GroupSocket> MulticastManager<S> {
    pub fn new(socket: S, if_index: u32) -> Self {
        Self { socket, if_index }
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Join `group`. Being a member already counts as success.
    pub fn join(&self, group: &Ipv6Addr) -> Result<(), KernelError> {
        match self.socket.join_group(group, self.if_index) {
            Ok(()) => {
                debug!(group = %group, if_index = self.if_index, "Joined multicast group");
                Ok(())
            }
            Err(e) => match KernelError::from_io(e) {
                KernelError::AlreadyPresent => {
                    warn!(group = %group, if_index = self.if_index, "Already joined multicast group");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    /// Leave `group`. `NotPresent` is returned as such so callers can tell
    /// an external removal from a real failure.
    pub fn leave(&self, group: &Ipv6Addr) -> Result<(), KernelError> {
        self.socket
            .leave_group(group, self.if_index)
            .map_err(KernelError::from_io)?;
        debug!(group = %group, if_index = self.if_index, "Left multicast group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Behaves like the kernel: a second join of the same group fails with
    /// EADDRINUSE, leaving a group that was never joined fails with
    /// EADDRNOTAVAIL.
    #[derive(Default)]
    struct KernelLikeSocket {
        groups: Mutex<HashSet<Ipv6Addr>>,
    }

    impl GroupSocket for KernelLikeSocket {
        fn join_group(&self, group: &Ipv6Addr, _if_index: u32) -> io::Result<()> {
            if self.groups.lock().unwrap().insert(*group) {
                Ok(())
            } else {
                Err(io::Error::from_raw_os_error(libc::EADDRINUSE))
            }
        }

        fn leave_group(&self, group: &Ipv6Addr, _if_index: u32) -> io::Result<()> {
            if self.groups.lock().unwrap().remove(group) {
                Ok(())
            } else {
                Err(io::Error::from_raw_os_error(libc::EADDRNOTAVAIL))
            }
        }
    }

    fn group() -> Ipv6Addr {
        "ff03::fc".parse().unwrap()
    }

    #[test]
    fn test_join_twice_is_not_an_error() {
        let manager = MulticastManager::new(KernelLikeSocket::default(), 4);
        assert!(manager.join(&group()).is_ok());
        assert!(manager.join(&group()).is_ok());
        assert_eq!(manager.socket.groups.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_leave_unknown_group_is_not_present() {
        let manager = MulticastManager::new(KernelLikeSocket::default(), 4);
        assert!(matches!(
            manager.leave(&group()),
            Err(KernelError::NotPresent)
        ));
    }

    #[test]
    fn test_join_then_leave() {
        let manager = MulticastManager::new(KernelLikeSocket::default(), 4);
        manager.join(&group()).unwrap();
        manager.leave(&group()).unwrap();
        assert!(manager.socket.groups.lock().unwrap().is_empty());
    }
}
