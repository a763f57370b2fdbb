//! Test utilities for meshtun integration tests.
//!
//! Provides an in-memory kernel that records every netlink request, link
//! state change and group operation, with failure injection.

use crate::backend::LinkBackend;
use crate::error::KernelError;
use crate::lifetime::Clock;
use crate::multicast::GroupSocket;
use crate::netlink::{DecodedAddressMessage, NetlinkTransport, decode_address_message};
use crate::snapshot::{AddressInfo, OnMeshPrefixConfig};
use crate::tun::TunDevice;
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const TEST_IF_INDEX: u32 = 42;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOp {
    Join(Ipv6Addr),
    Leave(Ipv6Addr),
}

/// State of the simulated kernel.
#[derive(Debug, Default)]
pub struct FakeKernel {
    /// Every request handed to a route socket, in order, failed ones included.
    pub messages: Vec<DecodedAddressMessage>,
    /// Addresses currently configured, as (address, prefix length).
    pub addresses: BTreeSet<(Ipv6Addr, u8)>,
    pub groups: HashSet<Ipv6Addr>,
    pub group_ops: Vec<GroupOp>,
    pub link_calls: Vec<bool>,
    pub link_up: bool,
    /// Zero-based send attempts that fail with EIO.
    pub failing_sends: HashSet<usize>,
    pub fail_link: bool,
    pub missing_interface: bool,
    pub fail_route_socket: bool,
    pub fail_group_socket: bool,
}

impl FakeKernel {
    pub fn messages_of_type(&self, message_type: u16) -> Vec<&DecodedAddressMessage> {
        self.messages
            .iter()
            .filter(|m| m.message_type == message_type)
            .collect()
    }

    pub fn sequence_numbers(&self) -> Vec<u32> {
        self.messages.iter().map(|m| m.seq).collect()
    }
}

/// [`LinkBackend`] over a shared [`FakeKernel`]. Clones share the kernel.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    kernel: Arc<Mutex<FakeKernel>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel(&self) -> MutexGuard<'_, FakeKernel> {
        self.kernel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LinkBackend for FakeBackend {
    type Route = FakeRouteSocket;
    type Groups = FakeGroupSocket;

    fn interface_index(&self, _name: &str) -> io::Result<u32> {
        if self.kernel().missing_interface {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        Ok(TEST_IF_INDEX)
    }

    fn open_route_socket(&self) -> io::Result<FakeRouteSocket> {
        if self.kernel().fail_route_socket {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(FakeRouteSocket {
            kernel: Arc::clone(&self.kernel),
        })
    }

    fn open_group_socket(&self, _if_index: u32) -> io::Result<FakeGroupSocket> {
        if self.kernel().fail_group_socket {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        Ok(FakeGroupSocket {
            kernel: Arc::clone(&self.kernel),
        })
    }

    fn set_link_up(&self, _name: &str, up: bool) -> io::Result<()> {
        let mut kernel = self.kernel();
        kernel.link_calls.push(up);
        if kernel.fail_link {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        kernel.link_up = up;
        Ok(())
    }
}

pub struct FakeRouteSocket {
    kernel: Arc<Mutex<FakeKernel>>,
}

impl NetlinkTransport for FakeRouteSocket {
    fn send(&mut self, message: &[u8], _seq: u32) -> Result<(), KernelError> {
        let mut kernel = self.kernel.lock().unwrap_or_else(|e| e.into_inner());
        let decoded = decode_address_message(message)
            .ok_or_else(|| KernelError::from_io(io::Error::from_raw_os_error(libc::EINVAL)))?;
        let attempt = kernel.messages.len();
        kernel.messages.push(decoded.clone());

        if kernel.failing_sends.contains(&attempt) {
            return Err(KernelError::from_io(io::Error::from_raw_os_error(libc::EIO)));
        }
        let Some(address) = decoded.address else {
            return Err(KernelError::from_io(io::Error::from_raw_os_error(libc::EINVAL)));
        };
        let key = (address, decoded.prefix_len);
        match decoded.message_type {
            RTM_NEWADDR => {
                kernel.addresses.insert(key);
                Ok(())
            }
            RTM_DELADDR if kernel.addresses.remove(&key) => Ok(()),
            RTM_DELADDR => Err(KernelError::NotPresent),
            _ => Err(KernelError::from_io(io::Error::from_raw_os_error(libc::EOPNOTSUPP))),
        }
    }
}

/// Rejects a second join with EADDRINUSE and leaving an unjoined group
/// with EADDRNOTAVAIL, like the kernel.
pub struct FakeGroupSocket {
    kernel: Arc<Mutex<FakeKernel>>,
}

impl GroupSocket for FakeGroupSocket {
    fn join_group(&self, group: &Ipv6Addr, _if_index: u32) -> io::Result<()> {
        let mut kernel = self.kernel.lock().unwrap_or_else(|e| e.into_inner());
        kernel.group_ops.push(GroupOp::Join(*group));
        if kernel.groups.insert(*group) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EADDRINUSE))
        }
    }

    fn leave_group(&self, group: &Ipv6Addr, _if_index: u32) -> io::Result<()> {
        let mut kernel = self.kernel.lock().unwrap_or_else(|e| e.into_inner());
        kernel.group_ops.push(GroupOp::Leave(*group));
        if kernel.groups.remove(group) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EADDRNOTAVAIL))
        }
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(now_ms)))
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A device handle backed by /dev/null, good enough for ownership tests.
pub fn fake_device(name: &str) -> TunDevice {
    let file = File::open("/dev/null").expect("open /dev/null");
    TunDevice::adopt(name, OwnedFd::from(file)).expect("valid interface name")
}

pub fn address_info(
    addr: &str,
    prefix_length: u8,
    is_mesh_local: bool,
    is_active_omr: bool,
    is_preferred: bool,
) -> AddressInfo {
    let addr: Ipv6Addr = addr.parse().expect("valid IPv6 address");
    AddressInfo {
        address: addr.octets().to_vec(),
        prefix_length,
        is_mesh_local,
        is_active_omr,
        is_preferred,
    }
}

pub fn prefix_config(prefix: &str, prefix_length: u8) -> OnMeshPrefixConfig {
    let addr: Ipv6Addr = prefix.parse().expect("valid IPv6 prefix");
    OnMeshPrefixConfig {
        prefix: addr.octets().to_vec(),
        prefix_length,
    }
}
