//! TUN device handle and interface-level ioctls.

use crate::error::ControllerError;
use socket2::{Domain, Socket, Type};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::info;

// ioctl constants for TUN/TAP
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = libc::IFNAMSIZ - 1;

/// The mesh TUN device. The descriptor is closed when this is dropped.
#[derive(Debug)]
pub struct TunDevice {
    name: String,
    fd: OwnedFd,
}

impl TunDevice {
    /// Create (or attach to) a TUN device named `name` and set its MTU.
    pub fn create(name: &str, mtu: u32) -> Result<Self, ControllerError> {
        let mut ifreq = ifreq_for(name)?;
        ifreq.ifr_ifru.ifru_flags = IFF_TUN | IFF_NO_PI;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| ControllerError::Device(name.to_string(), e))?;

        // SAFETY: TUNSETIFF reads a struct ifreq; `ifreq` is fully initialized
        // and outlives the call.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifreq) };
        if ret < 0 {
            return Err(ControllerError::Device(
                name.to_string(),
                io::Error::last_os_error(),
            ));
        }

        set_mtu(name, mtu).map_err(|e| ControllerError::Device(name.to_string(), e))?;

        info!(name, mtu, "TUN device created");
        Ok(Self {
            name: name.to_string(),
            fd: OwnedFd::from(file),
        })
    }

    /// Take ownership of a descriptor for an existing device.
    pub fn adopt(name: &str, fd: OwnedFd) -> Result<Self, ControllerError> {
        ifreq_for(name)?;
        Ok(Self {
            name: name.to_string(),
            fd,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Check that `name` can be used as an interface name.
pub fn validate_interface_name(name: &str) -> Result<(), ControllerError> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN || name.as_bytes().contains(&0) {
        return Err(ControllerError::InvalidInterfaceName(name.to_string()));
    }
    Ok(())
}

fn ifreq_for(name: &str) -> Result<libc::ifreq, ControllerError> {
    validate_interface_name(name)?;
    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifreq.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(ifreq)
}

fn control_socket() -> io::Result<Socket> {
    Socket::new(Domain::IPV6, Type::DGRAM, None)
}

fn invalid_name(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid interface name '{name}'"),
    )
}

/// Resolve an interface name to its index.
pub fn interface_index(name: &str) -> io::Result<u32> {
    nix::net::if_::if_nametoindex(name).map_err(io::Error::from)
}

/// Set or clear IFF_UP on an interface.
pub fn set_link_up(name: &str, up: bool) -> io::Result<()> {
    let mut ifreq = ifreq_for(name).map_err(|_| invalid_name(name))?;
    let sock = control_socket()?;

    // SAFETY: SIOCGIFFLAGS fills ifr_flags of a valid, named ifreq.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifreq) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the union was just populated as flags by SIOCGIFFLAGS.
    unsafe {
        if up {
            ifreq.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
        } else {
            ifreq.ifr_ifru.ifru_flags &= !(libc::IFF_UP as libc::c_short);
        }
    }

    // SAFETY: SIOCSIFFLAGS reads the ifreq populated above.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifreq) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set the interface MTU.
pub fn set_mtu(name: &str, mtu: u32) -> io::Result<()> {
    let mut ifreq = ifreq_for(name).map_err(|_| invalid_name(name))?;
    ifreq.ifr_ifru.ifru_mtu = libc::c_int::try_from(mtu)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "MTU out of range"))?;
    let sock = control_socket()?;

    // SAFETY: SIOCSIFMTU reads ifr_mtu of a valid, named ifreq.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFMTU as _, &ifreq) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
