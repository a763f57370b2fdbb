//! Controller configuration.

use crate::error::{ControllerError, Result};
use crate::link::MTU;
use crate::tun::validate_interface_name;

/// Default name of the mesh TUN interface.
pub const DEFAULT_INTERFACE: &str = "thread-wpan";

/// Smallest MTU an IPv6 link may have.
pub const IPV6_MIN_MTU: u32 = 1280;

/// Validated settings for one controlled interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    interface_name: String,
    mtu: u32,
}

impl ControllerConfig {
    pub fn new(interface_name: &str, mtu: u32) -> Result<Self> {
        validate_interface_name(interface_name)?;
        if mtu < IPV6_MIN_MTU {
            return Err(ControllerError::InvalidMtu(mtu));
        }
        Ok(Self {
            interface_name: interface_name.to_string(),
            mtu,
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_INTERFACE.to_string(),
            mtu: MTU,
        }
    }
}
