//! Snapshot shapes pushed by the mesh daemon, validated before use.

use crate::error::SnapshotError;
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;

/// One address the mesh daemon wants on the interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address: Vec<u8>,
    pub prefix_length: u8,
    #[serde(default)]
    pub is_mesh_local: bool,
    #[serde(default)]
    pub is_active_omr: bool,
    #[serde(default)]
    pub is_preferred: bool,
}

/// A validated [`AddressInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEntry {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub is_mesh_local: bool,
    pub is_active_omr: bool,
    pub is_preferred: bool,
}

impl AddressEntry {
    pub fn is_multicast(&self) -> bool {
        self.address.is_multicast()
    }
}

impl AddressInfo {
    pub fn validate(&self) -> Result<AddressEntry, SnapshotError> {
        let octets: [u8; 16] = self
            .address
            .as_slice()
            .try_into()
            .map_err(|_| SnapshotError::AddressLength(self.address.len()))?;
        if self.prefix_length > 128 {
            return Err(SnapshotError::PrefixLength(self.prefix_length));
        }
        Ok(AddressEntry {
            address: Ipv6Addr::from(octets),
            prefix_len: self.prefix_length,
            is_mesh_local: self.is_mesh_local,
            is_active_omr: self.is_active_omr,
            is_preferred: self.is_preferred,
        })
    }
}

/// An on-mesh prefix from the mesh network data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnMeshPrefixConfig {
    pub prefix: Vec<u8>,
    pub prefix_length: u8,
}

impl OnMeshPrefixConfig {
    /// Prefix bytes shorter than an address are zero-padded.
    pub fn to_net(&self) -> Result<Ipv6Net, SnapshotError> {
        if self.prefix.len() > 16 {
            return Err(SnapshotError::AddressLength(self.prefix.len()));
        }
        if self.prefix_length > 128 {
            return Err(SnapshotError::PrefixLength(self.prefix_length));
        }
        let mut octets = [0u8; 16];
        octets[..self.prefix.len()].copy_from_slice(&self.prefix);
        Ipv6Net::new(Ipv6Addr::from(octets), self.prefix_length)
            .map(|net| net.trunc())
            .map_err(|_| SnapshotError::PrefixLength(self.prefix_length))
    }
}

/// One line of input from the mesh daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonMessage {
    Addresses(Vec<AddressInfo>),
    Prefixes(Vec<OnMeshPrefixConfig>),
    DaemonDied,
}
