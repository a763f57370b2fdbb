//! Mesh TUN interface controller.
//!
//! Keeps the interface's addresses, routes and multicast memberships in line
//! with the full snapshots pushed by the mesh daemon. Each snapshot is diffed
//! against the mirrored state and only the difference reaches the kernel.
//!
//! Lifecycle:
//!
//! ```text
//! Created --initialize--> Initialized --set_interface_up(true)--> Up
//!                                              ^                  |
//!                                              +------ Down <-----+
//! any --destroy--> Destroyed
//! ```

use crate::backend::{LinkBackend, SystemBackend};
use crate::config::ControllerConfig;
use crate::diff::diff;
use crate::error::{ControllerError, KernelError, Result};
use crate::lifetime::{BootClock, Clock, Lifetime};
use crate::link::{LinkAddress, LinkProperties, Route, prefix_net};
use crate::multicast::MulticastManager;
use crate::netlink::{
    AddressRequest, NetlinkTransport, SequenceCounter, del_address_message, new_address_message,
};
use crate::snapshot::{AddressEntry, AddressInfo, OnMeshPrefixConfig};
use crate::tun::TunDevice;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv6Addr;
use std::os::fd::RawFd;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No kernel resources yet.
    Created,
    /// Device, route socket and multicast socket open; index resolved.
    Initialized,
    Up,
    Down,
    /// Everything released; the controller cannot be used again.
    Destroyed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Created => "created",
            ControllerState::Initialized => "initialized",
            ControllerState::Up => "up",
            ControllerState::Down => "down",
            ControllerState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Handles owned for the lifetime of the controlled interface. Dropping
/// this closes all of them.
struct Resources<B: LinkBackend> {
    device: TunDevice,
    route_socket: B::Route,
    multicast: MulticastManager<B::Groups>,
    if_index: u32,
}

/// Controller for one mesh TUN interface.
pub struct TunController<B: LinkBackend = SystemBackend> {
    config: ControllerConfig,
    backend: B,
    sequence: SequenceCounter,
    clock: Box<dyn Clock>,
    state: ControllerState,
    resources: Option<Resources<B>>,
    link_properties: LinkProperties,
    multicast_addresses: Vec<Ipv6Addr>,
    on_mesh_prefixes: Vec<Route>,
}

impl<B: LinkBackend> TunController<B> {
    /// `sequence` is shared with every other controller in the process.
    pub fn new(config: ControllerConfig, backend: B, sequence: SequenceCounter) -> Self {
        let link_properties = LinkProperties::new(config.interface_name(), config.mtu());
        Self {
            config,
            backend,
            sequence,
            clock: Box::new(BootClock),
            state: ControllerState::Created,
            resources: None,
            link_properties,
            multicast_addresses: Vec::new(),
            on_mesh_prefixes: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn link_properties(&self) -> &LinkProperties {
        &self.link_properties
    }

    pub fn multicast_addresses(&self) -> &[Ipv6Addr] {
        &self.multicast_addresses
    }

    pub fn on_mesh_prefixes(&self) -> &[Route] {
        &self.on_mesh_prefixes
    }

    pub fn if_index(&self) -> Option<u32> {
        self.resources.as_ref().map(|r| r.if_index)
    }

    /// Descriptor of the TUN device, for the packet path.
    pub fn tun_fd(&self) -> Option<RawFd> {
        self.resources.as_ref().map(|r| r.device.as_raw_fd())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Take ownership of the TUN device and open the kernel control sockets.
    ///
    /// On failure everything acquired so far, including `device`, is
    /// released and the controller stays `Created`.
    pub fn initialize(&mut self, device: TunDevice) -> Result<()> {
        if self.state != ControllerState::Created {
            return Err(ControllerError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }
        let name = self.config.interface_name().to_string();
        if device.name() != name {
            return Err(ControllerError::InvalidInterfaceName(
                device.name().to_string(),
            ));
        }

        let if_index = self
            .backend
            .interface_index(&name)
            .map_err(|e| ControllerError::InterfaceIndex(name.clone(), e))?;
        let route_socket = self
            .backend
            .open_route_socket()
            .map_err(ControllerError::RouteSocket)?;
        let groups = self
            .backend
            .open_group_socket(if_index)
            .map_err(|e| ControllerError::MulticastSocket(name.clone(), e))?;

        self.resources = Some(Resources {
            device,
            route_socket,
            multicast: MulticastManager::new(groups, if_index),
            if_index,
        });
        self.state = ControllerState::Initialized;
        info!(name = %name, if_index, "Interface controller initialized");
        Ok(())
    }

    /// Bring the interface up or down.
    ///
    /// Going down strips every mirrored address and route first (best
    /// effort) and forgets the on-mesh prefixes. Multicast memberships stay.
    /// The controller is `Down` after that even if clearing IFF_UP fails.
    /// Going up does not restore anything; the next snapshot does, and a
    /// failed bring-up leaves the state unchanged.
    pub fn set_interface_up(&mut self, up: bool) -> Result<()> {
        match self.state {
            ControllerState::Initialized | ControllerState::Up | ControllerState::Down => {}
            state => {
                return Err(ControllerError::InvalidState {
                    operation: "change link state",
                    state,
                });
            }
        }

        if !up {
            // The mirror is empty from here on, whatever the link toggle does.
            self.strip_link();
            self.state = ControllerState::Down;
        }

        let name = self.config.interface_name();
        let direction = if up { "up" } else { "down" };
        self.backend
            .set_link_up(name, up)
            .map_err(|e| ControllerError::LinkState(name.to_string(), direction, e))?;

        self.state = if up {
            ControllerState::Up
        } else {
            ControllerState::Down
        };
        info!(name = %name, state = %self.state, "Interface state changed");
        Ok(())
    }

    /// Apply a full address snapshot from the mesh daemon.
    pub fn update_addresses(&mut self, snapshot: &[AddressInfo]) {
        if self.resources.is_none() {
            warn!(state = %self.state, "Ignoring address snapshot, interface not initialized");
            return;
        }

        let entries: Vec<AddressEntry> = snapshot
            .iter()
            .filter_map(|info| match info.validate() {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed address entry");
                    None
                }
            })
            .collect();

        let has_active_omr = entries.iter().any(|e| e.is_active_omr);
        let now_ms = self.clock.now_ms();

        // One entry per address/prefix length; a later duplicate wins.
        let mut addresses: Vec<LinkAddress> = Vec::new();
        let mut groups = Vec::new();
        for entry in &entries {
            if entry.is_multicast() {
                groups.push(entry.address);
                continue;
            }
            let address = link_address_for(entry, has_active_omr, now_ms);
            match addresses
                .iter_mut()
                .find(|a| a.address == address.address && a.prefix_len == address.prefix_len)
            {
                Some(existing) => {
                    debug!(address = %address, "Duplicate address entry in snapshot");
                    *existing = address;
                }
                None => addresses.push(address),
            }
        }

        let address_diff = diff(self.link_properties.addresses(), &addresses);
        for address in &address_diff.removed {
            self.remove_address(address);
        }
        for address in address_diff.added {
            self.add_address(address);
        }

        let group_diff = diff(&self.multicast_addresses, &groups);
        for group in &group_diff.removed {
            self.leave_group(group);
        }
        for group in &group_diff.added {
            self.join_group(group);
        }

        let mut seen = HashSet::new();
        groups.retain(|g| seen.insert(*g));
        self.multicast_addresses = groups;

        debug!(
            addresses = self.link_properties.addresses().len(),
            groups = self.multicast_addresses.len(),
            "Address snapshot applied"
        );
    }

    /// Apply a full on-mesh prefix snapshot. Only the mirrored routes change;
    /// nothing is sent to the kernel.
    pub fn update_prefixes(&mut self, snapshot: &[OnMeshPrefixConfig]) {
        if self.state == ControllerState::Destroyed {
            warn!("Ignoring prefix snapshot, interface destroyed");
            return;
        }

        let mut routes: Vec<Route> = snapshot
            .iter()
            .filter_map(|config| match config.to_net() {
                Ok(net) => Some(self.route_for(net)),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed on-mesh prefix");
                    None
                }
            })
            .collect();

        let prefix_diff = diff(&self.on_mesh_prefixes, &routes);
        for route in &prefix_diff.removed {
            self.link_properties.remove_route(route);
        }
        for route in prefix_diff.added {
            debug!(route = %route, "Adding on-mesh prefix route");
            self.link_properties.add_route(route);
        }

        let mut seen = HashSet::new();
        routes.retain(|r| seen.insert(r.clone()));
        self.on_mesh_prefixes = routes;
    }

    /// The mesh daemon is gone: take the interface down.
    pub fn on_daemon_died(&mut self) {
        info!("Mesh daemon died, bringing interface down");
        if let Err(e) = self.set_interface_up(false) {
            error!(error = %e, "Failed to set interface down");
        }
    }

    /// Strip the interface and release every kernel handle.
    pub fn destroy(&mut self) {
        if self.state == ControllerState::Destroyed {
            return;
        }
        if self.resources.is_some() {
            self.strip_link();
        }
        // Drops device, route socket and multicast socket.
        self.resources = None;
        self.state = ControllerState::Destroyed;
        info!(name = %self.config.interface_name(), "Interface controller destroyed");
    }

    fn strip_link(&mut self) {
        let addresses = self.link_properties.addresses().to_vec();
        for address in &addresses {
            self.remove_address(address);
        }
        let routes = self.link_properties.routes().to_vec();
        for route in &routes {
            self.link_properties.remove_route(route);
        }
        self.on_mesh_prefixes.clear();
    }

    fn route_for(&self, destination: ipnet::Ipv6Net) -> Route {
        Route::unicast(
            destination,
            self.config.interface_name(),
            self.config.mtu(),
        )
    }

    fn route_for_address(&self, address: &LinkAddress) -> Route {
        self.route_for(prefix_net(address.address, address.prefix_len))
    }

    /// The kernel request goes out first; the mirror only records the
    /// address once the request was accepted, so a failure is retried by the
    /// next snapshot.
    fn add_address(&mut self, address: LinkAddress) {
        debug!(address = %address, flags = address.flags, "Adding address");
        let Some(resources) = self.resources.as_mut() else {
            return;
        };

        let seq = self.sequence.next();
        let request = AddressRequest::new(&address, resources.if_index, self.clock.now_ms());
        let message = new_address_message(seq, &request);
        match resources.route_socket.send(&message, seq) {
            Ok(()) => {}
            Err(KernelError::AlreadyPresent) => {
                debug!(address = %address, seq, "Address already present");
            }
            Err(e) => {
                error!(address = %address, seq, error = %e, "Failed to add address");
                return;
            }
        }

        let route = self.route_for_address(&address);
        self.link_properties.add_address(address);
        self.link_properties.add_route(route);
    }

    /// The mirror forgets the address before the kernel request goes out:
    /// the daemon no longer has it, whatever the kernel answers.
    fn remove_address(&mut self, address: &LinkAddress) {
        debug!(address = %address, "Removing address");
        let route = self.route_for_address(address);
        self.link_properties.remove_address(address);
        self.link_properties.remove_route(&route);

        let Some(resources) = self.resources.as_mut() else {
            return;
        };
        let seq = self.sequence.next();
        let message =
            del_address_message(seq, address.address, address.prefix_len, resources.if_index);
        match resources.route_socket.send(&message, seq) {
            Ok(()) => {}
            Err(KernelError::NotPresent) => {
                debug!(address = %address, seq, "Address already gone");
            }
            Err(e) => {
                error!(address = %address, seq, error = %e, "Failed to remove address");
            }
        }
    }

    fn join_group(&self, group: &Ipv6Addr) {
        let Some(resources) = self.resources.as_ref() else {
            return;
        };
        if let Err(e) = resources.multicast.join(group) {
            error!(group = %group, error = %e, "Failed to join multicast group");
        }
    }

    fn leave_group(&self, group: &Ipv6Addr) {
        let Some(resources) = self.resources.as_ref() else {
            return;
        };
        match resources.multicast.leave(group) {
            Ok(()) => {}
            Err(KernelError::NotPresent) => {
                debug!(group = %group, "Multicast group already left");
            }
            Err(e) => {
                error!(group = %group, error = %e, "Failed to leave multicast group");
            }
        }
    }
}

/// Mesh-local and OMR addresses share a scope; while an OMR address is
/// active the mesh-local one is deprecated so only one is preferred.
fn link_address_for(entry: &AddressEntry, has_active_omr: bool, now_ms: i64) -> LinkAddress {
    let preferred = entry.is_preferred && !(entry.is_mesh_local && has_active_omr);
    let deprecation = if preferred {
        Lifetime::Permanent
    } else {
        Lifetime::At(now_ms)
    };
    LinkAddress::new(
        entry.address,
        entry.prefix_len,
        deprecation,
        Lifetime::Permanent,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: &str, mesh_local: bool, omr: bool, preferred: bool) -> AddressEntry {
        AddressEntry {
            address: addr.parse().unwrap(),
            prefix_len: 64,
            is_mesh_local: mesh_local,
            is_active_omr: omr,
            is_preferred: preferred,
        }
    }

    #[test]
    fn test_preferred_address_is_permanent() {
        let addr = link_address_for(&entry("fd00::1", false, false, true), false, 100);
        assert_eq!(addr.deprecation, Lifetime::Permanent);
        assert_eq!(addr.expiration, Lifetime::Permanent);
    }

    #[test]
    fn test_non_preferred_address_deprecated_now() {
        let addr = link_address_for(&entry("fd00::1", false, false, false), false, 100);
        assert_eq!(addr.deprecation, Lifetime::At(100));
        assert_eq!(addr.expiration, Lifetime::Permanent);
    }

    #[test]
    fn test_mesh_local_deprecated_while_omr_active() {
        let mesh_local = entry("fd00::1", true, false, true);
        let addr = link_address_for(&mesh_local, true, 100);
        assert!(addr.is_deprecated());

        let addr = link_address_for(&mesh_local, false, 100);
        assert!(!addr.is_deprecated());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ControllerState::Destroyed.to_string(), "destroyed");
    }
}
