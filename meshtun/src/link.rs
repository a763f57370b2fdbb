//! Address, route and link-properties model mirrored by the controller.

use crate::lifetime::Lifetime;
use ipnet::Ipv6Net;
use std::fmt;
use std::net::Ipv6Addr;

/// Default link MTU of the mesh interface and its routes.
pub const MTU: u32 = 1280;

// ifa_flags
pub const IFA_F_DEPRECATED: u32 = 0x20;
pub const IFA_F_PERMANENT: u32 = 0x80;

/// rtnetlink address scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Universe,
    Site,
    Link,
    Host,
}

impl Scope {
    /// Scope the kernel would assign to a unicast address.
    pub fn for_address(addr: &Ipv6Addr) -> Self {
        if addr.is_loopback() {
            Scope::Host
        } else if addr.is_unicast_link_local() {
            Scope::Link
        } else {
            Scope::Universe
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Scope::Universe => 0,
            Scope::Site => 200,
            Scope::Link => 253,
            Scope::Host => 254,
        }
    }
}

/// An IPv6 address assigned to the interface, including the kernel-facing
/// metadata. Two addresses are the same entry only if every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkAddress {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub flags: u32,
    pub scope: Scope,
    pub deprecation: Lifetime,
    pub expiration: Lifetime,
}

impl LinkAddress {
    /// Build an address whose flags and scope follow from the address and
    /// its lifetimes.
    pub fn new(
        address: Ipv6Addr,
        prefix_len: u8,
        deprecation: Lifetime,
        expiration: Lifetime,
    ) -> Self {
        let mut flags = 0;
        if deprecation.is_finite() {
            flags |= IFA_F_DEPRECATED;
        }
        if !deprecation.is_finite() && !expiration.is_finite() {
            flags |= IFA_F_PERMANENT;
        }
        Self {
            address,
            prefix_len,
            flags,
            scope: Scope::for_address(&address),
            deprecation,
            expiration,
        }
    }

    pub fn is_deprecated(&self) -> bool {
        self.deprecation.is_finite()
    }

    /// Network prefix this address lives in.
    pub fn network(&self) -> Ipv6Net {
        prefix_net(self.address, self.prefix_len)
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Masked network for `addr/prefix_len`. Lengths above 128 are clamped.
pub fn prefix_net(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Net {
    let prefix_len = prefix_len.min(128);
    match Ipv6Net::new(addr, prefix_len) {
        Ok(net) => net.trunc(),
        Err(_) => Ipv6Net::default(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    Unicast,
}

/// A route through the mesh interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub destination: Ipv6Net,
    pub interface: String,
    pub route_type: RouteType,
    pub mtu: u32,
}

impl Route {
    pub fn unicast(destination: Ipv6Net, interface: &str, mtu: u32) -> Self {
        Self {
            destination,
            interface: interface.to_string(),
            route_type: RouteType::Unicast,
            mtu,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev {} mtu {}", self.destination, self.interface, self.mtu)
    }
}

/// Read-only view of what has been requested for the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkProperties {
    pub interface_name: String,
    pub mtu: u32,
    addresses: Vec<LinkAddress>,
    routes: Vec<Route>,
}

impl LinkProperties {
    pub fn new(interface_name: &str, mtu: u32) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            mtu,
            addresses: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn addresses(&self) -> &[LinkAddress] {
        &self.addresses
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// An entry with the same address and prefix length is replaced in
    /// place. Returns false if nothing changed.
    pub fn add_address(&mut self, address: LinkAddress) -> bool {
        match self
            .addresses
            .iter_mut()
            .find(|a| a.address == address.address && a.prefix_len == address.prefix_len)
        {
            Some(existing) if *existing == address => false,
            Some(existing) => {
                *existing = address;
                true
            }
            None => {
                self.addresses.push(address);
                true
            }
        }
    }

    pub fn remove_address(&mut self, address: &LinkAddress) -> bool {
        let before = self.addresses.len();
        self.addresses.retain(|a| a != address);
        self.addresses.len() != before
    }

    pub fn add_route(&mut self, route: Route) -> bool {
        if self.routes.contains(&route) {
            return false;
        }
        self.routes.push(route);
        true
    }

    pub fn remove_route(&mut self, route: &Route) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r != route);
        self.routes.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_from_address() {
        assert_eq!(Scope::for_address(&Ipv6Addr::LOCALHOST), Scope::Host);
        assert_eq!(Scope::for_address(&"fe80::1".parse().unwrap()), Scope::Link);
        assert_eq!(
            Scope::for_address(&"fd00:db8::1".parse().unwrap()),
            Scope::Universe
        );
    }

    #[test]
    fn test_flags_follow_lifetimes() {
        let addr: Ipv6Addr = "fd00::1".parse().unwrap();
        let permanent = LinkAddress::new(addr, 64, Lifetime::Permanent, Lifetime::Permanent);
        assert_eq!(permanent.flags, IFA_F_PERMANENT);
        assert!(!permanent.is_deprecated());

        let deprecated = LinkAddress::new(addr, 64, Lifetime::At(10), Lifetime::Permanent);
        assert_eq!(deprecated.flags, IFA_F_DEPRECATED);
        assert!(deprecated.is_deprecated());
        assert_ne!(permanent, deprecated);
    }

    #[test]
    fn test_network_is_masked() {
        let addr = LinkAddress::new(
            "fd00:1:2:3:4:5:6:7".parse().unwrap(),
            64,
            Lifetime::Permanent,
            Lifetime::Permanent,
        );
        assert_eq!(addr.network().to_string(), "fd00:1:2:3::/64");
    }

    #[test]
    fn test_add_address_replaces_same_prefix() {
        let addr: Ipv6Addr = "fd00::1".parse().unwrap();
        let permanent = LinkAddress::new(addr, 64, Lifetime::Permanent, Lifetime::Permanent);
        let deprecated = LinkAddress::new(addr, 64, Lifetime::At(10), Lifetime::Permanent);
        let other_len = LinkAddress::new(addr, 128, Lifetime::Permanent, Lifetime::Permanent);

        let mut lp = LinkProperties::new("wpan0", MTU);
        assert!(lp.add_address(permanent.clone()));
        assert!(!lp.add_address(permanent));
        assert!(lp.add_address(deprecated.clone()));
        assert_eq!(lp.addresses(), &[deprecated.clone()]);
        assert!(lp.add_address(other_len.clone()));
        assert_eq!(lp.addresses(), &[deprecated, other_len]);
    }

    #[test]
    fn test_link_properties_set_semantics() {
        let mut lp = LinkProperties::new("wpan0", MTU);
        let route = Route::unicast("fd00::/64".parse().unwrap(), "wpan0", MTU);
        assert!(lp.add_route(route.clone()));
        assert!(!lp.add_route(route.clone()));
        assert_eq!(lp.routes().len(), 1);
        assert!(lp.remove_route(&route));
        assert!(!lp.remove_route(&route));
        assert!(lp.routes().is_empty());
    }
}
