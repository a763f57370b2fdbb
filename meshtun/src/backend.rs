//! Kernel collaborators the controller needs, behind one seam.

use crate::multicast::{GroupSocket, open_group_socket};
use crate::netlink::{NetlinkTransport, RouteSocket};
use crate::tun;
use std::io;

/// Opens the controller's kernel resources and toggles link state.
pub trait LinkBackend: Send {
    type Route: NetlinkTransport;
    type Groups: GroupSocket;

    fn interface_index(&self, name: &str) -> io::Result<u32>;

    fn open_route_socket(&self) -> io::Result<Self::Route>;

    fn open_group_socket(&self, if_index: u32) -> io::Result<Self::Groups>;

    fn set_link_up(&self, name: &str, up: bool) -> io::Result<()>;
}

/// The running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl LinkBackend for SystemBackend {
    type Route = RouteSocket;
    type Groups = socket2::Socket;

    fn interface_index(&self, name: &str) -> io::Result<u32> {
        tun::interface_index(name)
    }

    fn open_route_socket(&self) -> io::Result<RouteSocket> {
        RouteSocket::open()
    }

    fn open_group_socket(&self, if_index: u32) -> io::Result<socket2::Socket> {
        open_group_socket(if_index)
    }

    fn set_link_up(&self, name: &str, up: bool) -> io::Result<()> {
        tun::set_link_up(name, up)
    }
}
