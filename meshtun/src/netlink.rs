//! rtnetlink address messages and the route socket they are written to.

use crate::error::KernelError;
use crate::lifetime::to_relative_lifetime;
use crate::link::LinkAddress;
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage,
    NetlinkPayload,
};
use netlink_packet_route::address::{
    AddressAttribute, AddressFlags, AddressHeaderFlags, AddressMessage, AddressScope, CacheInfo,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Upper bound on queued replies drained after a single request.
const MAX_ACK_READS: usize = 16;

/// Sequence numbers for netlink requests.
///
/// One counter is shared by every controller in the process; clones share
/// the same underlying counter.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU32>);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Everything an RTM_NEWADDR request carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub flags: u32,
    pub scope: u8,
    pub if_index: u32,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

impl AddressRequest {
    /// The preferred lifetime runs until deprecation, the valid lifetime
    /// until expiration.
    pub fn new(address: &LinkAddress, if_index: u32, now_ms: i64) -> Self {
        Self {
            address: address.address,
            prefix_len: address.prefix_len,
            flags: address.flags,
            scope: address.scope.as_raw(),
            if_index,
            valid_lifetime: to_relative_lifetime(address.expiration, now_ms),
            preferred_lifetime: to_relative_lifetime(address.deprecation, now_ms),
        }
    }
}

/// Encode an RTM_NEWADDR request (create or replace).
pub fn new_address_message(seq: u32, request: &AddressRequest) -> Vec<u8> {
    let mut message = AddressMessage::default();
    message.header.family = AddressFamily::Inet6;
    message.header.prefix_len = request.prefix_len;
    message.header.flags = AddressHeaderFlags::from_bits_retain(request.flags as u8);
    message.header.scope = AddressScope::from(request.scope);
    message.header.index = request.if_index;
    message
        .attributes
        .push(AddressAttribute::Address(IpAddr::V6(request.address)));
    let mut cache_info = CacheInfo::default();
    cache_info.ifa_preferred = request.preferred_lifetime;
    cache_info.ifa_valid = request.valid_lifetime;
    message
        .attributes
        .push(AddressAttribute::CacheInfo(cache_info));
    message
        .attributes
        .push(AddressAttribute::Flags(AddressFlags::from_bits_retain(
            request.flags,
        )));

    serialize(
        seq,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        RouteNetlinkMessage::NewAddress(message),
    )
}

/// Encode an RTM_DELADDR request.
pub fn del_address_message(seq: u32, address: Ipv6Addr, prefix_len: u8, if_index: u32) -> Vec<u8> {
    let mut message = AddressMessage::default();
    message.header.family = AddressFamily::Inet6;
    message.header.prefix_len = prefix_len;
    message.header.index = if_index;
    message
        .attributes
        .push(AddressAttribute::Address(IpAddr::V6(address)));

    serialize(
        seq,
        NLM_F_REQUEST | NLM_F_ACK,
        RouteNetlinkMessage::DelAddress(message),
    )
}

fn serialize(seq: u32, flags: u16, payload: RouteNetlinkMessage) -> Vec<u8> {
    let mut message = NetlinkMessage::new(
        NetlinkHeader::default(),
        NetlinkPayload::InnerMessage(payload),
    );
    message.header.flags = flags;
    message.header.sequence_number = seq;
    message.finalize();

    let mut buf = vec![0u8; message.buffer_len()];
    message.serialize(&mut buf);
    buf
}

/// Something netlink requests can be written to.
pub trait NetlinkTransport: Send {
    /// Write one complete request. Short writes are failures.
    fn send(&mut self, message: &[u8], seq: u32) -> Result<(), KernelError>;
}

/// NETLINK_ROUTE socket owned by one controller.
pub struct RouteSocket {
    socket: Socket,
}

impl RouteSocket {
    pub fn open() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(Self { socket })
    }

    /// rtnetlink handles requests in the sender's context, so the reply for
    /// `seq` is already queued when `send` returns.
    fn read_ack(&self, seq: u32) -> Result<(), KernelError> {
        for _ in 0..MAX_ACK_READS {
            let mut buf = Vec::with_capacity(4096);
            match self.socket.recv(&mut buf, libc::MSG_DONTWAIT) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(KernelError::from_io(e)),
            }

            let reply = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(seq, error = %e, "Undecodable netlink reply");
                    continue;
                }
            };
            if reply.header.sequence_number != seq {
                continue;
            }
            if let NetlinkPayload::Error(err) = reply.payload {
                if let Some(code) = err.code {
                    return Err(KernelError::from_io(io::Error::from_raw_os_error(
                        -code.get(),
                    )));
                }
            }
            return Ok(());
        }
        Ok(())
    }
}

impl NetlinkTransport for RouteSocket {
    fn send(&mut self, message: &[u8], seq: u32) -> Result<(), KernelError> {
        let written = self.socket.send(message, 0).map_err(KernelError::from_io)?;
        if written != message.len() {
            return Err(KernelError::PartialWrite {
                written,
                expected: message.len(),
            });
        }
        self.read_ack(seq)
    }
}

/// Fields of an encoded address request, for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedAddressMessage {
    pub message_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub family: u8,
    pub prefix_len: u8,
    pub ifa_flags: u8,
    pub scope: u8,
    pub if_index: u32,
    pub address: Option<Ipv6Addr>,
    /// (preferred, valid) from IFA_CACHEINFO.
    pub lifetimes: Option<(u32, u32)>,
    pub extended_flags: Option<u32>,
}

const NLMSG_HDRLEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const IFA_ADDRESS: u16 = 1;
const IFA_CACHEINFO: u16 = 6;
const IFA_FLAGS: u16 = 8;

/// Parse the fixed headers and the attributes this crate emits.
///
/// Reads raw offsets (nlmsghdr, ifaddrmsg, rtattr) instead of going through
/// `netlink-packet-route`, so it checks the encoder's wire layout
/// independently of the crate that produced it.
pub fn decode_address_message(buf: &[u8]) -> Option<DecodedAddressMessage> {
    if buf.len() < NLMSG_HDRLEN + IFADDRMSG_LEN {
        return None;
    }
    let u16_at = |i: usize| u16::from_ne_bytes([buf[i], buf[i + 1]]);
    let u32_at = |i: usize| u32::from_ne_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

    let total = (u32_at(0) as usize).min(buf.len());
    let mut decoded = DecodedAddressMessage {
        message_type: u16_at(4),
        flags: u16_at(6),
        seq: u32_at(8),
        family: buf[16],
        prefix_len: buf[17],
        ifa_flags: buf[18],
        scope: buf[19],
        if_index: u32_at(20),
        ..Default::default()
    };

    let mut offset = NLMSG_HDRLEN + IFADDRMSG_LEN;
    while offset + 4 <= total {
        let len = u16_at(offset) as usize;
        let kind = u16_at(offset + 2);
        if len < 4 || offset + len > total {
            break;
        }
        let data = &buf[offset + 4..offset + len];
        match kind {
            IFA_ADDRESS if data.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(data);
                decoded.address = Some(Ipv6Addr::from(octets));
            }
            IFA_CACHEINFO if data.len() >= 8 => {
                decoded.lifetimes = Some((u32_at(offset + 4), u32_at(offset + 8)));
            }
            IFA_FLAGS if data.len() >= 4 => {
                decoded.extended_flags = Some(u32_at(offset + 4));
            }
            _ => {}
        }
        offset += (len + 3) & !3;
    }
    Some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::{INFINITE_LIFETIME, Lifetime};
    use crate::link::{IFA_F_DEPRECATED, IFA_F_PERMANENT};

    const RTM_NEWADDR: u16 = 20;
    const RTM_DELADDR: u16 = 21;
    const AF_INET6: u8 = 10;

    fn addr() -> Ipv6Addr {
        "fd00:db8::1234".parse().unwrap()
    }

    #[test]
    fn test_sequence_counter_shared_between_clones() {
        let a = SequenceCounter::new();
        let b = a.clone();
        assert_eq!(a.next(), 0);
        assert_eq!(b.next(), 1);
        assert_eq!(a.next(), 2);
    }

    #[test]
    fn test_new_address_message_layout() {
        let link = LinkAddress::new(addr(), 64, Lifetime::Permanent, Lifetime::Permanent);
        let request = AddressRequest::new(&link, 7, 0);
        let buf = new_address_message(42, &request);
        let msg = decode_address_message(&buf).unwrap();

        assert_eq!(msg.message_type, RTM_NEWADDR);
        assert_eq!(
            msg.flags,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE
        );
        assert_eq!(msg.seq, 42);
        assert_eq!(msg.family, AF_INET6);
        assert_eq!(msg.prefix_len, 64);
        assert_eq!(msg.ifa_flags, IFA_F_PERMANENT as u8);
        assert_eq!(msg.scope, 0);
        assert_eq!(msg.if_index, 7);
        assert_eq!(msg.address, Some(addr()));
        assert_eq!(msg.lifetimes, Some((INFINITE_LIFETIME, INFINITE_LIFETIME)));
        assert_eq!(msg.extended_flags, Some(IFA_F_PERMANENT));
        assert_eq!(buf.len() % 4, 0);
    }

    #[test]
    fn test_deprecated_address_has_zero_preferred_lifetime() {
        let now = 50_000;
        let link = LinkAddress::new(addr(), 64, Lifetime::At(now), Lifetime::Permanent);
        let request = AddressRequest::new(&link, 3, now);
        assert_eq!(request.preferred_lifetime, 0);
        assert_eq!(request.valid_lifetime, INFINITE_LIFETIME);

        let msg = decode_address_message(&new_address_message(1, &request)).unwrap();
        assert_eq!(msg.lifetimes, Some((0, INFINITE_LIFETIME)));
        assert_eq!(msg.ifa_flags, IFA_F_DEPRECATED as u8);
    }

    #[test]
    fn test_link_local_scope_on_wire() {
        let link = LinkAddress::new(
            "fe80::1".parse().unwrap(),
            64,
            Lifetime::Permanent,
            Lifetime::Permanent,
        );
        let msg =
            decode_address_message(&new_address_message(0, &AddressRequest::new(&link, 1, 0)))
                .unwrap();
        assert_eq!(msg.scope, 253);
    }

    #[test]
    fn test_del_address_message_layout() {
        let buf = del_address_message(9, addr(), 128, 11);
        let msg = decode_address_message(&buf).unwrap();

        assert_eq!(msg.message_type, RTM_DELADDR);
        assert_eq!(msg.flags, NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(msg.seq, 9);
        assert_eq!(msg.family, AF_INET6);
        assert_eq!(msg.prefix_len, 128);
        assert_eq!(msg.if_index, 11);
        assert_eq!(msg.address, Some(addr()));
        assert_eq!(msg.lifetimes, None);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(decode_address_message(&[0u8; 10]).is_none());
    }

    /// Needs CAP_NET_ADMIN; returns early without it.
    #[test]
    fn test_route_socket_classifies_acks_on_loopback() {
        let Ok(mut socket) = RouteSocket::open() else {
            return;
        };
        let Ok(lo) = crate::tun::interface_index("lo") else {
            return;
        };
        let address: Ipv6Addr = "fd00:5eed::1".parse().unwrap();
        let sequence = SequenceCounter::new();

        let delete = |socket: &mut RouteSocket| {
            let seq = sequence.next();
            socket.send(&del_address_message(seq, address, 128, lo), seq)
        };
        let add = |socket: &mut RouteSocket| {
            let link = LinkAddress::new(address, 128, Lifetime::Permanent, Lifetime::Permanent);
            let seq = sequence.next();
            socket.send(
                &new_address_message(seq, &AddressRequest::new(&link, lo, 0)),
                seq,
            )
        };

        match delete(&mut socket) {
            Ok(()) | Err(KernelError::NotPresent) => {}
            Err(KernelError::Io(_)) => return,
            other => panic!("unexpected reply: {other:?}"),
        }
        match add(&mut socket) {
            Ok(()) => {}
            Err(KernelError::Io(_)) => return,
            other => panic!("unexpected reply: {other:?}"),
        }

        assert!(add(&mut socket).is_ok(), "replace of an existing address");
        assert!(delete(&mut socket).is_ok());
        assert!(matches!(delete(&mut socket), Err(KernelError::NotPresent)));
    }
}
