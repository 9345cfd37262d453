//! The IPv4 layer.
//!
//! Only the plain 20-byte header is accepted, packets with options or fragments are dropped. There
//! is no routing table: a destination is either on the prefix of an attached interface, reached
//! through its next-hop entry, or a broadcast or multicast address mapped directly onto a link
//! address.
use rand::Rng;

use crate::buf::{Flags, Pbuf};
use crate::managed::Key;
use crate::stack::Io;
use crate::wire::ipv4::{self, Repr};
use crate::wire::{EthernetAddress, EthernetProtocol, IpProtocol, Ipv4Address};

use super::netif::{self, NetifFlags, NetifId};
use super::{eth, Error, Result};

/// The headroom a buffer needs for the IPv4 and Ethernet headers.
pub const HEADROOM: usize = eth::HEADROOM + ipv4::HEADER_LEN;

/// The hop limit of all packets we originate, except IGMP.
pub const DEFAULT_HOP_LIMIT: u8 = 255;

/// A validated packet, its header already dropped from the buffer.
pub(crate) struct Packet {
    pub(crate) netif: NetifId,
    pub(crate) repr: Repr,
    pub(crate) pb: Pbuf,
}

/// How to reach the link address of a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Link {
    /// Through the next-hop table.
    Nexthop(Key),
    /// A fixed group or broadcast address.
    Direct(EthernetAddress),
}

/// The outcome of a route lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) netif: NetifId,
    /// The address of the outgoing interface.
    pub(crate) src_addr: Ipv4Address,
    pub(crate) link: Link,
}

/// Validate the IPv4 header of a packet and strip it.
pub(crate) fn input(io: &mut Io, netif: NetifId, pb: Pbuf) -> Option<Packet> {
    let iface = io.netifs.get_mut(netif.0)?;
    let mut pb = match pb.pullup(ipv4::HEADER_LEN) {
        Some(pb) => pb,
        None => {
            iface.stats.malformed += 1;
            return None;
        },
    };

    let header = ipv4::ipv4::new_unchecked(pb.data());
    if header.ver_ihl() != ipv4::VER_IHL {
        net_trace!("ip: unsupported version or options 0x{:02x}", header.ver_ihl());
        iface.stats.malformed += 1;
        return None;
    }

    if iface.flags.checksum(NetifFlags::IPV4_RX_CSUM).manual() && !header.verify_checksum() {
        net_trace!("ip: bad header checksum");
        iface.stats.checksum_errors += 1;
        return None;
    }

    if header.is_fragment() {
        net_trace!("ip: dropping fragment");
        iface.stats.malformed += 1;
        return None;
    }

    let repr = match Repr::parse(header) {
        Ok(repr) => repr,
        Err(_) => {
            iface.stats.malformed += 1;
            return None;
        },
    };

    let total = ipv4::HEADER_LEN + repr.payload_len;
    if total > pb.pktlen() {
        net_trace!("ip: truncated packet, {} of {} bytes", pb.pktlen(), total);
        iface.stats.malformed += 1;
        return None;
    }
    let excess = pb.pktlen() - total;
    pb.trim(excess);

    let dst = repr.dst_addr;
    if dst.is_broadcast() || iface.is_directed_broadcast(dst) {
        pb.insert_flags(Flags::BCAST);
    } else if dst.is_multicast() {
        pb.insert_flags(Flags::MCAST);
    } else if dst != iface.address() {
        net_trace!("ip: packet for {} ignored", dst);
        iface.stats.not_for_us += 1;
        return None;
    }

    let pb = pb.drop_head(ipv4::HEADER_LEN)?;
    Some(Packet { netif, repr, pb })
}

/// Choose the interface, source address and link address for `dst`.
pub(crate) fn route(io: &mut Io, dst: Ipv4Address) -> Result<Route> {
    let direct = if dst.is_broadcast() {
        io.netifs.iter()
            .next()
            .map(|(key, iface)| (key, iface.address(), EthernetAddress::BROADCAST))
    } else if dst.is_multicast() {
        io.netifs.iter()
            .next()
            .map(|(key, iface)| (key, iface.address(), EthernetAddress::from_ipv4_multicast(dst)))
    } else {
        io.netifs.iter()
            .find(|(_, iface)| iface.is_directed_broadcast(dst))
            .map(|(key, iface)| (key, iface.address(), EthernetAddress::BROADCAST))
    };

    if let Some((key, src_addr, hw_addr)) = direct {
        return Ok(Route {
            netif: NetifId(key),
            src_addr,
            link: Link::Direct(hw_addr),
        });
    }

    if dst.is_broadcast() || dst.is_multicast() || dst.is_unspecified() {
        return Err(Error::Unreachable);
    }

    let nexthop = netif::resolve(io, dst)?;
    let netif = netif::netif_of(io, nexthop).ok_or(Error::Unreachable)?;
    let src_addr = io.netifs.get(netif.0)
        .map(|iface| iface.address())
        .ok_or(Error::Unreachable)?;

    Ok(Route {
        netif,
        src_addr,
        link: Link::Nexthop(nexthop),
    })
}

/// The largest IPv4 payload the interface owning `addr` can send in one frame.
pub(crate) fn payload_mtu(io: &Io, addr: Ipv4Address) -> Option<usize> {
    io.netifs.iter()
        .find(|(_, iface)| iface.address() == addr)
        .map(|(_, iface)| iface.config.mtu.saturating_sub(ipv4::HEADER_LEN))
}

/// Prepend an IPv4 header to `pb` and send it along `route`.
pub(crate) fn output(
    io: &mut Io,
    route: &Route,
    protocol: IpProtocol,
    dst_addr: Ipv4Address,
    hop_limit: u8,
    pb: Pbuf,
) -> Result<()> {
    let ident: u16 = io.rng.gen();
    let iface = io.netifs.get(route.netif.0).ok_or(Error::Unreachable)?;

    let payload_len = pb.pktlen();
    if ipv4::HEADER_LEN + payload_len > iface.config.mtu {
        net_debug!("ip: {} bytes exceed the mtu", ipv4::HEADER_LEN + payload_len);
        return Err(Error::BadSize);
    }

    let checksum = iface.flags.checksum(NetifFlags::IPV4_TX_CSUM);
    let mut pb = pb.prepend(ipv4::HEADER_LEN).ok_or(Error::BadSize)?;

    Repr {
        src_addr: route.src_addr,
        dst_addr,
        protocol,
        payload_len,
        hop_limit,
        ident,
        dont_frag: true,
    }.emit(ipv4::ipv4::new_unchecked_mut(pb.data_mut()), checksum);

    match route.link {
        Link::Nexthop(key) => netif::output(io, key, pb),
        Link::Direct(hw_addr) => eth::output(io, route.netif, hw_addr, EthernetProtocol::Ipv4, pb),
    }
}

/// Route and send a packet with the default hop limit.
pub(crate) fn send(io: &mut Io, protocol: IpProtocol, dst_addr: Ipv4Address, pb: Pbuf) -> Result<()> {
    let route = route(io, dst_addr)?;
    output(io, &route, protocol, dst_addr, DEFAULT_HOP_LIMIT, pb)
}
