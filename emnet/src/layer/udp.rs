//! Stateless UDP port dispatch.
//!
//! The registry is a short list of `(port, handler)` pairs assembled when the stack is set up and
//! scanned linearly for every datagram. A datagram to a port without a handler is dropped without
//! notice.
use alloc::vec::Vec;

use crate::buf::Pbuf;
use crate::stack::Io;
use crate::wire::checksum;
use crate::wire::udp;
use crate::wire::{IpProtocol, Ipv4Address};

use super::ip::{self, Packet};
use super::netif::NetifFlags;
use super::{Error, Result};

/// The headroom a UDP payload needs for all headers.
pub const HEADROOM: usize = ip::HEADROOM + udp::HEADER_LEN;

/// A handler for datagrams to one port.
pub type Handler = fn(&mut Datagram);

/// A received datagram.
///
/// The handler may take the payload buffer to keep it. It answers by handing a payload buffer,
/// allocated with [`HEADROOM`], to [`respond`].
///
/// [`HEADROOM`]: constant.HEADROOM.html
/// [`respond`]: #method.respond
#[derive(Debug)]
pub struct Datagram {
    src_addr: Ipv4Address,
    src_port: u16,
    dst_addr: Ipv4Address,
    dst_port: u16,
    payload: Option<Pbuf>,
    reply: Option<Pbuf>,
}

/// The table of local ports.
#[derive(Default)]
pub struct Registry {
    entries: Vec<(u16, Handler)>,
}

impl Datagram {
    /// The sender address.
    pub fn src_addr(&self) -> Ipv4Address {
        self.src_addr
    }

    /// The sender port.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// The destination address, ours or a group.
    pub fn dst_addr(&self) -> Ipv4Address {
        self.dst_addr
    }

    /// The local port.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// The payload, unless it was taken.
    pub fn payload(&self) -> Option<&Pbuf> {
        self.payload.as_ref()
    }

    /// Take ownership of the payload.
    pub fn take_payload(&mut self) -> Option<Pbuf> {
        self.payload.take()
    }

    /// Send `payload` back to the sender once the handler returns.
    pub fn respond(&mut self, payload: Pbuf) {
        self.reply = Some(payload);
    }
}

impl Registry {
    /// Build the table from a list of ports and handlers.
    pub fn new(entries: &[(u16, Handler)]) -> Self {
        Registry { entries: entries.to_vec() }
    }

    /// Add a handler for a port not yet in the table.
    pub fn register(&mut self, port: u16, handler: Handler) -> Result<()> {
        if port == 0 || self.lookup(port).is_some() {
            return Err(Error::Illegal);
        }
        self.entries.push((port, handler));
        Ok(())
    }

    /// Find the handler of a port.
    pub fn lookup(&self, port: u16) -> Option<Handler> {
        self.entries.iter()
            .find(|&&(entry, _)| entry == port)
            .map(|&(_, handler)| handler)
    }

    /// The number of registered ports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no port is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validate a datagram and dispatch it to the handler of its port.
pub(crate) fn input(io: &mut Io, registry: &Registry, packet: Packet) {
    let Packet { netif, repr, pb } = packet;
    let flags = match io.netifs.get(netif.0) {
        Some(iface) => iface.flags,
        None => return,
    };

    let mut pb = match pb.pullup(udp::HEADER_LEN) {
        Some(pb) => pb,
        None => return count(io, netif, |stats| stats.malformed += 1),
    };

    let header = udp::udp::new_unchecked(pb.data());
    let (src_port, dst_port, len, sum) =
        (header.src_port(), header.dst_port(), usize::from(header.len()), header.checksum());

    if len < udp::HEADER_LEN || len > pb.pktlen() {
        net_trace!("udp: bad length {} of {} bytes", len, pb.pktlen());
        return count(io, netif, |stats| stats.malformed += 1);
    }
    let excess = pb.pktlen() - len;
    pb.trim(excess);

    if sum != 0 && flags.checksum(NetifFlags::UDP_RX_CSUM).manual() {
        let pseudo = checksum::pseudo_header(repr.src_addr, repr.dst_addr, IpProtocol::Udp, len as u16);
        if pb.checksum(0, len, pseudo) != !0 {
            net_trace!("udp: bad checksum from {}:{}", repr.src_addr, src_port);
            return count(io, netif, |stats| stats.checksum_errors += 1);
        }
    }

    let handler = match registry.lookup(dst_port) {
        Some(handler) => handler,
        None => {
            net_trace!("udp: no handler for port {}", dst_port);
            return count(io, netif, |stats| stats.unknown += 1);
        },
    };

    let mut datagram = Datagram {
        src_addr: repr.src_addr,
        src_port,
        dst_addr: repr.dst_addr,
        dst_port,
        payload: pb.drop_head(udp::HEADER_LEN),
        reply: None,
    };
    handler(&mut datagram);

    if let Some(reply) = datagram.reply.take() {
        if let Err(_err) = send(io, dst_port, repr.src_addr, src_port, reply) {
            net_debug!("udp: reply to {}:{} failed: {}", repr.src_addr, src_port, _err);
        }
    }
}

/// Prepend a UDP header to `payload` and send it.
pub(crate) fn send(
    io: &mut Io,
    src_port: u16,
    dst_addr: Ipv4Address,
    dst_port: u16,
    payload: Pbuf,
) -> Result<()> {
    let len = udp::HEADER_LEN + payload.pktlen();
    if len > usize::from(u16::max_value()) {
        return Err(Error::BadSize);
    }

    let route = ip::route(io, dst_addr)?;
    let flags = io.netifs.get(route.netif.0)
        .map(|iface| iface.flags)
        .ok_or(Error::Unreachable)?;

    let mut pb = payload.prepend(udp::HEADER_LEN).ok_or(Error::BadSize)?;
    {
        let header = udp::udp::new_unchecked_mut(pb.data_mut());
        header.set_src_port(src_port);
        header.set_dst_port(dst_port);
        header.set_len(len as u16);
        header.set_checksum(0);
    }

    if flags.checksum(NetifFlags::UDP_TX_CSUM).manual() {
        let pseudo = checksum::pseudo_header(route.src_addr, dst_addr, IpProtocol::Udp, len as u16);
        let sum = !pb.checksum(0, len, pseudo);
        udp::udp::new_unchecked_mut(pb.data_mut())
            .set_checksum(if sum == 0 { 0xffff } else { sum });
    }

    ip::output(io, &route, IpProtocol::Udp, dst_addr, ip::DEFAULT_HOP_LIMIT, pb)
}

/// Copy `data` into a fresh buffer and send it as one datagram.
pub(crate) fn send_slice(
    io: &mut Io,
    src_port: u16,
    dst_addr: Ipv4Address,
    dst_port: u16,
    data: &[u8],
) -> Result<()> {
    let payload = io.pool.alloc_from(HEADROOM, data).ok_or(Error::Exhausted)?;
    send(io, src_port, dst_addr, dst_port, payload)
}

fn count(io: &mut Io, netif: super::NetifId, update: impl FnOnce(&mut super::NetifStats)) {
    if let Some(iface) = io.netifs.get_mut(netif.0) {
        update(&mut iface.stats)
    }
}
