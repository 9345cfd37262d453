//! Address resolution for IPv4 over Ethernet.
//!
//! As noted in RFC 826, ARP assumes that the mapping of the own host is fully known. We answer
//! requests for our address by rewriting the request buffer in place and learn from every reply,
//! and every request, whose sender we already track as a next-hop. We never create next-hops from
//! received packets, the cache only holds hosts we are sending to.
use crate::buf::Pbuf;
use crate::stack::Io;
use crate::wire::arp::{self, Operation, Repr};
use crate::wire::{EthernetAddress, EthernetProtocol, Ipv4Address};

use super::netif::{self, NetifId};
use super::{eth, Error, Result};

/// Handle a received ARP packet.
pub(crate) fn input(io: &mut Io, netif: NetifId, pb: Pbuf) {
    let mut pb = match pb.pullup(arp::PACKET_LEN) {
        Some(pb) => pb,
        None => return count_malformed(io, netif),
    };

    let repr = match Repr::parse(arp::arp::new_unchecked(pb.data())) {
        Ok(repr) => repr,
        Err(_err) => {
            net_trace!("arp: dropping packet: {}", _err);
            return count_malformed(io, netif);
        },
    };

    let our_addr = match io.netifs.get(netif.0) {
        Some(iface) => iface.address(),
        None => return,
    };

    // Probes for address conflict detection carry no sender address.
    if !repr.source_protocol_addr.is_unspecified() {
        netif::learn(io, repr.source_protocol_addr, repr.source_hardware_addr);
    }

    if repr.operation != Operation::Request || repr.target_protocol_addr != our_addr {
        return;
    }

    let hw_addr = match io.netifs.get(netif.0) {
        Some(iface) => iface.config.hw_addr,
        None => return,
    };

    let reply = Repr {
        operation: Operation::Reply,
        source_hardware_addr: hw_addr,
        source_protocol_addr: our_addr,
        target_hardware_addr: repr.source_hardware_addr,
        target_protocol_addr: repr.source_protocol_addr,
    };

    let headroom = pb.headroom();
    if !pb.reset(headroom, arp::PACKET_LEN) {
        return;
    }
    reply.emit(arp::arp::new_unchecked_mut(pb.data_mut()));

    net_trace!("arp: answering {} at {}", repr.source_protocol_addr, repr.source_hardware_addr);
    if let Err(_err) = eth::output(io, netif, repr.source_hardware_addr, EthernetProtocol::Arp, pb) {
        net_debug!("arp: reply failed: {}", _err);
    }
}

/// Broadcast a request for the hardware address of `addr`.
pub(crate) fn request(io: &mut Io, netif: NetifId, addr: Ipv4Address) -> Result<()> {
    let (hw_addr, our_addr) = match io.netifs.get(netif.0) {
        Some(iface) => (iface.config.hw_addr, iface.address()),
        None => return Err(Error::Unreachable),
    };

    let mut pb = io.pool.alloc(eth::HEADROOM).ok_or(Error::Exhausted)?;
    let packet = pb.append(arp::PACKET_LEN).ok_or(Error::BadSize)?;

    Repr {
        operation: Operation::Request,
        source_hardware_addr: hw_addr,
        source_protocol_addr: our_addr,
        target_hardware_addr: EthernetAddress::default(),
        target_protocol_addr: addr,
    }.emit(arp::arp::new_unchecked_mut(packet));

    net_trace!("arp: who has {}", addr);
    eth::output(io, netif, EthernetAddress::BROADCAST, EthernetProtocol::Arp, pb)
}

fn count_malformed(io: &mut Io, netif: NetifId) {
    if let Some(iface) = io.netifs.get_mut(netif.0) {
        iface.stats.malformed += 1;
    }
}
