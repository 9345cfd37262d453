//! The Ethernet II framing.
use crate::buf::Pbuf;
use crate::stack::Io;
use crate::wire::{ethernet, EthernetAddress, EthernetProtocol};

use super::netif::NetifId;
use super::{Error, Result};

/// The headroom an Ethernet frame needs in front of its payload.
pub const HEADROOM: usize = ethernet::HEADER_LEN;

/// Validate the Ethernet header of a received frame and strip it.
///
/// Returns the EtherType with the payload, or `None` if the frame was dropped.
pub(crate) fn input(io: &mut Io, netif: NetifId, pb: Pbuf) -> Option<(EthernetProtocol, Pbuf)> {
    let iface = io.netifs.get_mut(netif.0)?;
    let pb = match pb.pullup(ethernet::HEADER_LEN) {
        Some(pb) => pb,
        None => {
            iface.stats.malformed += 1;
            return None;
        },
    };

    let frame = ethernet::ethernet::new_unchecked(pb.data());
    let dst = frame.dst_addr();
    if dst != iface.config.hw_addr && !dst.is_group() {
        net_trace!("eth: frame for {} ignored", dst);
        iface.stats.not_for_us += 1;
        return None;
    }

    let ethertype = frame.ethertype();
    match ethertype {
        EthernetProtocol::Ipv4 | EthernetProtocol::Arp => (),
        _other => {
            net_trace!("eth: unknown ethertype {}", _other);
            iface.stats.unknown += 1;
            return None;
        },
    }

    let pb = pb.drop_head(ethernet::HEADER_LEN)?;
    Some((ethertype, pb))
}

/// Prepend the Ethernet header and hand the frame to the driver of `netif`.
pub(crate) fn output(
    io: &mut Io,
    netif: NetifId,
    dst: EthernetAddress,
    ethertype: EthernetProtocol,
    pb: Pbuf,
) -> Result<()> {
    let iface = io.netifs.get_mut(netif.0).ok_or(Error::Unreachable)?;
    let mut pb = pb.prepend(ethernet::HEADER_LEN).ok_or(Error::BadSize)?;

    let frame = ethernet::ethernet::new_unchecked_mut(pb.data_mut());
    frame.set_dst_addr(dst);
    frame.set_src_addr(iface.config.hw_addr);
    frame.set_ethertype(ethertype);

    iface.transmit(pb)
}
