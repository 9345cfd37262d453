//! Answers ICMP echo requests.
//!
//! The request buffer is turned into the reply: the type changes, the checksum is recomputed and
//! IPv4 prepends a fresh header with the addresses swapped. Every other message is dropped.
use crate::buf::Flags;
use crate::stack::Io;
use crate::wire::icmpv4::{self, Message};
use crate::wire::IpProtocol;

use super::ip::{self, Packet};
use super::netif::NetifFlags;

pub(crate) fn input(io: &mut Io, packet: Packet) {
    let Packet { netif, repr, pb } = packet;

    if pb.flags().intersects(Flags::BCAST | Flags::MCAST) {
        net_trace!("icmp: not answering group request from {}", repr.src_addr);
        return;
    }

    let flags = match io.netifs.get_mut(netif.0) {
        Some(iface) if !iface.address().is_unspecified() => iface.flags,
        _ => return,
    };

    let mut pb = match pb.pullup(icmpv4::ECHO_HEADER_LEN) {
        Some(pb) => pb,
        None => {
            if let Some(iface) = io.netifs.get_mut(netif.0) {
                iface.stats.malformed += 1;
            }
            return;
        },
    };

    let len = pb.pktlen();
    if flags.checksum(NetifFlags::ICMP_RX_CSUM).manual() && pb.checksum(0, len, 0) != !0 {
        net_trace!("icmp: bad checksum from {}", repr.src_addr);
        if let Some(iface) = io.netifs.get_mut(netif.0) {
            iface.stats.checksum_errors += 1;
        }
        return;
    }

    let message = icmpv4::icmpv4::new_unchecked(pb.data());
    if message.msg_type() != Message::EchoRequest || message.msg_code() != 0 {
        return;
    }

    {
        let message = icmpv4::icmpv4::new_unchecked_mut(pb.data_mut());
        message.set_msg_type(Message::EchoReply);
        message.set_checksum(0);
    }

    if flags.checksum(NetifFlags::ICMP_TX_CSUM).manual() {
        let checksum = !pb.checksum(0, len, 0);
        icmpv4::icmpv4::new_unchecked_mut(pb.data_mut()).set_checksum(checksum);
    }

    net_trace!("icmp: echo reply to {}", repr.src_addr);
    if let Err(_err) = ip::send(io, IpProtocol::Icmp, repr.src_addr, pb) {
        net_debug!("icmp: reply to {} failed: {}", repr.src_addr, _err);
    }
}
