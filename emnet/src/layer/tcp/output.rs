use crate::buf::Pbuf;
use crate::layer::ip;
use crate::layer::netif::NetifFlags;
use crate::layer::{Error, Result};
use crate::stack::Io;
use crate::wire::checksum;
use crate::wire::tcp::{self, Repr as TcpRepr};
use crate::wire::{IpProtocol, Ipv4Address};

/// The headroom of a segment buffer, enough for all headers and the MSS option.
pub(crate) const HEADROOM: usize = ip::HEADROOM + tcp::HEADER_LEN + tcp::MSS_OPTION_LEN;

/// Prepend the TCP header of `repr` to the payload in `pb` and send the segment.
pub(crate) fn send(io: &mut Io, dst_addr: Ipv4Address, repr: &TcpRepr, pb: Pbuf) -> Result<()> {
    let route = ip::route(io, dst_addr)?;
    let flags = io.netifs.get(route.netif.0)
        .map(|iface| iface.flags)
        .ok_or(Error::Unreachable)?;

    let header_len = repr.header_len();
    let mut pb = pb.prepend(header_len).ok_or(Error::BadSize)?;
    repr.emit(tcp::tcp::new_unchecked_mut(pb.data_mut()));

    if flags.checksum(NetifFlags::TCP_TX_CSUM).manual() {
        let len = pb.pktlen();
        let pseudo = checksum::pseudo_header(route.src_addr, dst_addr, IpProtocol::Tcp, len as u16);
        let sum = !pb.checksum(0, len, pseudo);
        tcp::tcp::new_unchecked_mut(pb.data_mut()).set_checksum(sum);
    }

    net_trace!("tcp: {}:{} <- {:?} seq={} ack={} win={} len={}",
        dst_addr, repr.dst_port, repr.flags, repr.seq_number, repr.ack_number, repr.window_len,
        pb.pktlen() - header_len);
    ip::output(io, &route, IpProtocol::Tcp, dst_addr, ip::DEFAULT_HOP_LIMIT, pb)
}

/// Answer a segment that belongs to no connection with a reset.
///
/// The received buffer is emptied and reused for the reply.
pub(crate) fn reset(io: &mut Io, src_addr: Ipv4Address, repr: &TcpRepr, seg_len: usize, mut pb: Pbuf) {
    if repr.flags.rst() {
        return;
    }

    let (seq_number, ack_number, flags) = if repr.flags.ack() {
        (repr.ack_number, Default::default(), tcp::Flags::RST)
    } else {
        (Default::default(), repr.seq_number + seg_len, tcp::Flags::RST | tcp::Flags::ACK)
    };

    let reply = TcpRepr {
        src_port: repr.dst_port,
        dst_port: repr.src_port,
        seq_number,
        ack_number,
        flags,
        window_len: 0,
        max_seg_size: None,
    };

    let headroom = pb.headroom();
    if headroom < ip::HEADROOM + reply.header_len() || !pb.reset(headroom, 0) {
        pb = match io.pool.alloc(HEADROOM) {
            Some(pb) => pb,
            None => return,
        };
    }

    net_trace!("tcp: reset to {}:{}", src_addr, repr.src_port);
    if let Err(_err) = send(io, src_addr, &reply, pb) {
        net_debug!("tcp: reset to {} failed: {}", src_addr, _err);
    }
}
