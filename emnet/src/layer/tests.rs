//! Whole-stack tests against an in-memory interface.
//!
//! The harness attaches one `External` device and plays the peer by building frames by hand. The
//! TCP tests reuse it.
use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::nic::external::{Capture, External};
use crate::nic::RxHandle;
use crate::stack::{Config, Stack};
use crate::time::{Duration, Instant};
use crate::wire::arp::{self, Operation};
use crate::wire::ethernet;
use crate::wire::icmpv4::{self, Message as IcmpMessage};
use crate::wire::igmp::{self, Message as IgmpMessage};
use crate::wire::ipv4;
use crate::wire::udp;
use crate::wire::{checksum, Checksum};
use crate::wire::{EthernetAddress, EthernetProtocol, IpProtocol, Ipv4Address, Ipv4Cidr};

use super::udp::Datagram;
use super::{NetifConfig, NetifId, NexthopState};

pub(crate) const MAC_HOST: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);
pub(crate) const MAC_PEER: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x02]);
pub(crate) const IP_HOST: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
pub(crate) const IP_PEER: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

pub(crate) struct Harness {
    pub(crate) stack: Stack,
    pub(crate) netif: NetifId,
    pub(crate) rx: RxHandle,
    pub(crate) capture: Capture,
    pub(crate) now: Instant,
}

/// A frame as captured, split into its headers.
pub(crate) struct Sent {
    pub(crate) eth_dst: EthernetAddress,
    pub(crate) ip: ipv4::Repr,
    pub(crate) payload: Vec<u8>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Harness::with_config(Config::default())
    }

    pub(crate) fn with_config(config: Config) -> Self {
        let mut stack = Stack::new(config);
        let (device, capture) = External::new();
        let netif_config = NetifConfig::new(MAC_HOST, Ipv4Cidr::new(IP_HOST, 24));
        let (netif, rx) = stack.attach(netif_config, Box::new(device)).unwrap();
        Harness {
            stack,
            netif,
            rx,
            capture,
            now: Instant::ZERO,
        }
    }

    /// Hand a frame to the receive queue without processing it.
    pub(crate) fn queue(&mut self, frame: &[u8]) {
        let pb = self.stack.pool().alloc_from(0, frame).unwrap();
        self.rx.receive(pb);
    }

    /// Deliver a frame and let the stack process it.
    pub(crate) fn receive(&mut self, frame: &[u8]) {
        self.queue(frame);
        self.stack.poll(self.now);
    }

    pub(crate) fn poll(&mut self) {
        self.stack.poll(self.now);
    }

    /// Move the clock forward in steps of at most `step`, polling after each.
    pub(crate) fn advance(&mut self, by: Duration, step: Duration) {
        let end = self.now + by;
        while self.now < end {
            let next = self.now + step;
            self.now = if next < end { next } else { end };
            self.stack.poll(self.now);
        }
    }

    pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
        self.capture.frames()
    }

    /// All captured IPv4 frames, failing on anything else.
    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.frames().iter().map(|frame| parse_ipv4(frame)).collect()
    }

    /// Answer for the peer once a who-has for it went out.
    pub(crate) fn answer_arp(&mut self) {
        self.receive(&arp_frame(Operation::Reply, MAC_PEER, IP_PEER, MAC_HOST, IP_HOST));
    }

    /// Make the link address of the peer known and forget the frames this produced.
    pub(crate) fn resolve_peer(&mut self) {
        self.stack.udp_send_slice(9, IP_PEER, 9, b"hello").unwrap();
        self.answer_arp();
        self.capture.clear();
    }
}

pub(crate) fn ethernet_frame(dst: EthernetAddress, ethertype: EthernetProtocol, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0; ethernet::HEADER_LEN + payload.len()];
    let header = ethernet::ethernet::new_unchecked_mut(&mut frame[..]);
    header.set_dst_addr(dst);
    header.set_src_addr(MAC_PEER);
    header.set_ethertype(ethertype);
    frame[ethernet::HEADER_LEN..].copy_from_slice(payload);
    frame
}

pub(crate) fn arp_frame(
    operation: Operation,
    sha: EthernetAddress,
    spa: Ipv4Address,
    tha: EthernetAddress,
    tpa: Ipv4Address,
) -> Vec<u8> {
    let mut packet = [0; arp::PACKET_LEN];
    arp::Repr {
        operation,
        source_hardware_addr: sha,
        source_protocol_addr: spa,
        target_hardware_addr: tha,
        target_protocol_addr: tpa,
    }.emit(arp::arp::new_unchecked_mut(&mut packet[..]));

    let dst = match operation {
        Operation::Request => EthernetAddress::BROADCAST,
        _ => tha,
    };
    ethernet_frame(dst, EthernetProtocol::Arp, &packet)
}

/// An IPv4 packet from the peer, framed for our link address or the mapped group address.
pub(crate) fn ipv4_frame(src: Ipv4Address, dst: Ipv4Address, protocol: IpProtocol, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0; ipv4::HEADER_LEN + payload.len()];
    ipv4::Repr {
        src_addr: src,
        dst_addr: dst,
        protocol,
        payload_len: payload.len(),
        hop_limit: 64,
        ident: 0x1234,
        dont_frag: true,
    }.emit(ipv4::ipv4::new_unchecked_mut(&mut packet[..]), Checksum::Manual);
    packet[ipv4::HEADER_LEN..].copy_from_slice(payload);

    let eth_dst = if dst.is_broadcast() {
        EthernetAddress::BROADCAST
    } else if dst.is_multicast() {
        EthernetAddress::from_ipv4_multicast(dst)
    } else {
        MAC_HOST
    };
    ethernet_frame(eth_dst, EthernetProtocol::Ipv4, &packet)
}

pub(crate) fn udp_frame(dst: Ipv4Address, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0; udp::HEADER_LEN + payload.len()];
    {
        let header = udp::udp::new_unchecked_mut(&mut datagram[..]);
        header.set_src_port(src_port);
        header.set_dst_port(dst_port);
        header.set_len((udp::HEADER_LEN + payload.len()) as u16);
    }
    datagram[udp::HEADER_LEN..].copy_from_slice(payload);
    udp::udp::new_unchecked_mut(&mut datagram[..]).fill_checksum(IP_PEER, dst);
    ipv4_frame(IP_PEER, dst, IpProtocol::Udp, &datagram)
}

pub(crate) fn echo_request(ident: u16, seq_no: u16, data: &[u8]) -> Vec<u8> {
    let mut message = vec![0; icmpv4::ECHO_HEADER_LEN + data.len()];
    message[0] = IcmpMessage::EchoRequest.into();
    message[4..6].copy_from_slice(&ident.to_be_bytes());
    message[6..8].copy_from_slice(&seq_no.to_be_bytes());
    message[icmpv4::ECHO_HEADER_LEN..].copy_from_slice(data);
    icmpv4::icmpv4::new_unchecked_mut(&mut message[..]).fill_checksum();
    message
}

pub(crate) fn igmp_message(message: IgmpMessage, max_resp_time: u8, group_addr: Ipv4Address) -> Vec<u8> {
    let mut bytes = [0; igmp::PACKET_LEN];
    igmp::Repr { message, max_resp_time, group_addr }
        .emit(igmp::igmp::new_unchecked_mut(&mut bytes[..]));
    bytes.to_vec()
}

/// Split a captured frame, checking the IPv4 header checksum.
pub(crate) fn parse_ipv4(frame: &[u8]) -> Sent {
    let eth = ethernet::ethernet::new_checked(frame).unwrap();
    assert_eq!(eth.src_addr(), MAC_HOST);
    assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);
    let packet = ipv4::ipv4::new_checked(eth.payload_slice()).unwrap();
    assert!(packet.verify_checksum());
    let repr = ipv4::Repr::parse(packet).unwrap();
    let total = usize::from(packet.total_len());
    Sent {
        eth_dst: eth.dst_addr(),
        ip: repr,
        payload: eth.payload_slice()[ipv4::HEADER_LEN..total].to_vec(),
    }
}

/// Parse a captured ARP frame.
pub(crate) fn parse_arp(frame: &[u8]) -> (EthernetAddress, arp::Repr) {
    let eth = ethernet::ethernet::new_checked(frame).unwrap();
    assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
    let repr = arp::Repr::parse(arp::arp::new_checked(eth.payload_slice()).unwrap()).unwrap();
    (eth.dst_addr(), repr)
}

/// Whether a transport checksum over the pseudo header verifies.
pub(crate) fn verify_transport(sent: &Sent) -> bool {
    let pseudo = checksum::pseudo_header(
        sent.ip.src_addr, sent.ip.dst_addr, sent.ip.protocol, sent.payload.len() as u16);
    checksum::combine(&[pseudo, checksum::data(&sent.payload)]) == !0
}

fn stats(harness: &Harness) -> super::NetifStats {
    harness.stack.netif_stats(harness.netif).unwrap()
}

#[test]
fn arp_resolve_flushes_latest_once() {
    let mut harness = Harness::new();
    harness.stack.udp_send_slice(5000, IP_PEER, 6000, b"first").unwrap();
    harness.stack.udp_send_slice(5000, IP_PEER, 6000, b"second").unwrap();

    // A single who-has, the datagrams wait for it.
    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let (dst, request) = parse_arp(&frames[0]);
    assert_eq!(dst, EthernetAddress::BROADCAST);
    assert_eq!(request.operation, Operation::Request);
    assert_eq!(request.source_protocol_addr, IP_HOST);
    assert_eq!(request.target_protocol_addr, IP_PEER);

    harness.answer_arp();
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].eth_dst, MAC_PEER);
    assert_eq!(&sent[0].payload[udp::HEADER_LEN..], b"second");
    assert!(verify_transport(&sent[0]));

    // A second reply has nothing left to flush.
    harness.answer_arp();
    assert!(harness.capture.is_empty());

    let nexthops = harness.stack.nexthops();
    assert_eq!(nexthops.len(), 1);
    assert_eq!(nexthops[0].addr, IP_PEER);
    assert_eq!(nexthops[0].hw_addr, Some(MAC_PEER));
    assert_eq!(nexthops[0].state, NexthopState::Active);
    assert_eq!(nexthops[0].counter, 255);
    assert!(!nexthops[0].pending);
}

#[test]
fn arp_resolved_sends_directly() {
    let mut harness = Harness::new();
    harness.resolve_peer();

    harness.stack.udp_send_slice(5000, IP_PEER, 6000, b"direct").unwrap();
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].eth_dst, MAC_PEER);
}

#[test]
fn arp_request_is_answered() {
    let mut harness = Harness::new();
    harness.receive(&arp_frame(
        Operation::Request, MAC_PEER, IP_PEER, EthernetAddress::default(), IP_HOST));

    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let (dst, reply) = parse_arp(&frames[0]);
    assert_eq!(dst, MAC_PEER);
    assert_eq!(reply.operation, Operation::Reply);
    assert_eq!(reply.source_hardware_addr, MAC_HOST);
    assert_eq!(reply.source_protocol_addr, IP_HOST);
    assert_eq!(reply.target_hardware_addr, MAC_PEER);
    assert_eq!(reply.target_protocol_addr, IP_PEER);

    // Requests for other hosts are not answered.
    harness.receive(&arp_frame(
        Operation::Request, MAC_PEER, IP_PEER, EthernetAddress::default(), Ipv4Address::new(10, 0, 0, 3)));
    assert!(harness.capture.is_empty());
}

#[test]
fn unresolved_nexthop_expires() {
    let mut harness = Harness::new();
    harness.stack.udp_send_slice(5000, IP_PEER, 6000, b"lost").unwrap();
    assert_eq!(harness.frames().len(), 1);

    // Four more requests while the entry counts down, then it is gone.
    harness.advance(Duration::from_secs(4), Duration::from_secs(1));
    let requests = harness.frames();
    assert_eq!(requests.len(), 4);
    for frame in &requests {
        assert_eq!(parse_arp(frame).1.target_protocol_addr, IP_PEER);
    }
    assert_eq!(harness.stack.nexthops()[0].state, NexthopState::Resolving);

    harness.advance(Duration::from_secs(1), Duration::from_secs(1));
    assert!(harness.stack.nexthops().is_empty());
    assert!(harness.capture.is_empty());

    // The late reply finds nothing to flush.
    harness.answer_arp();
    assert!(harness.capture.is_empty());
}

#[test]
fn no_route_off_link() {
    let mut harness = Harness::new();
    let err = harness.stack.udp_send_slice(5000, Ipv4Address::new(192, 168, 1, 1), 6000, b"x");
    assert_eq!(err, Err(super::Error::Unreachable));
    assert!(harness.capture.is_empty());
}

#[test]
fn echo_is_answered() {
    let mut harness = Harness::new();
    harness.resolve_peer();

    let request = echo_request(0x1234, 7, b"ping payload");
    harness.receive(&ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request));

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(reply.eth_dst, MAC_PEER);
    assert_eq!(reply.ip.src_addr, IP_HOST);
    assert_eq!(reply.ip.dst_addr, IP_PEER);
    assert_eq!(reply.ip.protocol, IpProtocol::Icmp);

    let message = icmpv4::icmpv4::new_checked(&reply.payload[..]).unwrap();
    assert_eq!(message.msg_type(), IcmpMessage::EchoReply);
    assert_eq!(message.echo_ident(), Some(0x1234));
    assert_eq!(message.echo_seq_no(), Some(7));
    assert!(message.verify_checksum());
    assert_eq!(&reply.payload[icmpv4::ECHO_HEADER_LEN..], b"ping payload");
}

#[test]
fn echo_to_broadcast_is_ignored() {
    let mut harness = Harness::new();
    harness.resolve_peer();

    let request = echo_request(1, 1, b"");
    harness.receive(&ipv4_frame(IP_PEER, Ipv4Address::BROADCAST, IpProtocol::Icmp, &request));
    assert!(harness.capture.is_empty());
}

#[test]
fn echo_with_bad_checksum_is_dropped() {
    let mut harness = Harness::new();
    harness.resolve_peer();

    let mut request = echo_request(1, 1, b"abc");
    request[8] ^= 0xff;
    harness.receive(&ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request));
    assert!(harness.capture.is_empty());
    assert_eq!(stats(&harness).checksum_errors, 1);
}

#[test]
fn ipv4_drops_bad_packets() {
    let mut harness = Harness::new();
    harness.resolve_peer();
    let request = echo_request(1, 1, b"data");
    let ip = ethernet::HEADER_LEN;

    // Options.
    let mut frame = ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request);
    frame[ip] = 0x46;
    harness.receive(&frame);
    assert_eq!(stats(&harness).malformed, 1);

    // Header checksum.
    let mut frame = ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request);
    frame[ip + 10] ^= 0x01;
    harness.receive(&frame);
    assert_eq!(stats(&harness).checksum_errors, 1);

    // More fragments.
    let mut frame = ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request);
    frame[ip + 6] |= 0x20;
    ipv4::ipv4::new_unchecked_mut(&mut frame[ip..]).fill_checksum();
    harness.receive(&frame);
    assert_eq!(stats(&harness).malformed, 2);

    // Total length beyond the frame.
    let mut frame = ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request);
    ipv4::ipv4::new_unchecked_mut(&mut frame[ip..]).set_total_len(200);
    ipv4::ipv4::new_unchecked_mut(&mut frame[ip..]).fill_checksum();
    harness.receive(&frame);
    assert_eq!(stats(&harness).malformed, 3);

    // Someone else's address.
    let frame = ipv4_frame(IP_PEER, Ipv4Address::new(10, 0, 0, 3), IpProtocol::Icmp, &request);
    harness.receive(&frame);
    assert_eq!(stats(&harness).not_for_us, 1);

    assert!(harness.capture.is_empty());
}

#[test]
fn ipv4_trims_padding() {
    let mut harness = Harness::new();
    harness.resolve_peer();

    let request = echo_request(3, 4, b"pad");
    let mut frame = ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request);
    frame.extend_from_slice(&[0; 20]);
    harness.receive(&frame);

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), request.len());
}

#[test]
fn frames_for_other_hosts_are_ignored() {
    let mut harness = Harness::new();
    let mut frame = udp_frame(IP_HOST, 1, 2, b"");
    ethernet::ethernet::new_unchecked_mut(&mut frame[..])
        .set_dst_addr(EthernetAddress([0x02, 0, 0, 0, 0, 0x09]));
    harness.receive(&frame);
    assert_eq!(stats(&harness).not_for_us, 1);
}

fn echo(datagram: &mut Datagram) {
    if let Some(payload) = datagram.take_payload() {
        datagram.respond(payload);
    }
}

fn swallow(datagram: &mut Datagram) {
    datagram.take_payload();
}

#[test]
fn udp_dispatch_by_port() {
    let mut harness = Harness::new();
    harness.stack.udp_register(7, echo).unwrap();
    harness.stack.udp_register(9, swallow).unwrap();
    assert_eq!(harness.stack.udp_register(7, swallow), Err(super::Error::Illegal));
    harness.resolve_peer();

    harness.receive(&udp_frame(IP_HOST, 40000, 7, b"echo me"));
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip.protocol, IpProtocol::Udp);
    assert_eq!(sent[0].ip.dst_addr, IP_PEER);
    assert!(verify_transport(&sent[0]));
    let reply = udp::udp::new_checked(&sent[0].payload[..]).unwrap();
    assert_eq!(reply.src_port(), 7);
    assert_eq!(reply.dst_port(), 40000);
    assert_eq!(reply.payload_slice(), b"echo me");

    harness.receive(&udp_frame(IP_HOST, 40000, 9, b"gone"));
    assert!(harness.capture.is_empty());

    // No handler, silently dropped.
    harness.receive(&udp_frame(IP_HOST, 40000, 10, b"nobody"));
    assert!(harness.capture.is_empty());
    assert_eq!(stats(&harness).unknown, 1);
}

#[test]
fn udp_bad_checksum_is_dropped() {
    let mut harness = Harness::new();
    harness.stack.udp_register(7, echo).unwrap();
    harness.resolve_peer();

    let mut frame = udp_frame(IP_HOST, 40000, 7, b"echo me");
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    harness.receive(&frame);
    assert!(harness.capture.is_empty());
    assert_eq!(stats(&harness).checksum_errors, 1);
}

#[test]
fn multicast_needs_membership() {
    let group = Ipv4Address::new(239, 1, 2, 3);
    let mut harness = Harness::new();
    harness.stack.udp_register(7, echo).unwrap();
    harness.resolve_peer();

    harness.receive(&udp_frame(group, 40000, 7, b"to the group"));
    assert!(harness.capture.is_empty());

    harness.stack.igmp_join(group).unwrap();
    harness.capture.clear();
    harness.receive(&udp_frame(group, 40000, 7, b"to the group"));
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip.dst_addr, IP_PEER);
}

#[test]
fn igmp_reports_until_queried() {
    let group = Ipv4Address::new(239, 1, 2, 3);
    let mut harness = Harness::new();
    assert_eq!(harness.stack.igmp_join(Ipv4Address::ALL_SYSTEMS), Err(super::Error::Illegal));
    assert_eq!(harness.stack.igmp_join(IP_PEER), Err(super::Error::Illegal));

    harness.stack.igmp_join(group).unwrap();
    assert_eq!(harness.stack.igmp_groups(), vec![group]);

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].eth_dst, EthernetAddress::from_ipv4_multicast(group));
    assert_eq!(sent[0].ip.dst_addr, group);
    assert_eq!(sent[0].ip.hop_limit, 1);
    let report = igmp::Repr::parse(igmp::igmp::new_checked(&sent[0].payload[..]).unwrap()).unwrap();
    assert_eq!(report.message, IgmpMessage::V2Report);
    assert_eq!(report.group_addr, group);

    // Unsolicited reports repeat.
    harness.advance(Duration::from_secs(10), Duration::from_secs(1));
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip.protocol, IpProtocol::Igmp);

    // A general query with a one second response time.
    let query = igmp_message(IgmpMessage::MembershipQuery, 10, Ipv4Address::UNSPECIFIED);
    harness.receive(&ipv4_frame(IP_PEER, Ipv4Address::ALL_SYSTEMS, IpProtocol::Igmp, &query));
    harness.advance(Duration::from_secs(1), Duration::from_millis(100));
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip.dst_addr, group);

    // Answered, no more unsolicited reports.
    harness.advance(Duration::from_secs(30), Duration::from_secs(1));
    assert!(harness.capture.is_empty());

    harness.stack.igmp_leave(group).unwrap();
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip.dst_addr, Ipv4Address::ALL_ROUTERS);
    let leave = igmp::Repr::parse(igmp::igmp::new_checked(&sent[0].payload[..]).unwrap()).unwrap();
    assert_eq!(leave.message, IgmpMessage::Leave);
    assert_eq!(leave.group_addr, group);
    assert!(harness.stack.igmp_groups().is_empty());
}

#[test]
fn igmp_report_suppressed_by_other_member() {
    let group = Ipv4Address::new(239, 1, 2, 3);
    let mut harness = Harness::new();
    harness.stack.igmp_join(group).unwrap();
    harness.capture.clear();

    // Another member answers the query before our delay runs out.
    let query = igmp_message(IgmpMessage::MembershipQuery, 100, group);
    harness.queue(&ipv4_frame(IP_PEER, group, IpProtocol::Igmp, &query));
    let report = igmp_message(IgmpMessage::V2Report, 0, group);
    harness.queue(&ipv4_frame(IP_PEER, group, IpProtocol::Igmp, &report));
    harness.poll();

    harness.advance(Duration::from_secs(30), Duration::from_secs(1));
    assert!(harness.capture.is_empty());
}

#[test]
fn full_rx_queue_drops_frames() {
    let mut harness = Harness::new();
    harness.resolve_peer();

    let request = echo_request(1, 1, b"");
    let frame = ipv4_frame(IP_PEER, IP_HOST, IpProtocol::Icmp, &request);
    for _ in 0..36 {
        harness.queue(&frame);
    }
    assert_eq!(stats(&harness).rx_dropped, 4);

    harness.poll();
    assert_eq!(harness.sent().len(), 32);
}
