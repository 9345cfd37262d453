//! Interfaces and the next-hop table.
//!
//! Every attached interface owns a receive queue, its address and prefix, and the driver it sends
//! through. The next-hop table maps IPv4 addresses on a directly connected prefix to hardware
//! addresses. Each entry is driven by a small counter instead of timestamps:
//!
//! * `0` is idle, the entry was just created and nothing was sent yet.
//! * Counting down from `NEXTHOP_RESOLVE` the entry is being resolved.
//! * At `NEXTHOP_ACTIVE` and above a reply was seen recently.
//!
//! A periodic tick decrements every counter and destroys the entries that reach zero. Entries that
//! are still used but no longer active solicit a fresh reply.
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::{arp, eth, Error, Result};
use crate::buf::Pbuf;
use crate::managed::Key;
use crate::nic::{Capabilities, Driver, RxHandle, RxQueue};
use crate::stack::Io;
use crate::wire::{Checksum, EthernetAddress, EthernetProtocol, Ipv4Address, Ipv4Cidr};

/// Counter value of a next-hop that never sent a request.
pub const NEXTHOP_IDLE: u8 = 0;
/// Counter value of a next-hop that just sent its first request.
pub const NEXTHOP_RESOLVE: u8 = 5;
/// Counter values at or above this are considered resolved.
pub const NEXTHOP_ACTIVE: u8 = 10;
/// Counter value after a reply.
pub const NEXTHOP_REPLIED: u8 = 255;
/// In-use value set by every packet sent through a next-hop.
pub const NEXTHOP_IN_USE: u8 = 5;

/// Identifies an attached interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetifId(pub(crate) Key);

bitflags! {
    /// Checksum offloads of an interface.
    ///
    /// A set flag means the hardware computes, or has already verified, that checksum.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct NetifFlags: u16 {
        /// IPv4 header checksum on transmit.
        const IPV4_TX_CSUM = 0x0001;
        /// IPv4 header checksum on receive.
        const IPV4_RX_CSUM = 0x0002;
        /// ICMP checksum on transmit.
        const ICMP_TX_CSUM = 0x0004;
        /// ICMP checksum on receive.
        const ICMP_RX_CSUM = 0x0008;
        /// UDP checksum on transmit.
        const UDP_TX_CSUM = 0x0010;
        /// UDP checksum on receive.
        const UDP_RX_CSUM = 0x0020;
        /// TCP checksum on transmit.
        const TCP_TX_CSUM = 0x0040;
        /// TCP checksum on receive.
        const TCP_RX_CSUM = 0x0080;
    }
}

impl NetifFlags {
    /// The offloads advertised by a driver.
    pub fn from_capabilities(caps: &Capabilities) -> Self {
        let mut flags = NetifFlags::empty();
        let protocols = [
            (caps.ipv4(), NetifFlags::IPV4_TX_CSUM, NetifFlags::IPV4_RX_CSUM),
            (caps.icmpv4(), NetifFlags::ICMP_TX_CSUM, NetifFlags::ICMP_RX_CSUM),
            (caps.udp(), NetifFlags::UDP_TX_CSUM, NetifFlags::UDP_RX_CSUM),
            (caps.tcp(), NetifFlags::TCP_TX_CSUM, NetifFlags::TCP_RX_CSUM),
        ];
        for &(protocol, tx, rx) in protocols.iter() {
            flags.set(tx, protocol.tx_checksum() == Checksum::Ignored);
            flags.set(rx, protocol.rx_checksum() == Checksum::Ignored);
        }
        flags
    }

    /// How to treat the checksum covered by `flag`.
    pub fn checksum(self, flag: NetifFlags) -> Checksum {
        Checksum::offloaded(self.contains(flag))
    }
}

/// The configuration of an interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetifConfig {
    /// The hardware address.
    pub hw_addr: EthernetAddress,
    /// The local address and the directly connected prefix.
    pub cidr: Ipv4Cidr,
    /// The largest IPv4 packet the link carries.
    pub mtu: usize,
    /// The number of received frames that may wait for the network context.
    pub rx_depth: usize,
    /// Offloads in addition to those the driver advertises.
    pub flags: NetifFlags,
}

impl NetifConfig {
    /// An Ethernet interface with the standard MTU.
    pub fn new(hw_addr: EthernetAddress, cidr: Ipv4Cidr) -> Self {
        NetifConfig {
            hw_addr,
            cidr,
            mtu: 1500,
            rx_depth: 32,
            flags: NetifFlags::empty(),
        }
    }
}

/// Per-interface counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetifStats {
    /// Frames taken from the receive queue.
    pub rx_frames: u64,
    /// Frames handed to the driver.
    pub tx_frames: u64,
    /// Frames the driver refused.
    pub tx_errors: u64,
    /// Packets with a malformed or unsupported header.
    pub malformed: u64,
    /// Packets whose checksum did not verify.
    pub checksum_errors: u64,
    /// Packets addressed to someone else.
    pub not_for_us: u64,
    /// Packets of a protocol, or to a port, nobody handles.
    pub unknown: u64,
    /// Frames dropped because the receive queue was full.
    pub rx_dropped: u64,
}

pub(crate) struct Netif {
    pub(crate) config: NetifConfig,
    /// Effective offloads, the union of the configuration and the driver capabilities.
    pub(crate) flags: NetifFlags,
    pub(crate) rx: Arc<RxQueue>,
    pub(crate) stats: NetifStats,
    driver: Box<dyn Driver>,
}

impl Netif {
    pub(crate) fn address(&self) -> Ipv4Address {
        self.config.cidr.address()
    }

    /// Whether `addr` is the broadcast address of the connected prefix.
    pub(crate) fn is_directed_broadcast(&self, addr: Ipv4Address) -> bool {
        let cidr = self.config.cidr;
        cidr.prefix_len() < 31
            && cidr.contains(addr)
            && addr.to_bits() | cidr.netmask_bits() == !0
    }

    pub(crate) fn transmit(&mut self, frame: Pbuf) -> Result<()> {
        match self.driver.transmit(frame) {
            Ok(()) => {
                self.stats.tx_frames += 1;
                Ok(())
            },
            Err(err) => {
                self.stats.tx_errors += 1;
                Err(err)
            },
        }
    }
}

pub(crate) struct Nexthop {
    addr: Ipv4Address,
    netif: NetifId,
    hw_addr: Option<EthernetAddress>,
    state: u8,
    in_use: u8,
    pending: Option<Pbuf>,
}

/// The resolution state of a next-hop, derived from its counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NexthopState {
    /// Created, no request sent yet.
    Idle,
    /// Waiting for a reply.
    Resolving,
    /// A reply was received recently.
    Active,
}

/// A snapshot of one next-hop entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NexthopInfo {
    /// The protocol address.
    pub addr: Ipv4Address,
    /// The hardware address, once known.
    pub hw_addr: Option<EthernetAddress>,
    /// The resolution state.
    pub state: NexthopState,
    /// The raw state counter.
    pub counter: u8,
    /// The in-use counter.
    pub in_use: u8,
    /// Whether a packet waits for resolution.
    pub pending: bool,
    /// The interface of the connected prefix.
    pub netif: NetifId,
}

impl NexthopState {
    fn from_counter(counter: u8) -> Self {
        match counter {
            NEXTHOP_IDLE => NexthopState::Idle,
            c if c < NEXTHOP_ACTIVE => NexthopState::Resolving,
            _ => NexthopState::Active,
        }
    }
}

/// Attach a new interface with its driver.
pub(crate) fn attach(io: &mut Io, mut config: NetifConfig, driver: Box<dyn Driver>)
    -> Result<(NetifId, RxHandle)>
{
    let id = NetifId(io.netifs.vacant_key().ok_or(Error::Exhausted)?);
    let rx = Arc::new(RxQueue::new(id, config.rx_depth, io.signals.clone()));
    let flags = config.flags | NetifFlags::from_capabilities(driver.personality().capabilities());
    config.flags = flags;

    let netif = Netif {
        config,
        flags,
        rx: rx.clone(),
        stats: NetifStats::default(),
        driver,
    };

    match io.netifs.try_insert(netif) {
        Ok(key) => debug_assert_eq!(key, id.0),
        Err(_) => return Err(Error::Exhausted),
    }

    net_debug!("netif: attached {} as {}", config.hw_addr, config.cidr);
    Ok((id, RxHandle::new(rx)))
}

/// Detach an interface, freeing its next-hops and queued frames.
pub(crate) fn detach(io: &mut Io, id: NetifId) -> Result<()> {
    let netif = io.netifs.remove(id.0).ok_or(Error::Illegal)?;
    netif.rx.free_all();
    let stale: Vec<Key> = io.nexthops.iter()
        .filter(|(_, nh)| nh.netif == id)
        .map(|(key, _)| key)
        .collect();
    for key in stale {
        io.nexthops.remove(key);
    }
    Ok(())
}

fn find(io: &Io, addr: Ipv4Address) -> Option<Key> {
    io.nexthops.iter()
        .find(|(_, nh)| nh.addr == addr)
        .map(|(key, _)| key)
}

/// Find or create the next-hop for an address on a connected prefix.
pub(crate) fn resolve(io: &mut Io, addr: Ipv4Address) -> Result<Key> {
    if let Some(key) = find(io, addr) {
        return Ok(key);
    }

    let netif = io.netifs.iter()
        .find(|(_, netif)| netif.config.cidr.contains(addr))
        .map(|(key, _)| NetifId(key))
        .ok_or(Error::Unreachable)?;

    let nexthop = Nexthop {
        addr,
        netif,
        hw_addr: None,
        state: NEXTHOP_IDLE,
        in_use: 0,
        pending: None,
    };

    io.nexthops.insert(nexthop).ok_or(Error::Exhausted)
}

/// The interface a next-hop is attached to.
pub(crate) fn netif_of(io: &Io, key: Key) -> Option<NetifId> {
    io.nexthops.get(key).map(|nh| nh.netif)
}

/// Send an IPv4 packet through a next-hop.
///
/// Without a known hardware address the packet replaces any packet already waiting for the
/// resolution, and the first such packet sends a request.
pub(crate) fn output(io: &mut Io, key: Key, pb: Pbuf) -> Result<()> {
    let nh = io.nexthops.get_mut(key).ok_or(Error::Unreachable)?;
    nh.in_use = NEXTHOP_IN_USE;

    if let Some(hw_addr) = nh.hw_addr {
        let netif = nh.netif;
        return eth::output(io, netif, hw_addr, EthernetProtocol::Ipv4, pb);
    }

    if nh.pending.replace(pb).is_some() {
        net_trace!("arp: replaced pending packet for {}", nh.addr);
    }

    if nh.state == NEXTHOP_IDLE {
        nh.state = NEXTHOP_RESOLVE;
        let (netif, addr) = (nh.netif, nh.addr);
        arp::request(io, netif, addr)?;
    }

    Ok(())
}

/// Record the hardware address of an existing next-hop and flush its pending packet.
pub(crate) fn learn(io: &mut Io, addr: Ipv4Address, hw_addr: EthernetAddress) {
    let key = match find(io, addr) {
        Some(key) => key,
        None => return,
    };

    let (netif, pending) = match io.nexthops.get_mut(key) {
        Some(nh) => {
            nh.hw_addr = Some(hw_addr);
            nh.state = NEXTHOP_REPLIED;
            (nh.netif, nh.pending.take())
        },
        None => return,
    };

    if let Some(pending) = pending {
        net_trace!("arp: {} is at {}, flushing", addr, hw_addr);
        if let Err(_err) = eth::output(io, netif, hw_addr, EthernetProtocol::Ipv4, pending) {
            net_debug!("arp: flushing to {} failed: {}", addr, _err);
        }
    }
}

/// Age all next-hops by one tick.
pub(crate) fn tick(io: &mut Io) {
    let mut expired = Vec::new();
    let mut requests = Vec::new();

    for (key, nh) in io.nexthops.iter_mut() {
        nh.state = nh.state.saturating_sub(1);
        if nh.state == NEXTHOP_IDLE {
            expired.push(key);
            continue;
        }
        if nh.state < NEXTHOP_ACTIVE && nh.in_use > 0 {
            requests.push((nh.netif, nh.addr));
        }
        nh.in_use = nh.in_use.saturating_sub(1);
    }

    for key in expired {
        if let Some(_nh) = io.nexthops.remove(key) {
            net_debug!("arp: expired {}{}", _nh.addr,
                if _nh.pending.is_some() { ", dropping pending packet" } else { "" });
        }
    }

    for (netif, addr) in requests {
        if let Err(_err) = arp::request(io, netif, addr) {
            net_debug!("arp: request for {} failed: {}", addr, _err);
        }
    }
}

/// Inspect the next-hop table.
pub(crate) fn snapshot(io: &Io) -> Vec<NexthopInfo> {
    io.nexthops.iter()
        .map(|(_, nh)| NexthopInfo {
            addr: nh.addr,
            hw_addr: nh.hw_addr,
            state: NexthopState::from_counter(nh.state),
            counter: nh.state,
            in_use: nh.in_use,
            pending: nh.pending.is_some(),
            netif: nh.netif,
        })
        .collect()
}
