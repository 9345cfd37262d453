//! Group membership reporting, IGMPv2 host side (RFC 2236).
//!
//! After joining a group we report the membership unsolicited at a fixed interval until the first
//! query for it is heard. From then on reports are only sent in answer to queries, after a random
//! delay bounded by the maximum response time of the query. A report for the same group heard
//! from another host in the meantime cancels ours.
use alloc::vec::Vec;

use rand::Rng;

use crate::stack::timer::Timer;
use crate::stack::Io;
use crate::time::Duration;
use crate::wire::igmp::{self, Message, Repr};
use crate::wire::{IpProtocol, Ipv4Address};

use super::ip::{self, Packet};
use super::{Error, Result};

/// Response time assumed for version 1 queries, which leave the field zero.
const V1_MAX_RESP_TIME: u8 = 100;

/// The memberships of the host.
#[derive(Debug, Default)]
pub(crate) struct Igmp {
    groups: Vec<Group>,
}

#[derive(Clone, Copy, Debug)]
struct Group {
    addr: Ipv4Address,
    /// No query for the group was heard yet.
    unsolicited: bool,
}

impl Igmp {
    pub(crate) fn new() -> Self {
        Igmp::default()
    }

    /// Whether packets to `addr` are delivered to this host.
    pub(crate) fn is_member(&self, addr: Ipv4Address) -> bool {
        addr == Ipv4Address::ALL_SYSTEMS || self.groups.iter().any(|group| group.addr == addr)
    }

    /// The joined groups.
    pub(crate) fn groups(&self) -> impl Iterator<Item = Ipv4Address> + '_ {
        self.groups.iter().map(|group| group.addr)
    }

    pub(crate) fn join(&mut self, io: &mut Io, addr: Ipv4Address) -> Result<()> {
        if !addr.is_multicast() || addr == Ipv4Address::ALL_SYSTEMS {
            return Err(Error::Illegal);
        }
        if self.is_member(addr) {
            return Ok(());
        }

        self.groups.push(Group { addr, unsolicited: true });
        net_debug!("igmp: joined {}", addr);

        let deadline = io.now + io.config.igmp_report_interval;
        io.timers.arm(deadline, Timer::Igmp(addr));
        send(io, Message::V2Report, addr, addr)
    }

    pub(crate) fn leave(&mut self, io: &mut Io, addr: Ipv4Address) -> Result<()> {
        let idx = self.groups.iter()
            .position(|group| group.addr == addr)
            .ok_or(Error::Illegal)?;
        self.groups.remove(idx);
        io.timers.disarm(Timer::Igmp(addr));
        net_debug!("igmp: left {}", addr);

        send(io, Message::Leave, Ipv4Address::ALL_ROUTERS, addr)
    }

    /// The report timer of a group expired.
    pub(crate) fn timer(&mut self, io: &mut Io, addr: Ipv4Address) {
        let group = match self.groups.iter().find(|group| group.addr == addr) {
            Some(group) => *group,
            None => return,
        };

        if group.unsolicited {
            let deadline = io.now + io.config.igmp_report_interval;
            io.timers.arm(deadline, Timer::Igmp(addr));
        }

        if let Err(_err) = send(io, Message::V2Report, addr, addr) {
            net_debug!("igmp: report for {} failed: {}", addr, _err);
        }
    }

    pub(crate) fn input(&mut self, io: &mut Io, packet: Packet) {
        let Packet { netif, repr: ip_repr, pb } = packet;
        let repr = match pb.pullup(igmp::PACKET_LEN) {
            Some(pb) => Repr::parse(igmp::igmp::new_unchecked(pb.data())),
            None => Err(crate::wire::Error::Truncated),
        };

        let repr = match repr {
            Ok(repr) => repr,
            Err(_err) => {
                net_trace!("igmp: dropping message: {}", _err);
                if let Some(iface) = io.netifs.get_mut(netif.0) {
                    iface.stats.malformed += 1;
                }
                return;
            },
        };

        match repr.message {
            Message::MembershipQuery => self.query(io, ip_repr.dst_addr, repr),
            Message::V1Report | Message::V2Report => {
                // Another member answered, ours would be redundant.
                let answered = self.groups.iter()
                    .any(|group| group.addr == repr.group_addr && !group.unsolicited);
                if answered && io.timers.disarm(Timer::Igmp(repr.group_addr)) {
                    net_trace!("igmp: report for {} suppressed", repr.group_addr);
                }
            },
            _ => (),
        }
    }

    fn query(&mut self, io: &mut Io, dst_addr: Ipv4Address, repr: Repr) {
        let general = repr.group_addr.is_unspecified();
        if general && dst_addr != Ipv4Address::ALL_SYSTEMS {
            return;
        }

        let max_resp_time = match repr.max_resp_time {
            0 => V1_MAX_RESP_TIME,
            time => time,
        };
        let max_delay = u64::from(max_resp_time) * 100;

        for group in self.groups.iter_mut() {
            if !general && group.addr != repr.group_addr {
                continue;
            }

            group.unsolicited = false;
            let delay = Duration::from_millis(io.rng.gen_range(0..=max_delay));
            let deadline = io.now + delay;
            let timer = Timer::Igmp(group.addr);
            match io.timers.deadline(timer) {
                Some(pending) if pending <= deadline => (),
                _ => io.timers.arm(deadline, timer),
            }
            net_trace!("igmp: query for {}, reporting at {}", group.addr, deadline);
        }
    }
}

fn send(io: &mut Io, message: Message, dst_addr: Ipv4Address, group_addr: Ipv4Address) -> Result<()> {
    let mut pb = io.pool.alloc(ip::HEADROOM).ok_or(Error::Exhausted)?;
    let packet = pb.append(igmp::PACKET_LEN).ok_or(Error::BadSize)?;
    Repr {
        message,
        max_resp_time: 0,
        group_addr,
    }.emit(igmp::igmp::new_unchecked_mut(packet));

    let route = ip::route(io, dst_addr)?;
    ip::output(io, &route, IpProtocol::Igmp, dst_addr, 1, pb)
}
