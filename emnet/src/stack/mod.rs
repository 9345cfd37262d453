//! The network context.
//!
//! A [`Stack`] owns every piece of protocol state: the buffer pool, the interfaces and their
//! next-hop tables, the timers, the UDP registry, the IGMP memberships and the TCP engine. Nothing
//! is global, a program may run several stacks side by side.
//!
//! All protocol work happens inside [`Stack::poll`]. Drivers and applications only ever raise
//! signals, a bounded queue of small records naming the interface or connection that needs
//! attention. One poll fires the timers that are due, then drains at most a queue length of
//! signals, each of them doing a bounded amount of work. Should the queue overflow the next poll
//! looks at every interface and connection instead.
//!
//! [`Stack`]: struct.Stack.html
//! [`Stack::poll`]: struct.Stack.html#method.poll
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::task::Waker;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::buf::{BufferPool, Flags, Pbuf};
use crate::layer::netif::{self, Netif, Nexthop};
use crate::layer::tcp::{self, Acceptor, ConnectionInfo, TcpStream};
use crate::layer::udp::{self, Handler};
use crate::layer::{arp, eth, icmp, igmp, ip, Error, Result};
use crate::layer::{NetifConfig, NetifId, NetifStats, NexthopInfo};
use crate::managed::SlotMap;
use crate::nic::{Driver, RxHandle};
use crate::time::{Duration, Instant};
use crate::wire::{EthernetProtocol, IpProtocol, Ipv4Address};

pub(crate) mod signal;
pub(crate) mod timer;

use self::signal::{Signal, Signals};
use self::timer::{Timer, Timers};

/// The tunables of a stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The number of data segments in the buffer pool.
    pub buffers: usize,
    /// The number of chain descriptors in the buffer pool.
    pub descriptors: usize,
    /// The size of one data segment.
    pub segment_size: usize,
    /// The capacity of the signal queue, also the most signals handled in one poll.
    pub signal_depth: usize,
    /// The most interfaces that can be attached.
    pub netifs: usize,
    /// The size of the next-hop table.
    pub nexthops: usize,
    /// The most concurrent TCP connections.
    pub tcp_connections: usize,
    /// The transmit ring of each connection, rounded up to a power of two.
    pub tcp_tx_ring: usize,
    /// The receive ring of each connection, rounded up to a power of two.
    pub tcp_rx_ring: usize,
    /// The segment size assumed for peers that send no MSS option.
    pub tcp_send_mss: usize,
    /// The MSS we advertise.
    pub tcp_recv_mss: usize,
    /// The retransmission timeout before the first measurement.
    pub tcp_rto: Duration,
    /// Probe an idle connection this often.
    pub tcp_keepalive: Duration,
    /// Give up on a connection that received nothing for this long.
    pub tcp_timeout: Duration,
    /// Hold back acknowledgements for this long.
    pub tcp_delayed_ack: Duration,
    /// The duration of TIME-WAIT.
    pub tcp_time_wait: Duration,
    /// The period of next-hop aging.
    pub arp_tick: Duration,
    /// The period of unsolicited membership reports.
    pub igmp_report_interval: Duration,
    /// Seeds initial sequence numbers, IPv4 identifications and report delays.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            buffers: 64,
            descriptors: 64,
            segment_size: 1536,
            signal_depth: 64,
            netifs: 4,
            nexthops: 16,
            tcp_connections: 8,
            tcp_tx_ring: 4096,
            tcp_rx_ring: 4096,
            tcp_send_mss: 536,
            tcp_recv_mss: 1460,
            tcp_rto: Duration::from_millis(250),
            tcp_keepalive: Duration::from_secs(10),
            tcp_timeout: Duration::from_secs(21),
            tcp_delayed_ack: Duration::from_millis(20),
            tcp_time_wait: Duration::from_secs(5),
            arp_tick: Duration::from_secs(1),
            igmp_report_interval: Duration::from_secs(10),
            seed: 0x5eed_0f_e4e7,
        }
    }
}

/// The state shared by all layers.
pub(crate) struct Io {
    pub(crate) config: Config,
    pub(crate) pool: BufferPool,
    pub(crate) netifs: SlotMap<Netif>,
    pub(crate) nexthops: SlotMap<Nexthop>,
    pub(crate) timers: Timers,
    pub(crate) signals: Arc<Signals>,
    pub(crate) rng: SmallRng,
    pub(crate) now: Instant,
}

/// A complete network stack.
pub struct Stack {
    io: Io,
    udp: udp::Registry,
    tcp: tcp::Engine,
    igmp: igmp::Igmp,
}

impl Stack {
    /// Create a stack with its own buffer pool and no interfaces.
    pub fn new(config: Config) -> Self {
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let ephemeral = tcp::EPHEMERAL_PORTS;
        let first_port = rng.gen_range(ephemeral);

        let mut timers = Timers::new();
        timers.arm(Instant::ZERO + config.arp_tick, Timer::ArpTick);

        Stack {
            io: Io {
                config,
                pool: BufferPool::new(config.buffers, config.descriptors, config.segment_size),
                netifs: SlotMap::with_capacity(config.netifs),
                nexthops: SlotMap::with_capacity(config.nexthops),
                timers,
                signals: Arc::new(Signals::new(config.signal_depth)),
                rng,
                now: Instant::ZERO,
            },
            udp: udp::Registry::default(),
            tcp: tcp::Engine::new(config.tcp_connections, first_port),
            igmp: igmp::Igmp::new(),
        }
    }

    /// The configuration the stack was created with.
    pub fn config(&self) -> &Config {
        &self.io.config
    }

    /// The buffer pool, for drivers and applications to allocate from.
    pub fn pool(&self) -> &BufferPool {
        &self.io.pool
    }

    /// Attach an interface.
    ///
    /// The returned handle is where the driver delivers received frames.
    pub fn attach(&mut self, config: NetifConfig, driver: Box<dyn Driver>) -> Result<(NetifId, RxHandle)> {
        netif::attach(&mut self.io, config, driver)
    }

    /// Detach an interface, dropping its queued frames and next-hops.
    pub fn detach(&mut self, id: NetifId) -> Result<()> {
        netif::detach(&mut self.io, id)
    }

    /// Do all work that is due at `now`.
    pub fn poll(&mut self, now: Instant) {
        self.io.now = now;

        while let Some(timer) = self.io.timers.expire(now) {
            self.fire(timer);
        }

        if self.io.signals.take_overflow() {
            net_debug!("stack: signals overflowed, sweeping");
            let netifs: Vec<NetifId> = self.io.netifs.keys().into_iter().map(NetifId).collect();
            for id in netifs {
                self.drain(id);
            }
            self.tcp.sweep(&mut self.io);
        }

        for _ in 0..self.io.config.signal_depth {
            let signal = match self.io.signals.pop() {
                Some(signal) => signal,
                None => break,
            };
            match signal {
                Signal::Rx(id) => self.drain(id),
                Signal::Tcp(key) => self.tcp.signal(&mut self.io, key),
            }
        }
    }

    /// The next time a timer is due, if any.
    pub fn poll_at(&self) -> Option<Instant> {
        self.io.timers.next_deadline()
    }

    /// Whether signals are waiting to be handled.
    pub fn is_signalled(&self) -> bool {
        self.io.signals.is_pending()
    }

    /// Wake `waker` on the next raised signal.
    ///
    /// An event loop that is idle waits for this or the deadline of `poll_at`, whichever is
    /// first.
    pub fn register_waker(&self, waker: &Waker) {
        self.io.signals.register(waker)
    }

    fn fire(&mut self, timer: Timer) {
        match timer {
            Timer::ArpTick => {
                netif::tick(&mut self.io);
                let next = self.io.now + self.io.config.arp_tick;
                self.io.timers.arm(next, Timer::ArpTick);
            },
            Timer::Igmp(group) => self.igmp.timer(&mut self.io, group),
            Timer::Tcp(key, which) => self.tcp.timer(&mut self.io, key, which),
        }
    }

    /// Handle a bounded number of frames from the receive queue of an interface.
    fn drain(&mut self, id: NetifId) {
        let (rx, depth) = match self.io.netifs.get(id.0) {
            Some(iface) => (iface.rx.clone(), iface.config.rx_depth),
            None => return,
        };

        for _ in 0..depth.max(1) {
            match rx.pop() {
                Some(frame) => self.receive(id, frame),
                None => break,
            }
        }
        rx.reschedule();
    }

    fn receive(&mut self, id: NetifId, frame: Pbuf) {
        let (ethertype, pb) = match eth::input(&mut self.io, id, frame) {
            Some(packet) => packet,
            None => return,
        };

        match ethertype {
            EthernetProtocol::Arp => arp::input(&mut self.io, id, pb),
            EthernetProtocol::Ipv4 => self.receive_ipv4(id, pb),
            _ => (),
        }
    }

    fn receive_ipv4(&mut self, id: NetifId, pb: Pbuf) {
        let packet = match ip::input(&mut self.io, id, pb) {
            Some(packet) => packet,
            None => return,
        };

        if packet.pb.flags().contains(Flags::MCAST) && !self.igmp.is_member(packet.repr.dst_addr) {
            net_trace!("ip: not a member of {}", packet.repr.dst_addr);
            return;
        }

        match packet.repr.protocol {
            IpProtocol::Icmp => icmp::input(&mut self.io, packet),
            IpProtocol::Igmp => self.igmp.input(&mut self.io, packet),
            IpProtocol::Udp => udp::input(&mut self.io, &self.udp, packet),
            IpProtocol::Tcp => self.tcp.input(&mut self.io, packet),
            _protocol => {
                net_trace!("ip: no handler for {:?}", _protocol);
                if let Some(iface) = self.io.netifs.get_mut(id.0) {
                    iface.stats.unknown += 1;
                }
            },
        }
    }

    /// Accept TCP connections on `port`.
    pub fn tcp_listen(&mut self, port: u16, acceptor: Acceptor) -> Result<()> {
        self.tcp.listen(port, acceptor)
    }

    /// Open a TCP connection.
    ///
    /// Returns as soon as the SYN is sent, the stream blocks until the handshake completes.
    pub fn tcp_connect(&mut self, remote_addr: Ipv4Address, remote_port: u16) -> Result<TcpStream> {
        self.tcp.connect(&mut self.io, remote_addr, remote_port)
    }

    /// Snapshots of all TCP connections.
    pub fn tcp_connections(&self) -> Vec<ConnectionInfo> {
        self.tcp.connections()
    }

    /// Dispatch datagrams to `port` to `handler`.
    pub fn udp_register(&mut self, port: u16, handler: Handler) -> Result<()> {
        self.udp.register(port, handler)
    }

    /// Replace the UDP registry.
    pub fn set_udp_registry(&mut self, registry: udp::Registry) {
        self.udp = registry;
    }

    /// Send a datagram, its payload allocated with `udp::HEADROOM`.
    pub fn udp_send(&mut self, src_port: u16, dst_addr: Ipv4Address, dst_port: u16, payload: Pbuf)
        -> Result<()>
    {
        udp::send(&mut self.io, src_port, dst_addr, dst_port, payload)
    }

    /// Send a datagram with a copy of `data`.
    pub fn udp_send_slice(&mut self, src_port: u16, dst_addr: Ipv4Address, dst_port: u16, data: &[u8])
        -> Result<()>
    {
        udp::send_slice(&mut self.io, src_port, dst_addr, dst_port, data)
    }

    /// Join a multicast group.
    pub fn igmp_join(&mut self, group: Ipv4Address) -> Result<()> {
        self.igmp.join(&mut self.io, group)
    }

    /// Leave a multicast group.
    pub fn igmp_leave(&mut self, group: Ipv4Address) -> Result<()> {
        self.igmp.leave(&mut self.io, group)
    }

    /// The groups joined.
    pub fn igmp_groups(&self) -> Vec<Ipv4Address> {
        self.igmp.groups().collect()
    }

    /// Snapshots of the next-hop table.
    pub fn nexthops(&self) -> Vec<NexthopInfo> {
        netif::snapshot(&self.io)
    }

    /// The counters of an interface.
    pub fn netif_stats(&self, id: NetifId) -> Result<NetifStats> {
        let iface = self.io.netifs.get(id.0).ok_or(Error::Illegal)?;
        let mut stats = iface.stats;
        stats.rx_dropped = iface.rx.dropped() as u64;
        Ok(stats)
    }
}
