//! The TCP connection engine.
//!
//! Every connection is a transmission control block shared between the network context and the
//! application handle, a [`TcpStream`]. The network context owns the protocol: it processes
//! segments, runs the timers and sends everything that goes on the wire. The application only
//! copies bytes into the transmit ring and out of the receive ring under the connection lock and
//! then raises a signal, the network context picks up the work on its next poll.
//!
//! ## Structure
//!
//! Both rings are addressed by sequence number, see [`Ring`]. The transmit ring holds every byte
//! from the oldest unacknowledged one up to the last one written, so retransmissions read from it
//! like first transmissions. The receive ring holds what arrived in order but was not read yet,
//! its free space is the window we advertise.
//!
//! There is no congestion control. A retransmission resends the oldest unacknowledged segment and
//! re-arms the timer with an unchanged timeout, the timeout itself only moves with round-trip
//! samples from segments that were never retransmitted.
//!
//! ## Accepting connections
//!
//! Listening is implicit. A service registers an acceptor for its port, a SYN to the port creates
//! the connection in SYN-RECEIVED and hands the stream to the acceptor right away. An acceptor that
//! drops the stream closes the connection again.
//!
//! ## Lifetime
//!
//! A connection is released once it is CLOSED and the application dropped or closed its handle,
//! in either order. A handle that outlives its connection keeps reporting why it ended.
//!
//! [`TcpStream`]: struct.TcpStream.html
//! [`Ring`]: struct.Ring.html
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use rand::Rng;

use crate::buf::Flags;
use crate::managed::{Key, SlotMap};
use crate::stack::signal::{Signal, Signals};
use crate::stack::Io;
use crate::time::Duration;
use crate::wait::WaitQueue;
use crate::wire::checksum;
use crate::wire::tcp::{self as wire_tcp, Repr as TcpRepr};
use crate::wire::{IpProtocol, Ipv4Address, TcpSeqNumber};

use super::ip::{self, Packet};
use super::netif::{NetifFlags, NetifId};
use super::{Error, Result};

mod input;
mod output;
mod ring;
mod stream;
mod tcb;


pub use self::ring::Ring;
pub use self::stream::TcpStream;

use self::tcb::{Endpoints, Tcb};

/// The range of local ports for active opens.
pub const EPHEMERAL_PORTS: core::ops::RangeInclusive<u16> = 49152..=65535;

/// Called with every connection accepted on a port.
pub type Acceptor = Box<dyn FnMut(TcpStream) + Send>;

/// The timers of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TcpTimer {
    /// Retransmission, or the keepalive while nothing is outstanding.
    Retransmit,
    /// The delayed acknowledgement.
    DelayedAck,
    /// The end of TIME-WAIT.
    TimeWait,
}

/// State enum of the statemachine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// No connection, or one that ended.
    Closed,

    /// Waiting for a connection request.
    ///
    /// Services listen implicitly, no connection is ever in this state.
    Listen,

    /// Our connection request was sent.
    SynSent,

    /// A connection request arrived and was answered, waiting on its ACK.
    SynReceived,

    /// An open connection.
    Established,

    /// Closed our side of the connection.
    FinWait1,

    /// Closed our side and the peer acknowledged it.
    FinWait2,

    /// Both sides closed but the peer did not yet acknowledge our FIN.
    Closing,

    /// Both sides recognized connection as closed.
    TimeWait,

    /// Other side closed its connection.
    CloseWait,

    /// Connection closed after other side closed its already.
    LastAck,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN-SENT",
            TcpState::SynReceived => "SYN-RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN-WAIT-1",
            TcpState::FinWait2 => "FIN-WAIT-2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME-WAIT",
            TcpState::CloseWait => "CLOSE-WAIT",
            TcpState::LastAck => "LAST-ACK",
        };
        f.write_str(name)
    }
}

/// A snapshot of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Our address.
    pub local_addr: Ipv4Address,
    /// Our port.
    pub local_port: u16,
    /// The address of the peer.
    pub remote_addr: Ipv4Address,
    /// The port of the peer.
    pub remote_port: u16,
    /// The state.
    pub state: TcpState,
    /// The oldest unacknowledged sequence number.
    pub snd_una: TcpSeqNumber,
    /// The next sequence number to send.
    pub snd_nxt: TcpSeqNumber,
    /// The window of the peer.
    pub snd_wnd: u32,
    /// The next expected sequence number.
    pub rcv_nxt: TcpSeqNumber,
    /// The window we advertise.
    pub rcv_wnd: u32,
    /// Whether acknowledgements wait for the application to read.
    pub window_closed: bool,
    /// The retransmission timeout.
    pub rto: Duration,
    /// Bytes sent for the first time.
    pub tx_bytes: u64,
    /// Bytes received in order.
    pub rx_bytes: u64,
    /// Bytes sent again.
    pub retransmitted: u64,
}

/// Work requested by the application handle.
mod pending {
    pub(crate) const WRITE: u8 = 0x01;
    pub(crate) const CLOSE: u8 = 0x02;
    pub(crate) const WINDOW: u8 = 0x04;
    pub(crate) const FLUSH: u8 = 0x08;
}

/// The part of a connection shared with its application handle.
pub(crate) struct Shared {
    key: Key,
    endpoints: Endpoints,
    tcb: spin::Mutex<Tcb>,
    readers: WaitQueue,
    writers: WaitQueue,
    pending: AtomicU8,
    signals: Arc<Signals>,
}

struct Service {
    port: u16,
    acceptor: Acceptor,
}

/// All connections and services.
pub(crate) struct Engine {
    tcbs: SlotMap<Arc<Shared>>,
    services: Vec<Service>,
    next_port: u16,
}

impl Shared {
    fn new(tcb: Tcb, signals: Arc<Signals>) -> Self {
        Shared {
            key: tcb.key,
            endpoints: tcb.endpoints,
            tcb: spin::Mutex::new(tcb),
            readers: WaitQueue::new(),
            writers: WaitQueue::new(),
            pending: AtomicU8::new(0),
            signals,
        }
    }

    /// Ask the network context for work on this connection.
    fn request(&self, work: u8) {
        if self.pending.fetch_or(work, Ordering::AcqRel) == 0 {
            self.signals.raise(Signal::Tcp(self.key));
        }
    }

    fn take_pending(&self) -> u8 {
        self.pending.swap(0, Ordering::AcqRel)
    }
}

impl Engine {
    pub(crate) fn new(capacity: usize, first_port: u16) -> Self {
        Engine {
            tcbs: SlotMap::with_capacity(capacity),
            services: Vec::new(),
            next_port: first_port,
        }
    }

    /// Accept connections on `port`.
    pub(crate) fn listen(&mut self, port: u16, acceptor: Acceptor) -> Result<()> {
        if port == 0 || self.services.iter().any(|service| service.port == port) {
            return Err(Error::Illegal);
        }
        self.services.push(Service { port, acceptor });
        Ok(())
    }

    /// Open a connection to `remote_addr`.
    pub(crate) fn connect(&mut self, io: &mut Io, remote_addr: Ipv4Address, remote_port: u16)
        -> Result<TcpStream>
    {
        if remote_port == 0
            || remote_addr.is_broadcast()
            || remote_addr.is_multicast()
            || remote_addr.is_unspecified()
        {
            return Err(Error::Illegal);
        }

        let route = ip::route(io, remote_addr)?;
        let key = self.tcbs.vacant_key().ok_or(Error::Exhausted)?;
        let local_port = self.ephemeral_port().ok_or(Error::Exhausted)?;
        let endpoints = Endpoints {
            local_addr: route.src_addr,
            local_port,
            remote_addr,
            remote_port,
        };

        let iss = TcpSeqNumber(io.rng.gen());
        let mut tcb = Tcb::new(key, endpoints, iss, &io.config, io.now);
        tcb.set_state(TcpState::SynSent);
        tcb.send_syn(io)?;
        tcb.arm(io, TcpTimer::Retransmit, tcb.rtt.rto());

        let shared = Arc::new(Shared::new(tcb, io.signals.clone()));
        if self.tcbs.try_insert(shared.clone()).is_err() {
            return Err(Error::Exhausted);
        }
        Ok(TcpStream::new(shared))
    }

    fn ephemeral_port(&mut self) -> Option<u16> {
        let count = usize::from(EPHEMERAL_PORTS.end() - EPHEMERAL_PORTS.start()) + 1;
        for _ in 0..count {
            let port = self.next_port;
            self.next_port = if port >= *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                port + 1
            };

            let used = self.services.iter().any(|service| service.port == port)
                || self.tcbs.iter().any(|(_, shared)| shared.endpoints.local_port == port);
            if !used {
                return Some(port);
            }
        }
        None
    }

    /// Process a received segment.
    pub(crate) fn input(&mut self, io: &mut Io, packet: Packet) {
        let Packet { netif, repr: ip_repr, pb } = packet;
        if pb.flags().intersects(Flags::BCAST | Flags::MCAST) {
            return;
        }

        let flags = match io.netifs.get(netif.0) {
            Some(iface) => iface.flags,
            None => return,
        };

        let pb = match pb.pullup(wire_tcp::HEADER_LEN) {
            Some(pb) => pb,
            None => return count_malformed(io, netif),
        };

        let len = pb.pktlen();
        if flags.checksum(NetifFlags::TCP_RX_CSUM).manual() {
            let pseudo = checksum::pseudo_header(
                ip_repr.src_addr, ip_repr.dst_addr, IpProtocol::Tcp, len as u16);
            if pb.checksum(0, len, pseudo) != !0 {
                net_trace!("tcp: bad checksum from {}", ip_repr.src_addr);
                if let Some(iface) = io.netifs.get_mut(netif.0) {
                    iface.stats.checksum_errors += 1;
                }
                return;
            }
        }

        let parsed = wire_tcp::tcp::new_checked(pb.data())
            .and_then(|segment| Ok((TcpRepr::parse(segment)?, segment.header_len())));
        let (repr, header_len) = match parsed {
            Ok(parsed) => parsed,
            Err(_err) => {
                net_trace!("tcp: dropping segment: {}", _err);
                return count_malformed(io, netif);
            },
        };

        let payload = match pb.drop_head(header_len) {
            Some(payload) => payload,
            None => return,
        };

        net_trace!("tcp: {}:{} -> {:?} seq={} ack={} win={} len={}",
            ip_repr.src_addr, repr.src_port, repr.flags, repr.seq_number, repr.ack_number,
            repr.window_len, payload.pktlen());

        let endpoints = Endpoints {
            local_addr: ip_repr.dst_addr,
            local_port: repr.dst_port,
            remote_addr: ip_repr.src_addr,
            remote_port: repr.src_port,
        };

        let found = self.tcbs.iter()
            .find(|(_, shared)| shared.endpoints == endpoints && shared.tcb.lock().is_open())
            .map(|(key, shared)| (key, shared.clone()));

        match found {
            Some((key, shared)) => {
                shared.tcb.lock().input(io, &repr, payload);
                self.settle(io, key, &shared);
            },
            None => self.unknown(io, netif, endpoints, &repr, payload),
        }
    }

    /// A segment that belongs to no connection.
    fn unknown(&mut self, io: &mut Io, netif: NetifId, endpoints: Endpoints, repr: &TcpRepr, payload: crate::buf::Pbuf) {
        if repr.flags.rst() {
            return;
        }

        if repr.flags.syn() && !repr.flags.ack() {
            let service = self.services.iter().position(|service| service.port == repr.dst_port);
            if let Some(idx) = service {
                return self.accept(io, idx, endpoints, repr, payload);
            }
        }

        if let Some(iface) = io.netifs.get_mut(netif.0) {
            iface.stats.unknown += 1;
        }
        let seg_len = payload.pktlen() + repr.flags.sequence_len();
        output::reset(io, endpoints.remote_addr, repr, seg_len, payload);
    }

    /// Create a connection for a SYN to a service.
    ///
    /// A SYN that finds the connection table full is refused with a reset.
    fn accept(
        &mut self,
        io: &mut Io,
        idx: usize,
        endpoints: Endpoints,
        repr: &TcpRepr,
        payload: crate::buf::Pbuf,
    ) {
        let key = match self.tcbs.vacant_key() {
            Some(key) => key,
            None => {
                net_debug!("tcp: no room for a connection from {}", endpoints.remote_addr);
                let seg_len = payload.pktlen() + repr.flags.sequence_len();
                return output::reset(io, endpoints.remote_addr, repr, seg_len, payload);
            },
        };

        let iss = TcpSeqNumber(io.rng.gen());
        let mut tcb = Tcb::new(key, endpoints, iss, &io.config, io.now);
        tcb.synchronize(repr);
        tcb.set_state(TcpState::SynReceived);
        if let Err(_err) = tcb.send_syn(io) {
            net_debug!("tcp: syn-ack to {} failed: {}", endpoints.remote_addr, _err);
        }
        tcb.arm(io, TcpTimer::Retransmit, tcb.rtt.rto());

        let shared = Arc::new(Shared::new(tcb, io.signals.clone()));
        if self.tcbs.try_insert(shared.clone()).is_err() {
            return;
        }

        let stream = TcpStream::new(shared);
        (self.services[idx].acceptor)(stream);
    }

    /// A timer of a connection expired.
    pub(crate) fn timer(&mut self, io: &mut Io, key: Key, which: TcpTimer) {
        let shared = match self.tcbs.get(key) {
            Some(shared) => shared.clone(),
            None => return,
        };

        {
            let mut tcb = shared.tcb.lock();
            match which {
                TcpTimer::Retransmit => tcb.retransmit(io),
                TcpTimer::DelayedAck => tcb.delayed_ack(io),
                TcpTimer::TimeWait => tcb.close(io, None),
            }
        }
        self.settle(io, key, &shared);
    }

    /// The application handle of a connection asked for work.
    pub(crate) fn signal(&mut self, io: &mut Io, key: Key) {
        let shared = match self.tcbs.get(key) {
            Some(shared) => shared.clone(),
            None => return,
        };

        let work = shared.take_pending();
        {
            let mut tcb = shared.tcb.lock();
            if work & pending::WINDOW != 0 {
                tcb.window_update(io);
            }
            if work & pending::WRITE != 0 {
                tcb.transmit(io);
            }
            if work & pending::FLUSH != 0 {
                tcb.flush(io);
            }
            if work & pending::CLOSE != 0 {
                tcb.app_close(io);
            }
        }
        self.settle(io, key, &shared);
    }

    /// Look at every connection, after signals were lost.
    pub(crate) fn sweep(&mut self, io: &mut Io) {
        for key in self.tcbs.keys() {
            self.signal(io, key);
        }
    }

    /// Wake the application and release the connection once both sides are done with it.
    fn settle(&mut self, io: &mut Io, key: Key, shared: &Arc<Shared>) {
        let release = {
            let tcb = shared.tcb.lock();
            tcb.state == TcpState::Closed && tcb.app_closed
        };

        shared.readers.wake_all();
        shared.writers.wake_all();

        if release && self.tcbs.remove(key).is_some() {
            shared.tcb.lock().disarm_all(io);
            net_debug!("tcp: released connection to {}:{}",
                shared.endpoints.remote_addr, shared.endpoints.remote_port);
        }
    }

    /// Snapshots of all connections.
    pub(crate) fn connections(&self) -> Vec<ConnectionInfo> {
        self.tcbs.iter()
            .map(|(_, shared)| shared.tcb.lock().info())
            .collect()
    }
}

fn count_malformed(io: &mut Io, netif: NetifId) {
    if let Some(iface) = io.netifs.get_mut(netif.0) {
        iface.stats.malformed += 1;
    }
}
