use crate::layer::ip;
use crate::managed::Key;
use crate::stack::timer::Timer;
use crate::stack::{Config, Io};
use crate::stream;
use crate::time::{Duration, Instant};
use crate::wire::tcp::{self, Repr as TcpRepr};
use crate::wire::{Ipv4Address, TcpFlags, TcpSeqNumber};

use super::output::{self, HEADROOM};
use super::ring::Ring;
use super::{ConnectionInfo, TcpState, TcpTimer};
use crate::layer::{Error, Result};

/// The lower bound of the retransmission timeout.
const RTO_MIN: Duration = Duration::from_millis(250);

/// The upper bound of the retransmission timeout.
const RTO_MAX: Duration = Duration::from_secs(60);

/// The clock granularity `G` of RFC 6298.
const CLOCK_GRANULARITY: u32 = 1;

/// The addresses and ports of a connection, fixed when it is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Endpoints {
    pub(crate) local_addr: Ipv4Address,
    pub(crate) local_port: u16,
    pub(crate) remote_addr: Ipv4Address,
    pub(crate) remote_port: u16,
}

/// The sending state.
///
/// In RFC 9293 this is referred to as `SND`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Send {
    /// The initial send sequence number, `ISS`.
    ///
    /// The SYN occupies it, the first data byte follows at `iss + 1`.
    pub(crate) iss: TcpSeqNumber,

    /// The oldest unacknowledged sequence number, `SND.UNA`.
    pub(crate) una: TcpSeqNumber,

    /// The next sequence number to send, `SND.NXT`.
    pub(crate) nxt: TcpSeqNumber,

    /// The sequence number of the next byte the application writes.
    ///
    /// The transmit ring holds the bytes from `max(una, iss + 1)` up to here.
    pub(crate) wr: TcpSeqNumber,

    /// The window advertised by the peer, `SND.WND`.
    pub(crate) wnd: u32,

    /// The sequence number of the segment of the last window update, `SND.WL1`.
    pub(crate) wl1: TcpSeqNumber,

    /// The acknowledgement number of the segment of the last window update, `SND.WL2`.
    pub(crate) wl2: TcpSeqNumber,

    /// The largest segment the peer accepts.
    ///
    /// Taken from its MSS option, or 536 bytes without one [RFC 1122].
    pub(crate) mss: usize,
}

/// The receiving state.
///
/// In RFC 9293 this is referred to as `RCV`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Receive {
    /// The initial receive sequence number, `IRS`.
    pub(crate) irs: TcpSeqNumber,

    /// The next expected sequence number, `RCV.NXT`.
    pub(crate) nxt: TcpSeqNumber,

    /// The sequence number of the next byte the application reads.
    pub(crate) rd: TcpSeqNumber,

    /// The largest segment we accept, advertised in our SYN.
    pub(crate) mss: usize,

    /// The sequence number of the FIN of the peer, once received.
    pub(crate) fin: Option<TcpSeqNumber>,
}

/// Round-trip time estimation after RFC 6298.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Rtt {
    /// Smoothed round-trip time in milliseconds.
    srtt: u32,
    /// Round-trip time variation in milliseconds.
    rttvar: u32,
    measured: bool,
    rto: Duration,
    /// The sequence number that must be acknowledged to complete a measurement, and when the
    /// segment leading up to it was sent.
    pub(crate) sample: Option<(TcpSeqNumber, Instant)>,
}

/// Byte counters of a connection.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counters {
    pub(crate) tx_bytes: u64,
    pub(crate) rx_bytes: u64,
    pub(crate) retransmitted: u64,
}

/// The transmission control block of one connection.
pub(crate) struct Tcb {
    pub(crate) key: Key,
    pub(crate) state: TcpState,
    pub(crate) endpoints: Endpoints,
    pub(crate) snd: Send,
    pub(crate) rcv: Receive,
    /// The sequence number of our FIN, a logical byte behind all written data.
    pub(crate) fin: Option<TcpSeqNumber>,
    pub(crate) tx: Ring,
    pub(crate) rx: Ring,
    /// ACKs are held back until the application frees enough of the receive ring.
    pub(crate) window_closed: bool,
    pub(crate) rtt: Rtt,
    pub(crate) last_rx: Instant,
    /// The application released its handle.
    pub(crate) app_closed: bool,
    /// Why the connection ended, if not by an orderly close.
    pub(crate) error: Option<stream::Error>,
    pub(crate) stats: Counters,
    keepalive: Duration,
    timeout: Duration,
    delayed_ack: Duration,
    time_wait: Duration,
}

impl Rtt {
    fn new(initial: Duration) -> Self {
        Rtt {
            srtt: 0,
            rttvar: 0,
            measured: false,
            rto: initial,
            sample: None,
        }
    }

    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    /// Feed a measurement from a segment that was not retransmitted.
    pub(crate) fn update(&mut self, rtt: Duration) {
        let rtt = rtt.as_millis().min(u128::from(u32::max_value() / 8)) as u32;
        if self.measured {
            let delta = if self.srtt > rtt { self.srtt - rtt } else { rtt - self.srtt };
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
        } else {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
            self.measured = true;
        }

        let rto = self.srtt + CLOCK_GRANULARITY.max(4 * self.rttvar);
        self.rto = Duration::from_millis(u64::from(rto)).max(RTO_MIN).min(RTO_MAX);
    }
}

impl Tcb {
    pub(crate) fn new(key: Key, endpoints: Endpoints, iss: TcpSeqNumber, config: &Config, now: Instant)
        -> Self
    {
        Tcb {
            key,
            state: TcpState::Closed,
            endpoints,
            snd: Send {
                iss,
                una: iss,
                nxt: iss,
                wr: iss + 1,
                wnd: 0,
                wl1: TcpSeqNumber::default(),
                wl2: iss,
                mss: config.tcp_send_mss,
            },
            rcv: Receive {
                irs: TcpSeqNumber::default(),
                nxt: TcpSeqNumber::default(),
                rd: TcpSeqNumber::default(),
                mss: config.tcp_recv_mss,
                fin: None,
            },
            fin: None,
            tx: Ring::with_capacity(config.tcp_tx_ring),
            rx: Ring::with_capacity(config.tcp_rx_ring),
            window_closed: false,
            rtt: Rtt::new(config.tcp_rto),
            last_rx: now,
            app_closed: false,
            error: None,
            stats: Counters::default(),
            keepalive: config.tcp_keepalive,
            timeout: config.tcp_timeout,
            delayed_ack: config.tcp_delayed_ack,
            time_wait: config.tcp_time_wait,
        }
    }

    /// Initialize the receive side from the SYN of the peer.
    pub(crate) fn synchronize(&mut self, repr: &TcpRepr) {
        self.rcv.irs = repr.seq_number;
        self.rcv.nxt = repr.seq_number + 1;
        self.rcv.rd = self.rcv.nxt;
        if let Some(mss) = repr.max_seg_size {
            self.snd.mss = usize::from(mss).max(64);
        }
        self.snd.wnd = u32::from(repr.window_len);
        self.snd.wl1 = repr.seq_number;
    }

    /// Whether a segment may be matched against this connection.
    pub(crate) fn is_open(&self) -> bool {
        self.state != TcpState::Closed
    }

    /// The end of the received data, exclusive of the FIN.
    fn rx_end(&self) -> TcpSeqNumber {
        self.rcv.fin.unwrap_or(self.rcv.nxt)
    }

    /// Bytes received but not yet read by the application.
    pub(crate) fn readable(&self) -> usize {
        (self.rx_end() - self.rcv.rd).max(0) as usize
    }

    /// Free space in the receive ring.
    pub(crate) fn rx_free(&self) -> usize {
        self.rx.capacity().saturating_sub(self.readable())
    }

    /// The window we advertise.
    pub(crate) fn rcv_wnd(&self) -> u32 {
        self.rx_free().min(usize::from(u16::max_value())) as u32
    }

    /// Whether the receive window counts as closed.
    pub(crate) fn rx_starved(&self) -> bool {
        self.rx_free() < 2 * self.rcv.mss
    }

    /// Bytes in the transmit ring, sent or not.
    pub(crate) fn tx_used(&self) -> usize {
        let start = self.snd.una.max(self.snd.iss + 1);
        (self.snd.wr - start).max(0) as usize
    }

    pub(crate) fn tx_free(&self) -> usize {
        self.tx.capacity().saturating_sub(self.tx_used())
    }

    /// Written bytes that were never sent.
    pub(crate) fn unsent(&self) -> usize {
        (self.snd.wr - self.snd.nxt).max(0) as usize
    }

    /// Sequence space sent but not acknowledged, including SYN and FIN.
    pub(crate) fn in_flight(&self) -> usize {
        (self.snd.nxt - self.snd.una).max(0) as usize
    }

    /// Whether the application may still write.
    pub(crate) fn can_write(&self) -> bool {
        match self.state {
            TcpState::SynSent
            | TcpState::SynReceived
            | TcpState::Established
            | TcpState::CloseWait => !self.app_closed && self.fin.is_none(),
            _ => false,
        }
    }

    /// Whether the end of the stream was reached, data may still be buffered.
    pub(crate) fn is_eof(&self) -> bool {
        self.rcv.fin.is_some() || self.state == TcpState::Closed
    }

    /// Whether our FIN was sent and acknowledged.
    pub(crate) fn fin_acked(&self) -> bool {
        match self.fin {
            Some(fin) => self.snd.una - fin > 0,
            None => false,
        }
    }

    pub(crate) fn set_state(&mut self, state: TcpState) {
        if self.state != state {
            net_debug!("tcp: {}:{} {} -> {}",
                self.endpoints.remote_addr, self.endpoints.remote_port, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn arm(&self, io: &mut Io, which: TcpTimer, after: Duration) {
        let deadline = io.now + after;
        io.timers.arm(deadline, Timer::Tcp(self.key, which));
    }

    pub(crate) fn disarm(&self, io: &mut Io, which: TcpTimer) -> bool {
        io.timers.disarm(Timer::Tcp(self.key, which))
    }

    pub(crate) fn disarm_all(&self, io: &mut Io) {
        let key = self.key;
        io.timers.disarm_where(|timer| match *timer {
            Timer::Tcp(other, _) => other == key,
            _ => false,
        });
    }

    /// Arm the retransmission timer for whatever is outstanding.
    ///
    /// With nothing in flight the same timer paces keepalives, but never beyond the idle timeout.
    pub(crate) fn rearm(&self, io: &mut Io) {
        if self.in_flight() > 0 {
            self.arm(io, TcpTimer::Retransmit, self.rtt.rto());
        } else {
            let idle = io.now.saturating_since(self.last_rx);
            let remaining = self.timeout.checked_sub(idle).unwrap_or_default();
            let after = self.keepalive.min(remaining.max(Duration::from_millis(1)));
            self.arm(io, TcpTimer::Retransmit, after);
        }
    }

    /// The header of a segment from this connection.
    fn header(&self, seq_number: TcpSeqNumber, flags: TcpFlags) -> TcpRepr {
        TcpRepr {
            src_port: self.endpoints.local_port,
            dst_port: self.endpoints.remote_port,
            seq_number,
            ack_number: if flags.ack() { self.rcv.nxt } else { TcpSeqNumber::default() },
            flags,
            window_len: self.rcv_wnd() as u16,
            max_seg_size: if flags.syn() { Some(self.rcv.mss as u16) } else { None },
        }
    }

    /// Send a segment carrying `len` bytes of the transmit ring starting at `seq_number`.
    fn emit(&self, io: &mut Io, seq_number: TcpSeqNumber, flags: TcpFlags, len: usize) -> Result<()> {
        let mut pb = io.pool.alloc(HEADROOM).ok_or(Error::Exhausted)?;
        if len > 0 {
            let region = pb.append(len).ok_or(Error::BadSize)?;
            self.tx.read_at(seq_number.as_u32(), region);
        }
        let repr = self.header(seq_number, flags);
        output::send(io, self.endpoints.remote_addr, &repr, pb)
    }

    /// The payload that fits into one buffer segment behind all headers and into one frame of
    /// the interface.
    fn segment_space(&self, io: &Io) -> usize {
        let frame = ip::payload_mtu(io, self.endpoints.local_addr)
            .map_or(usize::MAX, |mtu| mtu.saturating_sub(tcp::HEADER_LEN));
        io.pool.segment_size().saturating_sub(HEADROOM)
            .min(self.snd.mss)
            .min(frame)
    }

    /// Send our SYN, or SYN|ACK in answer to the SYN of the peer.
    pub(crate) fn send_syn(&mut self, io: &mut Io) -> Result<()> {
        let flags = match self.state {
            TcpState::SynSent => TcpFlags::SYN,
            _ => TcpFlags::SYN | TcpFlags::ACK,
        };
        self.emit(io, self.snd.iss, flags, 0)?;
        if self.snd.nxt == self.snd.iss {
            self.snd.nxt = self.snd.iss + 1;
            self.rtt.sample = Some((self.snd.nxt, io.now));
        }
        Ok(())
    }

    /// Acknowledge everything received so far.
    pub(crate) fn send_ack(&mut self, io: &mut Io) {
        self.disarm(io, TcpTimer::DelayedAck);
        if let Err(_err) = self.emit(io, self.snd.nxt, TcpFlags::ACK, 0) {
            net_debug!("tcp: ack failed: {}", _err);
        }
    }

    /// Send `RST` with the given sequence number, used for segments that do not fit the state.
    pub(crate) fn send_rst(&mut self, io: &mut Io, seq_number: TcpSeqNumber) {
        if let Err(_err) = self.emit(io, seq_number, TcpFlags::RST, 0) {
            net_debug!("tcp: reset failed: {}", _err);
        }
    }

    /// Send new data, and our FIN once all data is out, as far as the window permits.
    ///
    /// Returns the number of segments sent.
    pub(crate) fn transmit(&mut self, io: &mut Io) -> usize {
        match self.state {
            TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait1
            | TcpState::Closing
            | TcpState::LastAck => (),
            _ => return 0,
        }

        let space = self.segment_space(io);
        let mut sent = 0;
        loop {
            let unsent = self.unsent();
            let in_flight = self.in_flight();
            let usable = (self.snd.wnd as usize).saturating_sub(in_flight);
            let len = unsent.min(space).min(usable);
            let fin = self.fin == Some(self.snd.nxt + len);
            if len == 0 && !fin {
                break;
            }

            let mut flags = TcpFlags::ACK;
            if len > 0 && len == unsent {
                flags = flags | TcpFlags::PSH;
            }
            if fin {
                flags = flags | TcpFlags::FIN;
            }

            if let Err(_err) = self.emit(io, self.snd.nxt, flags, len) {
                net_debug!("tcp: transmit failed: {}", _err);
                break;
            }

            let seq_len = len + fin as usize;
            if self.rtt.sample.is_none() {
                self.rtt.sample = Some((self.snd.nxt + seq_len, io.now));
            }
            self.snd.nxt += seq_len;
            self.stats.tx_bytes += len as u64;
            sent += 1;
            if in_flight == 0 {
                self.arm(io, TcpTimer::Retransmit, self.rtt.rto());
            }
            if fin {
                break;
            }
        }

        if sent > 0 {
            self.disarm(io, TcpTimer::DelayedAck);
        }
        sent
    }

    /// The retransmission timer expired.
    pub(crate) fn retransmit(&mut self, io: &mut Io) {
        if io.now.saturating_since(self.last_rx) >= self.timeout {
            net_debug!("tcp: {}:{} timed out", self.endpoints.remote_addr, self.endpoints.remote_port);
            self.close(io, Some(stream::Error::TimedOut));
            return;
        }

        if self.in_flight() == 0 {
            self.keepalive(io);
            self.rearm(io);
            return;
        }

        // Karn: a sample spanning a retransmission is ambiguous.
        self.rtt.sample = None;

        if self.snd.una == self.snd.iss {
            if let Err(_err) = self.send_syn(io) {
                net_debug!("tcp: syn retransmission failed: {}", _err);
            }
        } else {
            let data_end = match self.fin {
                Some(fin) => fin.min(self.snd.nxt),
                None => self.snd.nxt,
            };
            let outstanding = (data_end - self.snd.una).max(0) as usize;
            let len = outstanding.min(self.segment_space(io));
            let fin_sent = self.fin.map_or(false, |fin| self.snd.nxt - fin > 0);
            let mut flags = TcpFlags::ACK;
            if fin_sent && self.fin == Some(self.snd.una + len) {
                flags = flags | TcpFlags::FIN;
            }
            if len > 0 {
                flags = flags | TcpFlags::PSH;
            }
            match self.emit(io, self.snd.una, flags, len) {
                Ok(()) => self.stats.retransmitted += len as u64,
                Err(_err) => net_debug!("tcp: retransmission failed: {}", _err),
            }
        }

        net_trace!("tcp: retransmitted from {}, rto {}ms", self.snd.una, self.rtt.rto().as_millis());
        self.arm(io, TcpTimer::Retransmit, self.rtt.rto());
    }

    /// Probe an idle peer with one byte it already acknowledged.
    fn keepalive(&mut self, io: &mut Io) {
        match self.state {
            TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait2 => (),
            _ => return,
        }

        let repr = self.header(self.snd.una - 1, TcpFlags::ACK);
        let pb = io.pool.alloc(HEADROOM).and_then(|mut pb| {
            pb.append(1)?.copy_from_slice(&[0]);
            Some(pb)
        });
        let result = match pb {
            Some(pb) => output::send(io, self.endpoints.remote_addr, &repr, pb),
            None => Err(Error::Exhausted),
        };
        if let Err(_err) = result {
            net_debug!("tcp: keepalive failed: {}", _err);
        }
    }

    /// The delayed acknowledgement is due.
    pub(crate) fn delayed_ack(&mut self, io: &mut Io) {
        match self.state {
            TcpState::Closed | TcpState::SynSent | TcpState::TimeWait => (),
            _ => self.send_ack(io),
        }
    }

    /// Received data was stored, decide when to acknowledge it.
    pub(crate) fn acknowledge_data(&mut self, io: &mut Io) {
        if self.transmit(io) > 0 {
            // The ACK went out with the data.
            return;
        }
        if self.rx_starved() {
            net_trace!("tcp: receive window closed");
            self.window_closed = true;
            self.disarm(io, TcpTimer::DelayedAck);
        } else if self.disarm(io, TcpTimer::DelayedAck) {
            // Every second segment is acknowledged at once.
            self.send_ack(io);
        } else {
            self.arm(io, TcpTimer::DelayedAck, self.delayed_ack);
        }
    }

    /// The application freed receive space, announce the reopened window once.
    pub(crate) fn window_update(&mut self, io: &mut Io) {
        if self.window_closed && !self.rx_starved() {
            self.window_closed = false;
            net_trace!("tcp: receive window reopened at {}", self.rcv_wnd());
            self.send_ack(io);
        }
    }

    /// Push data and a pending acknowledgement out now.
    pub(crate) fn flush(&mut self, io: &mut Io) {
        if self.transmit(io) == 0 && self.disarm(io, TcpTimer::DelayedAck) {
            self.send_ack(io);
        }
    }

    /// The application closed its side.
    pub(crate) fn app_close(&mut self, io: &mut Io) {
        match self.state {
            TcpState::SynSent => self.close(io, None),
            TcpState::SynReceived | TcpState::Established => {
                self.fin = Some(self.snd.wr);
                self.set_state(TcpState::FinWait1);
                self.transmit(io);
            },
            TcpState::CloseWait => {
                self.fin = Some(self.snd.wr);
                self.set_state(TcpState::LastAck);
                self.transmit(io);
            },
            _ => (),
        }
    }

    pub(crate) fn enter_time_wait(&mut self, io: &mut Io) {
        self.set_state(TcpState::TimeWait);
        self.disarm_all(io);
        self.arm(io, TcpTimer::TimeWait, self.time_wait);
    }

    /// Move to CLOSED, recording the cause unless the close was orderly.
    ///
    /// A fatal error discards all data the application did not read yet.
    pub(crate) fn close(&mut self, io: &mut Io, error: Option<stream::Error>) {
        self.set_state(TcpState::Closed);
        self.disarm_all(io);
        if let Some(error) = error {
            self.error = Some(error);
            self.rcv.rd = self.rx_end();
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            local_addr: self.endpoints.local_addr,
            local_port: self.endpoints.local_port,
            remote_addr: self.endpoints.remote_addr,
            remote_port: self.endpoints.remote_port,
            state: self.state,
            snd_una: self.snd.una,
            snd_nxt: self.snd.nxt,
            snd_wnd: self.snd.wnd,
            rcv_nxt: self.rcv.nxt,
            rcv_wnd: self.rcv_wnd(),
            window_closed: self.window_closed,
            rto: self.rtt.rto(),
            tx_bytes: self.stats.tx_bytes,
            rx_bytes: self.stats.rx_bytes,
            retransmitted: self.stats.retransmitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rto_follows_rfc6298() {
        let mut rtt = Rtt::new(Duration::from_millis(250));
        assert_eq!(rtt.rto(), Duration::from_millis(250));

        rtt.update(Duration::from_millis(200));
        // srtt 200, rttvar 100
        assert_eq!(rtt.rto(), Duration::from_millis(600));

        rtt.update(Duration::from_millis(200));
        // rttvar (3*100 + 0)/4 = 75
        assert_eq!(rtt.rto(), Duration::from_millis(200 + 4 * 75));
    }

    #[test]
    fn rto_is_clamped() {
        let mut rtt = Rtt::new(Duration::from_millis(250));
        rtt.update(Duration::from_millis(0));
        assert_eq!(rtt.rto(), RTO_MIN);

        let mut rtt = Rtt::new(Duration::from_millis(250));
        rtt.update(Duration::from_secs(100));
        assert_eq!(rtt.rto(), RTO_MAX);
    }
}
