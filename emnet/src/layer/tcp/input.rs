//! Segment arrival for an existing connection.
//!
//! Processing follows the order of RFC 9293, section 3.10.7.4: sequence number acceptance, RST,
//! SYN, ACK, then segment text and FIN. Only the segment starting exactly at `RCV.NXT` is
//! delivered, there is no out of order queue and the peer retransmits whatever we drop.
use crate::buf::Pbuf;
use crate::stack::Io;
use crate::stream;
use crate::wire::tcp::Repr as TcpRepr;
use crate::wire::TcpSeqNumber;

use super::tcb::Tcb;
use super::{TcpState, TcpTimer};

impl Tcb {
    /// Whether a segment of `seg_len` sequence numbers at `seq` is acceptable.
    pub(crate) fn acceptable(&self, seq: TcpSeqNumber, seg_len: usize) -> bool {
        let wnd = self.rcv_wnd();
        let offset = seq - self.rcv.nxt;
        match (seg_len, wnd) {
            (0, 0) => offset == 0,
            (0, wnd) => offset >= 0 && (offset as u32) < wnd,
            (_, 0) => false,
            (_, _) => offset == 0,
        }
    }

    /// Process a segment addressed to this connection.
    ///
    /// `payload` holds the segment text with the header already dropped.
    pub(crate) fn input(&mut self, io: &mut Io, repr: &TcpRepr, payload: Pbuf) {
        if self.state == TcpState::SynSent {
            return self.input_syn_sent(io, repr);
        }

        let seq = repr.seq_number;
        let seg_len = payload.pktlen() + repr.flags.sequence_len();
        if !self.acceptable(seq, seg_len) {
            net_trace!("tcp: unacceptable seq {} len {}, expecting {}", seq, seg_len, self.rcv.nxt);
            if !repr.flags.rst() {
                self.send_ack(io);
            }
            return;
        }

        self.last_rx = io.now;

        if repr.flags.rst() {
            net_debug!("tcp: {}:{} reset by peer", self.endpoints.remote_addr, self.endpoints.remote_port);
            return self.close(io, Some(stream::Error::Reset));
        }

        if repr.flags.syn() {
            // A SYN in a synchronized state is answered and otherwise ignored.
            let rst_seq = if repr.flags.ack() { repr.ack_number } else { self.snd.nxt };
            return self.send_rst(io, rst_seq);
        }

        if !repr.flags.ack() {
            return;
        }

        if !self.input_ack(io, repr) {
            return;
        }

        let fin_acked = self.fin_acked();
        match self.state {
            TcpState::FinWait1 if fin_acked => self.set_state(TcpState::FinWait2),
            TcpState::Closing if fin_acked => return self.enter_time_wait(io),
            TcpState::LastAck if fin_acked => return self.close(io, None),
            _ => (),
        }

        let mut truncated = false;
        let len = payload.pktlen();
        let receiving = match self.state {
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => true,
            _ => false,
        };

        if len > 0 && receiving {
            let take = len.min(self.rx_free());
            truncated = take < len;

            let mut pos = self.rcv.nxt;
            let mut remaining = take;
            for segment in payload.segments() {
                let chunk = segment.len().min(remaining);
                self.rx.write_at(pos.as_u32(), &segment[..chunk]);
                pos += chunk;
                remaining -= chunk;
                if remaining == 0 {
                    break;
                }
            }

            self.rcv.nxt += take;
            self.stats.rx_bytes += take as u64;
            self.acknowledge_data(io);
        }
        drop(payload);

        if repr.flags.fin() && !truncated {
            self.input_fin(io, fin_acked);
        }
    }

    /// Process the acknowledgement field, returning whether to continue with the segment.
    fn input_ack(&mut self, io: &mut Io, repr: &TcpRepr) -> bool {
        let ack = repr.ack_number;

        if self.state == TcpState::SynReceived {
            if ack - self.snd.una >= 0 && self.snd.nxt - ack >= 0 {
                self.set_state(TcpState::Established);
                self.snd.wnd = u32::from(repr.window_len);
                self.snd.wl1 = repr.seq_number;
                self.snd.wl2 = ack;
            } else {
                self.send_rst(io, ack);
                return false;
            }
        }

        if ack - self.snd.una > 0 && self.snd.nxt - ack >= 0 {
            if let Some((expected, sent_at)) = self.rtt.sample {
                if ack - expected >= 0 {
                    self.rtt.update(io.now.saturating_since(sent_at));
                    self.rtt.sample = None;
                }
            }
            self.snd.una = ack;
            self.rearm(io);
        } else if ack - self.snd.nxt > 0 {
            net_trace!("tcp: ack {} beyond snd.nxt {}", ack, self.snd.nxt);
            self.send_ack(io);
            return false;
        }

        let seq = repr.seq_number;
        if self.snd.wl1 - seq < 0 || (self.snd.wl1 == seq && ack - self.snd.wl2 >= 0) {
            self.snd.wnd = u32::from(repr.window_len);
            self.snd.wl1 = seq;
            self.snd.wl2 = ack;
        }

        // Acknowledged data frees ring space and the window may have opened.
        self.transmit(io);
        true
    }

    fn input_fin(&mut self, io: &mut Io, fin_acked: bool) {
        self.rcv.fin = Some(self.rcv.nxt);
        self.rcv.nxt += 1;
        self.send_ack(io);

        match self.state {
            TcpState::SynReceived | TcpState::Established => self.set_state(TcpState::CloseWait),
            TcpState::FinWait1 if fin_acked => self.enter_time_wait(io),
            TcpState::FinWait1 => self.set_state(TcpState::Closing),
            TcpState::FinWait2 => self.enter_time_wait(io),
            TcpState::TimeWait => self.enter_time_wait(io),
            _ => (),
        }
    }

    /// A segment in answer to our SYN.
    fn input_syn_sent(&mut self, io: &mut Io, repr: &TcpRepr) {
        let flags = repr.flags;
        let ack = repr.ack_number;

        if flags.ack() && (ack - self.snd.iss <= 0 || ack - self.snd.nxt > 0) {
            if !flags.rst() {
                self.send_rst(io, ack);
            }
            return;
        }

        if flags.rst() {
            if flags.ack() {
                net_debug!("tcp: {}:{} refused", self.endpoints.remote_addr, self.endpoints.remote_port);
                self.close(io, Some(stream::Error::Refused));
            }
            return;
        }

        if !flags.syn() {
            return;
        }

        self.synchronize(repr);
        self.last_rx = io.now;

        if flags.ack() {
            if let Some((expected, sent_at)) = self.rtt.sample {
                if ack - expected >= 0 {
                    self.rtt.update(io.now.saturating_since(sent_at));
                    self.rtt.sample = None;
                }
            }
            self.snd.una = ack;
            self.snd.wl2 = ack;
            self.set_state(TcpState::Established);
            self.rearm(io);
            // Data written while connecting carries the acknowledgement.
            if self.transmit(io) == 0 {
                self.send_ack(io);
            }
        } else {
            // Simultaneous open.
            self.set_state(TcpState::SynReceived);
            if let Err(_err) = self.send_syn(io) {
                net_debug!("tcp: syn-ack failed: {}", _err);
            }
            self.arm(io, TcpTimer::Retransmit, self.rtt.rto());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::SlotMap;
    use crate::stack::Config;
    use crate::layer::tcp::tcb::Endpoints;
    use crate::time::Instant;
    use crate::wire::Ipv4Address;

    fn tcb(rx_ring: usize) -> Tcb {
        let mut keys = SlotMap::with_capacity(1);
        let key = keys.insert(()).unwrap();
        let config = Config { tcp_rx_ring: rx_ring, ..Config::default() };
        let endpoints = Endpoints {
            local_addr: Ipv4Address::new(10, 0, 0, 1),
            local_port: 80,
            remote_addr: Ipv4Address::new(10, 0, 0, 2),
            remote_port: 40000,
        };
        let mut tcb = Tcb::new(key, endpoints, TcpSeqNumber(1000), &config, Instant::ZERO);
        tcb.rcv.nxt = TcpSeqNumber(5000);
        tcb.rcv.rd = TcpSeqNumber(5000);
        tcb
    }

    #[test]
    fn acceptance_with_open_window() {
        let tcb = tcb(1024);
        assert_eq!(tcb.rcv_wnd(), 1024);
        // Pure ACKs anywhere in the window.
        assert!(tcb.acceptable(TcpSeqNumber(5000), 0));
        assert!(tcb.acceptable(TcpSeqNumber(5000 + 1023), 0));
        assert!(!tcb.acceptable(TcpSeqNumber(5000 + 1024), 0));
        assert!(!tcb.acceptable(TcpSeqNumber(4999), 0));
        // Data only at exactly the next sequence number.
        assert!(tcb.acceptable(TcpSeqNumber(5000), 10));
        assert!(!tcb.acceptable(TcpSeqNumber(5001), 10));
        assert!(!tcb.acceptable(TcpSeqNumber(4990), 10));
    }

    #[test]
    fn acceptance_with_closed_window() {
        let mut tcb = tcb(16);
        tcb.rcv.nxt = TcpSeqNumber(5016);
        assert_eq!(tcb.rcv_wnd(), 0);
        assert!(tcb.acceptable(TcpSeqNumber(5016), 0));
        assert!(!tcb.acceptable(TcpSeqNumber(5017), 0));
        assert!(!tcb.acceptable(TcpSeqNumber(5016), 1));
    }

    #[test]
    fn acceptance_across_wraparound() {
        let mut tcb = tcb(1024);
        tcb.rcv.nxt = TcpSeqNumber::from_u32(0xffff_fff0);
        tcb.rcv.rd = tcb.rcv.nxt;
        assert!(tcb.acceptable(TcpSeqNumber::from_u32(0x10), 0));
        assert!(tcb.acceptable(TcpSeqNumber::from_u32(0xffff_fff0), 100));
        assert!(!tcb.acceptable(TcpSeqNumber::from_u32(0xffff_ffe0), 0));
    }
}
