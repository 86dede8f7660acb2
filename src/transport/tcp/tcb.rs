//! Transmission control block
//!
//! One connection's sequence variables, buffers and timers, and its reaction
//! to arriving segments (RFC 9293 section 3.10.7), user calls and timer
//! expiry. Control transitions go through [`fsm::transition`]; segments to
//! send and notifications for the application are queued on the TCB and
//! collected by the store.

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use super::buffer::{RecvBuffer, SendBuffer};
use super::congestion::Congestion;
use super::fsm::{self, FsmAction, FsmInput, TcpState};
use super::header::{TcpFlags, TcpHeader};
use super::rtt::RttEstimator;
use super::seq::SeqNum;
use crate::config::{Millis, TcpConfig};
use crate::error::{SocketError, SocketResult};

/// MSS assumed when the peer's SYN carries no option
pub const DEFAULT_PEER_MSS: u16 = 536;

/// Connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Notifications delivered to the application, in the order they occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    Established,
    DataAvailable,
    PeerClosed,
    Reset,
    TimedOut,
    Unreachable,
    Closed,
}

/// A segment ready to be wrapped in IP and sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
    pub retransmission: bool,
}

/// Outcome of a receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    /// Nothing buffered yet; the caller should wait
    Empty,
    /// The peer closed its side and every byte has been read
    Eof,
}

#[derive(Debug, Clone, Copy)]
struct SentSegment {
    seq: SeqNum,
    len: u32,
    syn: bool,
    fin: bool,
    sent_at: Millis,
    retransmitted: bool,
}

#[derive(Debug, Default)]
struct Timers {
    retransmit: Option<Millis>,
    delayed_ack: Option<Millis>,
    persist: Option<Millis>,
    keepalive: Option<Millis>,
    time_wait: Option<Millis>,
}

impl Timers {
    fn next(&self) -> Option<Millis> {
        [
            self.retransmit,
            self.delayed_ack,
            self.persist,
            self.keepalive,
            self.time_wait,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

fn due(deadline: Option<Millis>, now: Millis) -> bool {
    deadline.map_or(false, |at| at <= now)
}

#[derive(Debug)]
pub struct Tcb {
    key: ConnKey,
    state: TcpState,
    config: TcpConfig,

    iss: SeqNum,
    snd_una: SeqNum,
    snd_nxt: SeqNum,
    snd_wnd: u32,
    snd_wl1: SeqNum,
    snd_wl2: SeqNum,
    irs: SeqNum,
    /// Set once the peer's SYN has been seen
    irs_known: bool,
    rcv_nxt: SeqNum,

    send_buf: SendBuffer,
    recv_buf: RecvBuffer,
    rtx: VecDeque<SentSegment>,
    rtt: RttEstimator,
    cc: Congestion,
    dup_acks: u32,

    /// MSS we advertise
    local_mss: u16,
    /// Largest segment we send
    mss: u16,

    fin_queued: bool,
    fin_seq: Option<SeqNum>,
    fin_received: bool,
    /// In-order bytes received since we last sent an ACK
    unacked_bytes: usize,

    timers: Timers,
    persist_backoff: u32,
    keepalive_probes: u32,

    error: Option<SocketError>,
    user_closed: bool,
    released: bool,

    outbound: VecDeque<TcpSegment>,
    events: VecDeque<TcpEvent>,
}

impl Tcb {
    fn new(key: ConnKey, iss: SeqNum, config: &TcpConfig, local_mss: u16) -> Self {
        Tcb {
            key,
            state: TcpState::Closed,
            config: config.clone(),
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: SeqNum(0),
            snd_wl2: iss,
            irs: SeqNum(0),
            irs_known: false,
            rcv_nxt: SeqNum(0),
            send_buf: SendBuffer::new(config.send_buffer),
            recv_buf: RecvBuffer::new(config.recv_buffer),
            rtx: VecDeque::new(),
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto),
            cc: Congestion::new(DEFAULT_PEER_MSS as u32, config.initial_cwnd_segments),
            dup_acks: 0,
            local_mss,
            mss: DEFAULT_PEER_MSS.min(local_mss),
            fin_queued: false,
            fin_seq: None,
            fin_received: false,
            unacked_bytes: 0,
            timers: Timers::default(),
            persist_backoff: 0,
            keepalive_probes: 0,
            error: None,
            user_closed: false,
            released: false,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Active open: queue a SYN towards `key.remote`
    pub fn connect(
        key: ConnKey,
        iss: SeqNum,
        config: &TcpConfig,
        local_mss: u16,
        now: Millis,
    ) -> Self {
        let mut tcb = Tcb::new(key, iss, config, local_mss);
        tcb.apply(FsmInput::ActiveOpen, now);
        tcb
    }

    /// Passive open in response to a SYN that matched a listener
    pub fn accept_syn(
        key: ConnKey,
        iss: SeqNum,
        config: &TcpConfig,
        local_mss: u16,
        syn: &TcpHeader,
        now: Millis,
    ) -> Self {
        let mut tcb = Tcb::new(key, iss, config, local_mss);
        tcb.apply(FsmInput::PassiveOpen, now);
        tcb.irs = SeqNum(syn.seq_number);
        tcb.irs_known = true;
        tcb.rcv_nxt = tcb.irs + 1;
        tcb.snd_wnd = syn.window_size as u32;
        tcb.snd_wl1 = tcb.irs;
        tcb.set_peer_mss(syn.mss);
        tcb.apply(FsmInput::RecvSyn, now);
        tcb
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn user_closed(&self) -> bool {
        self.user_closed
    }

    pub fn error(&self) -> Option<&SocketError> {
        self.error.as_ref()
    }

    pub fn snd_una(&self) -> SeqNum {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> SeqNum {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> SeqNum {
        self.rcv_nxt
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn congestion(&self) -> &Congestion {
        &self.cc
    }

    /// Room left in the send buffer
    pub fn send_capacity(&self) -> usize {
        self.send_buf.free()
    }

    pub fn readable(&self) -> bool {
        self.recv_buf.available() > 0 || self.fin_received || self.released
    }

    pub fn take_outbound(&mut self) -> Drain<'_, TcpSegment> {
        self.outbound.drain(..)
    }

    pub fn take_events(&mut self) -> Drain<'_, TcpEvent> {
        self.events.drain(..)
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        if self.released {
            return None;
        }
        self.timers.next()
    }

    fn apply(&mut self, input: FsmInput, now: Millis) -> bool {
        let Some(t) = fsm::transition(self.state, input) else {
            trace!(conn = %self.key, state = %self.state, ?input, "input has no transition");
            return false;
        };
        if t.next != self.state {
            debug!(conn = %self.key, from = %self.state, to = %t.next, ?input, "tcp state transition");
        }
        self.state = t.next;
        for &action in t.actions {
            self.perform(action, now);
        }
        true
    }

    fn perform(&mut self, action: FsmAction, now: Millis) {
        match action {
            FsmAction::SendSyn | FsmAction::SendSynAck => {
                if self.snd_nxt == self.iss {
                    self.rtx.push_back(SentSegment {
                        seq: self.iss,
                        len: 1,
                        syn: true,
                        fin: false,
                        sent_at: now,
                        retransmitted: false,
                    });
                    self.snd_nxt = self.iss + 1;
                }
                self.emit_syn(false);
                self.arm_retransmit(now);
            }
            FsmAction::SendAck => self.send_ack(),
            FsmAction::SendFin => {
                self.fin_queued = true;
                self.output(now);
            }
            FsmAction::SendRst => self.emit(TcpFlags::RST, self.snd_nxt, Vec::new(), false),
            FsmAction::StartTimeWait => {
                self.rtx.clear();
                self.timers = Timers {
                    time_wait: Some(now + 2 * self.config.msl),
                    ..Timers::default()
                };
            }
            FsmAction::NotifyEstablished => self.events.push_back(TcpEvent::Established),
            FsmAction::NotifyPeerClosed => self.events.push_back(TcpEvent::PeerClosed),
            FsmAction::NotifyReset => {
                self.error = Some(SocketError::Reset);
                self.events.push_back(TcpEvent::Reset);
            }
            FsmAction::NotifyTimeout => {
                self.error = Some(SocketError::TimedOut);
                self.events.push_back(TcpEvent::TimedOut);
            }
            FsmAction::NotifyClosed => self.events.push_back(TcpEvent::Closed),
            FsmAction::Release => self.release(),
        }
    }

    fn release(&mut self) {
        self.send_buf.clear();
        self.recv_buf.clear();
        self.rtx.clear();
        self.timers = Timers::default();
        self.released = true;
    }

    fn set_peer_mss(&mut self, peer: Option<u16>) {
        self.mss = peer.unwrap_or(DEFAULT_PEER_MSS).min(self.local_mss).max(1);
        self.cc
            .set_mss(self.mss as u32, self.config.initial_cwnd_segments);
    }

    fn advertised_window(&self) -> u16 {
        self.recv_buf.window().min(u16::MAX as usize) as u16
    }

    fn emit(&mut self, flags: TcpFlags, seq: SeqNum, payload: Vec<u8>, retransmission: bool) {
        let header = TcpHeader {
            src_port: self.key.local.port(),
            dst_port: self.key.remote.port(),
            seq_number: seq.0,
            ack_number: if flags.ack() { self.rcv_nxt.0 } else { 0 },
            flags,
            window_size: self.advertised_window(),
            urgent_ptr: 0,
            mss: flags.syn().then_some(self.local_mss),
        };
        if flags.ack() {
            self.timers.delayed_ack = None;
            self.unacked_bytes = 0;
        }
        trace!(conn = %self.key, %flags, seq = seq.0, len = payload.len(), "tcp segment out");
        self.outbound.push_back(TcpSegment {
            header,
            payload,
            retransmission,
        });
    }

    fn emit_syn(&mut self, retransmission: bool) {
        let mut flags = TcpFlags::SYN;
        if self.irs_known {
            flags |= TcpFlags::ACK;
        }
        self.emit(flags, self.iss, Vec::new(), retransmission);
    }

    fn send_ack(&mut self) {
        self.emit(TcpFlags::ACK, self.snd_nxt, Vec::new(), false);
    }

    fn arm_retransmit(&mut self, now: Millis) {
        if self.timers.retransmit.is_none() {
            self.timers.retransmit = Some(now + self.rtt.rto());
        }
    }

    fn rearm_keepalive(&mut self, now: Millis) {
        self.timers.keepalive = match self.config.keepalive_idle {
            Some(idle) if self.state == TcpState::Established => Some(now + idle),
            _ => None,
        };
    }

    /// Sequence space sent but not yet acknowledged
    fn flight(&self) -> u32 {
        (self.snd_nxt - self.snd_una) as u32
    }

    /// Data bytes between SND.UNA and SND.NXT
    fn data_in_flight(&self) -> usize {
        let fin_outstanding = self
            .fin_seq
            .map_or(false, |fin| self.snd_una <= fin);
        (self.flight() - fin_outstanding as u32) as usize
    }

    fn persist_interval(&self) -> Millis {
        self.rtt
            .rto()
            .checked_shl(self.persist_backoff)
            .unwrap_or(self.config.max_persist)
            .min(self.config.max_persist)
    }

    /// Process one arriving segment addressed to this connection
    pub fn on_segment(&mut self, header: &TcpHeader, payload: &[u8], now: Millis) {
        if self.released {
            return;
        }
        self.keepalive_probes = 0;
        match self.state {
            TcpState::Closed | TcpState::Listen => {}
            TcpState::SynSent => self.on_segment_syn_sent(header, now),
            _ => self.on_segment_synchronized(header, payload, now),
        }
        if !self.released {
            self.output(now);
            self.rearm_keepalive(now);
        }
    }

    fn on_segment_syn_sent(&mut self, header: &TcpHeader, now: Millis) {
        let flags = header.flags;
        let seq = SeqNum(header.seq_number);
        let ack = SeqNum(header.ack_number);

        if flags.ack() && (ack <= self.iss || ack > self.snd_nxt) {
            trace!(conn = %self.key, ack = ack.0, "unacceptable ACK in SYN_SENT");
            if !flags.rst() {
                self.emit(TcpFlags::RST, ack, Vec::new(), false);
            }
            return;
        }
        if flags.rst() {
            if flags.ack() {
                self.apply(FsmInput::RecvRst, now);
            }
            return;
        }
        if !flags.syn() {
            return;
        }

        self.irs = seq;
        self.irs_known = true;
        self.rcv_nxt = seq + 1;
        self.set_peer_mss(header.mss);
        self.snd_wnd = header.window_size as u32;
        self.snd_wl1 = seq;
        if flags.ack() {
            self.snd_wl2 = ack;
            self.process_ack(ack, now);
            self.apply(FsmInput::RecvSynAck, now);
        } else {
            self.apply(FsmInput::RecvSyn, now);
        }
    }

    fn acceptable(&self, seq: SeqNum, seg_len: u32) -> bool {
        let window = self.recv_buf.window() as u32;
        match (seg_len, window) {
            (0, 0) => seq == self.rcv_nxt,
            (0, _) => seq.in_window(self.rcv_nxt, window),
            (_, 0) => false,
            (_, _) => {
                seq.in_window(self.rcv_nxt, window)
                    || (seq + (seg_len - 1)).in_window(self.rcv_nxt, window)
            }
        }
    }

    fn on_segment_synchronized(&mut self, header: &TcpHeader, payload: &[u8], now: Millis) {
        let flags = header.flags;
        let seq = SeqNum(header.seq_number);
        let ack = SeqNum(header.ack_number);

        if !self.acceptable(seq, header.segment_len(payload.len())) {
            if flags.rst() {
                return;
            }
            if self.state == TcpState::SynReceived && flags.syn() && seq == self.irs {
                if !flags.ack() {
                    // Our SYN-ACK was lost and the peer repeated its SYN.
                    self.emit_syn(true);
                    return;
                }
                // Simultaneous open: the peer's SYN-ACK repeats the SYN we
                // already hold. Trim it and handle what is left.
                let trimmed = TcpHeader {
                    seq_number: (seq + 1).0,
                    flags: TcpFlags(flags.0 & !TcpFlags::SYN.0),
                    ..*header
                };
                self.on_segment_synchronized(&trimmed, payload, now);
                return;
            }
            if self.state == TcpState::TimeWait && flags.fin() {
                self.apply(FsmInput::RecvFin, now);
                return;
            }
            trace!(conn = %self.key, seq = seq.0, rcv_nxt = self.rcv_nxt.0, "segment outside window");
            self.send_ack();
            if flags.ack() && seq == self.rcv_nxt {
                // A closed receive window still lets acknowledgements through.
                self.on_ack_field(header, 0, now);
            }
            return;
        }

        if flags.rst() {
            self.apply(FsmInput::RecvRst, now);
            return;
        }
        if flags.syn() {
            debug!(conn = %self.key, "SYN on synchronized connection, sending challenge ACK");
            self.send_ack();
            return;
        }
        if !flags.ack() {
            return;
        }

        if self.state == TcpState::SynReceived {
            if !(self.snd_una < ack && ack <= self.snd_nxt) {
                self.emit(TcpFlags::RST, ack, Vec::new(), false);
                return;
            }
            self.snd_wnd = header.window_size as u32;
            self.snd_wl1 = seq;
            self.snd_wl2 = ack;
            self.apply(FsmInput::RecvAckOfSyn, now);
        }

        if !self.on_ack_field(header, payload.len(), now) || self.released {
            return;
        }
        self.on_data(seq, payload, flags.fin(), now);
    }

    /// Returns false when the segment should be dropped
    fn on_ack_field(&mut self, header: &TcpHeader, payload_len: usize, now: Millis) -> bool {
        let seq = SeqNum(header.seq_number);
        let ack = SeqNum(header.ack_number);
        let window = header.window_size as u32;

        if ack > self.snd_nxt {
            trace!(conn = %self.key, ack = ack.0, "ACK for data not yet sent");
            self.send_ack();
            return false;
        }

        if ack > self.snd_una {
            self.process_ack(ack, now);
            if self.released {
                return false;
            }
        } else if ack == self.snd_una
            && payload_len == 0
            && !header.flags.fin()
            && window == self.snd_wnd
            && !self.rtx.is_empty()
        {
            self.dup_acks += 1;
            if self.cc.on_dup_ack(self.dup_acks, self.flight()) {
                debug!(conn = %self.key, una = self.snd_una.0, "fast retransmit");
                self.retransmit_front(now);
            }
        }

        if self.snd_wl1 < seq || (self.snd_wl1 == seq && self.snd_wl2 <= ack) {
            self.snd_wnd = window;
            self.snd_wl1 = seq;
            self.snd_wl2 = ack;
            if window > 0 {
                self.timers.persist = None;
                self.persist_backoff = 0;
            }
        }
        true
    }

    /// Handle an acknowledgement that advances SND.UNA
    fn process_ack(&mut self, ack: SeqNum, now: Millis) {
        let acked = (ack - self.snd_una) as u32;
        let syn_acked = self.snd_una == self.iss;
        let fin_acked = self
            .fin_seq
            .map_or(false, |fin| self.snd_una <= fin && ack > fin);
        let data_acked = acked - syn_acked as u32 - fin_acked as u32;
        self.send_buf.ack(data_acked as usize);
        self.snd_una = ack;

        let mut sample = None;
        while let Some(front) = self.rtx.front_mut() {
            if front.seq + front.len <= ack {
                // Karn: a retransmitted segment gives no usable sample.
                if !front.retransmitted {
                    sample = Some(now.saturating_sub(front.sent_at));
                }
                self.rtx.pop_front();
            } else {
                if front.seq < ack {
                    let cut = (ack - front.seq) as u32;
                    front.seq = ack;
                    front.len -= cut;
                }
                break;
            }
        }
        if let Some(rtt) = sample {
            self.rtt.sample(rtt);
        }
        self.rtt.reset_backoff();
        self.dup_acks = 0;
        if data_acked > 0 {
            self.cc.on_ack(data_acked);
        }
        self.timers.retransmit = if self.rtx.is_empty() {
            None
        } else {
            Some(now + self.rtt.rto())
        };

        if fin_acked {
            self.apply(FsmInput::RecvAckOfFin, now);
        }
    }

    fn on_data(&mut self, seq: SeqNum, payload: &[u8], fin: bool, now: Millis) {
        if !self.state.can_receive() {
            return;
        }
        let mut ack_now = false;
        if !payload.is_empty() {
            let offset = seq - self.rcv_nxt;
            let (offset, data) = if offset < 0 {
                let skip = offset.unsigned_abs() as usize;
                (0, payload.get(skip..).unwrap_or(&[]))
            } else {
                (offset as usize, payload)
            };
            let advanced = if data.is_empty() {
                0
            } else {
                self.recv_buf.insert(offset, data)
            };
            if advanced > 0 {
                self.rcv_nxt = self.rcv_nxt + advanced as u32;
                self.unacked_bytes += advanced;
                self.events.push_back(TcpEvent::DataAvailable);
                // A filled gap is acknowledged at once.
                if advanced > data.len() || self.unacked_bytes >= 2 * self.local_mss as usize {
                    ack_now = true;
                }
            } else {
                // Out of order or duplicate: the immediate ACK doubles as a
                // duplicate ACK for the sender's fast retransmit.
                ack_now = true;
            }
        }

        if fin {
            let fin_offset = (seq + payload.len() as u32) - self.rcv_nxt;
            if fin_offset >= 0 {
                self.recv_buf.mark_fin(fin_offset as usize);
            }
        }
        if !self.fin_received && self.recv_buf.fin_reached() {
            self.fin_received = true;
            self.rcv_nxt = self.rcv_nxt + 1;
            self.apply(FsmInput::RecvFin, now);
            return;
        }

        if ack_now {
            self.send_ack();
        } else if self.unacked_bytes > 0 && self.timers.delayed_ack.is_none() {
            self.timers.delayed_ack = Some(now + self.config.delayed_ack);
        }
    }

    /// Send new data and a queued FIN as far as the windows allow
    fn output(&mut self, now: Millis) {
        if !matches!(
            self.state,
            TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 | TcpState::LastAck
        ) || self.snd_una == self.iss
        {
            return;
        }
        loop {
            let offset = self.data_in_flight();
            let unsent = self.send_buf.len().saturating_sub(offset);
            if unsent == 0 {
                break;
            }
            let window = self.cc.cwnd().min(self.snd_wnd);
            let usable = window.saturating_sub(self.flight()) as usize;
            if usable == 0 {
                if self.snd_wnd == 0 && self.rtx.is_empty() && self.timers.persist.is_none() {
                    trace!(conn = %self.key, "peer window closed, arming persist timer");
                    self.timers.persist = Some(now + self.persist_interval());
                }
                // The FIN stays behind unsent data.
                return;
            }
            let len = unsent.min(usable).min(self.mss as usize);
            let payload = self.send_buf.slice(offset, len);
            let seq = self.snd_nxt;
            let mut flags = TcpFlags::ACK;
            if len == unsent {
                flags |= TcpFlags::PSH;
            }
            self.emit(flags, seq, payload, false);
            self.rtx.push_back(SentSegment {
                seq,
                len: len as u32,
                syn: false,
                fin: false,
                sent_at: now,
                retransmitted: false,
            });
            self.snd_nxt = seq + len as u32;
            self.arm_retransmit(now);
        }

        if self.fin_queued && self.fin_seq.is_none() {
            let seq = self.snd_nxt;
            self.emit(TcpFlags::FIN | TcpFlags::ACK, seq, Vec::new(), false);
            self.rtx.push_back(SentSegment {
                seq,
                len: 1,
                syn: false,
                fin: true,
                sent_at: now,
                retransmitted: false,
            });
            self.fin_seq = Some(seq);
            self.snd_nxt = seq + 1;
            self.arm_retransmit(now);
        }
    }

    fn retransmit_front(&mut self, now: Millis) {
        let Some(front) = self.rtx.front_mut() else {
            return;
        };
        front.retransmitted = true;
        front.sent_at = now;
        let segment = *front;
        if segment.syn {
            self.emit_syn(true);
        } else if segment.fin {
            self.emit(TcpFlags::FIN | TcpFlags::ACK, segment.seq, Vec::new(), true);
        } else {
            let offset = (segment.seq - self.snd_una) as usize;
            let payload = self.send_buf.slice(offset, segment.len as usize);
            self.emit(TcpFlags::ACK | TcpFlags::PSH, segment.seq, payload, true);
        }
    }

    /// Fire every timer due at `now`
    pub fn poll(&mut self, now: Millis) {
        if self.released {
            return;
        }
        if due(self.timers.time_wait, now) {
            self.timers.time_wait = None;
            self.apply(FsmInput::TimeWaitExpired, now);
            return;
        }
        if due(self.timers.retransmit, now) {
            self.on_retransmit_timeout(now);
            if self.released {
                return;
            }
        }
        if due(self.timers.persist, now) {
            self.persist_backoff = self.persist_backoff.saturating_add(1).min(31);
            trace!(conn = %self.key, "zero window probe");
            self.emit(TcpFlags::ACK, self.snd_una - 1, Vec::new(), false);
            self.timers.persist = Some(now + self.persist_interval());
        }
        if due(self.timers.delayed_ack, now) {
            self.send_ack();
        }
        if due(self.timers.keepalive, now) {
            self.on_keepalive_timeout(now);
        }
    }

    fn on_retransmit_timeout(&mut self, now: Millis) {
        self.timers.retransmit = None;
        if self.rtx.is_empty() {
            return;
        }
        let attempt = self.rtt.back_off();
        let limit = if self.state.is_synchronized() {
            self.config.max_retransmits
        } else {
            self.config.max_syn_retransmits
        };
        if attempt > limit {
            warn!(conn = %self.key, state = %self.state, retransmits = limit, "retransmission limit reached");
            self.apply(FsmInput::Timeout, now);
            return;
        }
        self.cc.on_timeout(self.flight());
        self.dup_acks = 0;
        debug!(conn = %self.key, attempt, rto = self.rtt.rto(), "retransmission timeout");
        self.retransmit_front(now);
        self.timers.retransmit = Some(now + self.rtt.rto());
    }

    fn on_keepalive_timeout(&mut self, now: Millis) {
        if self.keepalive_probes >= self.config.keepalive_probes {
            warn!(conn = %self.key, probes = self.keepalive_probes, "keepalive unanswered");
            self.apply(FsmInput::Timeout, now);
            return;
        }
        self.keepalive_probes += 1;
        trace!(conn = %self.key, probe = self.keepalive_probes, "keepalive probe");
        self.emit(TcpFlags::ACK, self.snd_nxt - 1, Vec::new(), false);
        self.timers.keepalive = Some(now + self.config.keepalive_interval);
    }

    /// Queue application data; returns how many bytes were accepted
    pub fn send(&mut self, data: &[u8], now: Millis) -> SocketResult<usize> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if !self.state.can_send() || self.fin_queued {
            return Err(SocketError::Closing);
        }
        let n = self.send_buf.write(data);
        self.output(now);
        Ok(n)
    }

    pub fn recv(&mut self, max: usize) -> SocketResult<Received> {
        if self.recv_buf.available() > 0 {
            let before = self.recv_buf.window();
            let data = self.recv_buf.read(max);
            let mss = self.mss as usize;
            if self.state.can_receive() && before < mss && self.recv_buf.window() >= mss {
                // Window update so a sender stuck on a closed window resumes.
                self.send_ack();
            }
            return Ok(Received::Data(data));
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.fin_received || self.state == TcpState::Closed {
            return Ok(Received::Eof);
        }
        Ok(Received::Empty)
    }

    /// Graceful close: a FIN follows whatever data is still queued
    pub fn close(&mut self, now: Millis) -> SocketResult<()> {
        self.user_closed = true;
        if self.released || self.state == TcpState::Closed {
            return Ok(());
        }
        if self.apply(FsmInput::Close, now) {
            Ok(())
        } else {
            Err(SocketError::Closing)
        }
    }

    /// Discard buffers and reset the peer
    pub fn abort(&mut self, now: Millis) {
        self.user_closed = true;
        if !self.released {
            self.apply(FsmInput::Abort, now);
        }
    }

    /// The peer or the path to it is unreachable. Only connections still
    /// opening give up; established ones keep retrying.
    pub fn on_unreachable(&mut self) {
        if self.released || !matches!(self.state, TcpState::SynSent | TcpState::SynReceived) {
            return;
        }
        warn!(conn = %self.key, state = %self.state, "destination unreachable while opening");
        self.state = TcpState::Closed;
        self.error = Some(SocketError::Unreachable);
        self.events.push_back(TcpEvent::Unreachable);
        self.release();
    }
}

/// The RST answering `header` when no connection exists for it, or `None`
/// if `header` is itself a reset
pub fn reset_for(header: &TcpHeader, payload_len: usize) -> Option<TcpHeader> {
    if header.flags.rst() {
        return None;
    }
    let mut reply = TcpHeader {
        src_port: header.dst_port,
        dst_port: header.src_port,
        seq_number: 0,
        ack_number: 0,
        flags: TcpFlags::RST,
        window_size: 0,
        urgent_ptr: 0,
        mss: None,
    };
    if header.flags.ack() {
        reply.seq_number = header.ack_number;
    } else {
        reply.flags |= TcpFlags::ACK;
        reply.ack_number = header
            .seq_number
            .wrapping_add(header.segment_len(payload_len));
    }
    Some(reply)
}
