//! TCP connection state machine
//!
//! The control transitions of RFC 793 figure 6 as a pure function. The TCB
//! decides which input a segment or user call amounts to (sequence checks,
//! acknowledgement of our SYN or FIN) and then carries out the returned
//! actions; data transfer never changes state and is handled by the TCB alone.

use std::fmt;

/// TCP connection states as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which both sides' initial sequence numbers are known
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }

    /// Whether the application may still queue data for sending
    pub fn can_send(self) -> bool {
        matches!(
            self,
            TcpState::SynSent
                | TcpState::SynReceived
                | TcpState::Established
                | TcpState::CloseWait
        )
    }

    /// Whether in-sequence data from the peer is still accepted
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            TcpState::SynReceived
                | TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events that may move a connection between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmInput {
    ActiveOpen,
    PassiveOpen,
    Close,
    Abort,
    RecvSyn,
    RecvSynAck,
    RecvAckOfSyn,
    RecvFin,
    RecvAckOfFin,
    RecvRst,
    TimeWaitExpired,
    /// Retransmission or keepalive retries exhausted
    Timeout,
}

/// Side effects the TCB performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmAction {
    SendSyn,
    SendSynAck,
    SendAck,
    SendFin,
    SendRst,
    StartTimeWait,
    NotifyEstablished,
    NotifyPeerClosed,
    NotifyReset,
    NotifyTimeout,
    NotifyClosed,
    /// Drop buffers and cancel every timer; the TCB may be removed
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: TcpState,
    pub actions: &'static [FsmAction],
}

const fn to(next: TcpState, actions: &'static [FsmAction]) -> Option<Transition> {
    Some(Transition { next, actions })
}

/// Compute the control transition for `input` in `state`.
///
/// `None` means the input is not meaningful in that state; the caller drops
/// the segment or rejects the user call.
pub fn transition(state: TcpState, input: FsmInput) -> Option<Transition> {
    use FsmAction::*;
    use FsmInput::*;
    use TcpState::*;

    match (state, input) {
        (Closed, ActiveOpen) => to(SynSent, &[SendSyn]),
        (Closed, PassiveOpen) => to(Listen, &[]),

        (Listen, RecvSyn) => to(SynReceived, &[SendSynAck]),
        (Listen, Close) | (Listen, Abort) => to(Closed, &[Release]),

        (SynSent, RecvSynAck) => to(Established, &[SendAck, NotifyEstablished]),
        (SynSent, RecvSyn) => to(SynReceived, &[SendSynAck]),
        (SynSent, Close) | (SynSent, Abort) => to(Closed, &[NotifyClosed, Release]),

        (SynReceived, RecvAckOfSyn) => to(Established, &[NotifyEstablished]),
        (SynReceived, Close) => to(FinWait1, &[SendFin]),

        (Established, Close) => to(FinWait1, &[SendFin]),
        (Established, RecvFin) => to(CloseWait, &[SendAck, NotifyPeerClosed]),

        (FinWait1, RecvAckOfFin) => to(FinWait2, &[]),
        (FinWait1, RecvFin) => to(Closing, &[SendAck, NotifyPeerClosed]),
        (FinWait2, RecvFin) => to(TimeWait, &[SendAck, StartTimeWait, NotifyPeerClosed]),

        (CloseWait, Close) => to(LastAck, &[SendFin]),
        (Closing, RecvAckOfFin) => to(TimeWait, &[StartTimeWait]),
        (LastAck, RecvAckOfFin) => to(Closed, &[NotifyClosed, Release]),

        // A retransmitted FIN restarts the 2*MSL wait.
        (TimeWait, RecvFin) => to(TimeWait, &[SendAck, StartTimeWait]),
        (TimeWait, TimeWaitExpired) => to(Closed, &[NotifyClosed, Release]),

        (Listen, RecvRst) | (Closed, _) => None,
        (_, RecvRst) => to(Closed, &[NotifyReset, Release]),

        (SynSent, Timeout) => to(Closed, &[NotifyTimeout, Release]),
        (_, Timeout) => to(Closed, &[SendRst, NotifyTimeout, Release]),

        (TimeWait, Abort) => to(Closed, &[Release]),
        (_, Abort) => to(Closed, &[SendRst, NotifyClosed, Release]),

        _ => None,
    }
}
