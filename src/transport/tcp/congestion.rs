//! Reno congestion control (RFC 5681, fast recovery per RFC 6582 without the
//! NewReno partial-ACK rule)

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionMode {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

/// Duplicate ACKs that trigger fast retransmit
pub const DUP_ACK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct Congestion {
    cwnd: u32,
    ssthresh: u32,
    mss: u32,
    mode: CongestionMode,
    /// Bytes acknowledged since cwnd last grew in congestion avoidance
    acked_in_round: u32,
}

impl Congestion {
    pub fn new(mss: u32, initial_segments: u32) -> Self {
        Congestion {
            cwnd: mss.saturating_mul(initial_segments),
            ssthresh: u32::MAX,
            mss,
            mode: CongestionMode::SlowStart,
            acked_in_round: 0,
        }
    }

    /// Adjust for the MSS negotiated during the handshake
    pub fn set_mss(&mut self, mss: u32, initial_segments: u32) {
        self.mss = mss;
        self.cwnd = mss.saturating_mul(initial_segments);
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn mode(&self) -> CongestionMode {
        self.mode
    }

    /// New data acknowledged
    pub fn on_ack(&mut self, acked: u32) {
        match self.mode {
            CongestionMode::FastRecovery => {
                // Deflate the window and leave recovery.
                self.cwnd = self.ssthresh;
                self.mode = CongestionMode::CongestionAvoidance;
                self.acked_in_round = 0;
            }
            CongestionMode::SlowStart => {
                self.cwnd = self.cwnd.saturating_add(acked.min(self.mss));
                if self.cwnd >= self.ssthresh {
                    self.mode = CongestionMode::CongestionAvoidance;
                    self.acked_in_round = 0;
                }
            }
            CongestionMode::CongestionAvoidance => {
                self.acked_in_round = self.acked_in_round.saturating_add(acked);
                if self.acked_in_round >= self.cwnd {
                    self.acked_in_round -= self.cwnd;
                    self.cwnd = self.cwnd.saturating_add(self.mss);
                }
            }
        }
        trace!(cwnd = self.cwnd, mode = ?self.mode, "congestion window after ack");
    }

    /// A duplicate ACK arrived; `count` is the running total for this UNA.
    ///
    /// Returns true when the caller should fast-retransmit the first
    /// unacknowledged segment.
    pub fn on_dup_ack(&mut self, count: u32, flight: u32) -> bool {
        if self.mode == CongestionMode::FastRecovery {
            // Each further duplicate means a segment has left the network.
            self.cwnd = self.cwnd.saturating_add(self.mss);
            return false;
        }
        if count != DUP_ACK_THRESHOLD {
            return false;
        }
        self.ssthresh = self.reduced_threshold(flight);
        self.cwnd = self.ssthresh + DUP_ACK_THRESHOLD * self.mss;
        self.mode = CongestionMode::FastRecovery;
        true
    }

    /// The retransmission timer expired
    pub fn on_timeout(&mut self, flight: u32) {
        self.ssthresh = self.reduced_threshold(flight);
        self.cwnd = self.mss;
        self.mode = CongestionMode::SlowStart;
        self.acked_in_round = 0;
    }

    fn reduced_threshold(&self, flight: u32) -> u32 {
        (flight / 2).max(2 * self.mss)
    }
}
