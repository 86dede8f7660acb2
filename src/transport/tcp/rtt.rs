//! Retransmission timeout estimation (RFC 6298)

use crate::config::Millis;

/// Clock granularity term G of RFC 6298 section 2
const CLOCK_GRANULARITY_MS: Millis = 1;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Millis>,
    rttvar: Millis,
    rto: Millis,
    min_rto: Millis,
    max_rto: Millis,
    /// Consecutive expirations since the last new acknowledgement
    backoff: u32,
}

impl RttEstimator {
    pub fn new(initial_rto: Millis, min_rto: Millis, max_rto: Millis) -> Self {
        RttEstimator {
            srtt: None,
            rttvar: 0,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
            backoff: 0,
        }
    }

    /// Feed one round-trip measurement, taken from a segment sent only once
    pub fn sample(&mut self, rtt: Millis) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let err = srtt.abs_diff(rtt);
                self.rttvar = (3 * self.rttvar + err) / 4;
                self.srtt = Some((7 * srtt + rtt) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        let rto = srtt + (4 * self.rttvar).max(CLOCK_GRANULARITY_MS);
        self.rto = rto.clamp(self.min_rto, self.max_rto);
    }

    /// Timeout to arm for the next transmission, including backoff
    pub fn rto(&self) -> Millis {
        self.rto
            .checked_shl(self.backoff)
            .unwrap_or(self.max_rto)
            .min(self.max_rto)
    }

    /// Double the timeout after an expiration; returns the consecutive count
    pub fn back_off(&mut self) -> u32 {
        self.backoff = self.backoff.saturating_add(1).min(31);
        self.backoff
    }

    pub fn reset_backoff(&mut self) {
        self.backoff = 0;
    }

    pub fn backoff(&self) -> u32 {
        self.backoff
    }

    pub fn srtt(&self) -> Option<Millis> {
        self.srtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_srtt_and_variance() {
        let mut rtt = RttEstimator::new(1000, 200, 60_000);
        assert_eq!(rtt.rto(), 1000);
        rtt.sample(100);
        assert_eq!(rtt.srtt(), Some(100));
        // 100 + 4 * 50
        assert_eq!(rtt.rto(), 300);
    }

    #[test]
    fn test_smoothing_and_min_clamp() {
        let mut rtt = RttEstimator::new(1000, 200, 60_000);
        for _ in 0..50 {
            rtt.sample(10);
        }
        assert_eq!(rtt.srtt(), Some(10));
        assert_eq!(rtt.rto(), 200);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut rtt = RttEstimator::new(1000, 1000, 8000);
        let mut seen = vec![rtt.rto()];
        for _ in 0..5 {
            rtt.back_off();
            seen.push(rtt.rto());
        }
        assert_eq!(seen, vec![1000, 2000, 4000, 8000, 8000, 8000]);
        rtt.reset_backoff();
        assert_eq!(rtt.rto(), 1000);
    }
}
