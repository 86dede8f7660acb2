//! Interface counters
//!
//! Plain counters bumped by the interface as frames move through it. Reading
//! and reporting them is left to the caller.

use tracing::trace;

use crate::error::DecodeError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Frames or packets that failed to decode, checksum failures excluded
    pub malformed: u64,
    pub checksum_errors: u64,
    /// Addressed to another host
    pub not_for_us: u64,
    /// EtherType or IP protocol this stack does not handle
    pub unsupported: u64,
    /// No address configured for the family, or no route
    pub no_route: u64,

    pub arp_requests_sent: u64,
    pub arp_replies_sent: u64,
    pub arp_conflicts: u64,
    pub nd_solicits_sent: u64,
    pub nd_adverts_sent: u64,
    /// Neighbors that never answered
    pub resolution_failures: u64,
    /// Packets discarded while waiting for resolution
    pub resolution_drops: u64,

    pub fragments_in: u64,
    pub fragments_out: u64,
    pub reassembled: u64,
    pub fragments_dropped: u64,
    pub reassembly_timeouts: u64,

    pub icmp_echo_replies: u64,
    pub icmp_errors_in: u64,
    pub icmp_errors_sent: u64,

    pub udp_delivered: u64,
    pub udp_no_port: u64,
    pub udp_queue_full: u64,
    pub udp_sent: u64,

    pub tcp_segments_in: u64,
    pub tcp_segments_out: u64,
    pub tcp_retransmissions: u64,
    pub tcp_resets_sent: u64,
    /// Segments for no connection or listener
    pub tcp_refused: u64,
    /// SYNs dropped on a full backlog or connection table
    pub tcp_backlog_drops: u64,
}

impl Stats {
    /// Count a decode failure at `layer`
    pub fn record_decode_error(&mut self, layer: &'static str, err: &DecodeError) {
        trace!(layer, %err, "dropping undecodable packet");
        match err {
            DecodeError::Checksum => self.checksum_errors += 1,
            DecodeError::Unsupported(_) => self.unsupported += 1,
            _ => self.malformed += 1,
        }
    }
}
