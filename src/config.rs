//! Stack configuration
//!
//! All values are fixed once an [`Interface`](crate::iface::Interface) has been
//! created from them. Times are milliseconds on the caller's clock.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::ConfigError;
use crate::link::MacAddr;

/// Milliseconds on the monotonic clock the caller drives the stack with.
pub type Millis = u64;

/// Settings shared by the ARP cache and the IPv6 neighbor cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborConfig {
    /// Maximum number of entries, resolved and pending together
    pub max_entries: usize,
    /// Frames held per pending entry; newer frames beyond this are dropped
    pub max_pending_frames: usize,
    /// How long a resolved entry stays usable after its last confirmation
    pub entry_ttl: Millis,
    pub retry_interval: Millis,
    /// Requests sent before a pending entry is declared unreachable
    pub max_retries: u32,
    /// Learn the sender of a request addressed to us
    pub learn_from_requests: bool,
    /// Update existing entries from gratuitous announcements
    pub accept_gratuitous: bool,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_pending_frames: 16,
            entry_ttl: 300_000,
            retry_interval: 1_000,
            max_retries: 3,
            learn_from_requests: true,
            accept_gratuitous: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentConfig {
    pub timeout: Millis,
    /// Largest datagram a single set may grow to
    pub max_datagram_size: usize,
    pub max_sets: usize,
    /// Bytes buffered across all sets
    pub max_total_bytes: usize,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            timeout: 30_000,
            max_datagram_size: 65_535,
            max_sets: 64,
            max_total_bytes: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// Initial congestion window in segments
    pub initial_cwnd_segments: u32,
    pub initial_rto: Millis,
    pub min_rto: Millis,
    pub max_rto: Millis,
    /// Retransmissions of a data or FIN segment before the connection aborts
    pub max_retransmits: u32,
    /// Retransmissions of a SYN before the open fails
    pub max_syn_retransmits: u32,
    pub delayed_ack: Millis,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this
    pub msl: Millis,
    pub send_buffer: usize,
    pub recv_buffer: usize,
    /// Upper bound for the persist timer between zero-window probes
    pub max_persist: Millis,
    /// Idle time before the first keepalive probe; `None` disables keepalive
    pub keepalive_idle: Option<Millis>,
    pub keepalive_interval: Millis,
    pub keepalive_probes: u32,
    pub default_backlog: usize,
    pub max_connections: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            initial_cwnd_segments: 3,
            initial_rto: 1_000,
            min_rto: 1_000,
            max_rto: 60_000,
            max_retransmits: 12,
            max_syn_retransmits: 6,
            delayed_ack: 200,
            msl: 30_000,
            send_buffer: 64 * 1024,
            recv_buffer: 65_535,
            max_persist: 60_000,
            keepalive_idle: None,
            keepalive_interval: 75_000,
            keepalive_probes: 9,
            default_backlog: 16,
            max_connections: 1024,
        }
    }
}

/// Addressing and behaviour of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub mac: MacAddr,
    pub mtu: usize,

    pub ipv4_addr: Option<Ipv4Addr>,
    pub ipv4_prefix_len: u8,
    pub ipv4_gateway: Option<Ipv4Addr>,

    pub ipv6_addr: Option<Ipv6Addr>,
    pub ipv6_prefix_len: u8,
    pub ipv6_gateway: Option<Ipv6Addr>,

    pub arp: NeighborConfig,
    pub neighbor: NeighborConfig,
    pub fragment: FragmentConfig,
    pub tcp: TcpConfig,

    /// Datagrams held per bound UDP port before new ones are dropped
    pub udp_queue_len: usize,
    /// Inbound frames handled per loop iteration
    pub rx_batch: usize,
    pub ephemeral_ports: (u16, u16),
    /// Seed for ISNs, identifiers and ephemeral ports; random when `None`
    pub rng_seed: Option<u64>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mac: MacAddr([0x02, 0x00, 0x00, 0x77, 0x77, 0x77]),
            mtu: 1500,
            ipv4_addr: Some(Ipv4Addr::new(192, 168, 9, 7)),
            ipv4_prefix_len: 24,
            ipv4_gateway: Some(Ipv4Addr::new(192, 168, 9, 1)),
            ipv6_addr: None,
            ipv6_prefix_len: 64,
            ipv6_gateway: None,
            arp: NeighborConfig::default(),
            neighbor: NeighborConfig::default(),
            fragment: FragmentConfig::default(),
            tcp: TcpConfig::default(),
            udp_queue_len: 64,
            rx_batch: 32,
            ephemeral_ports: (49152, 65535),
            rng_seed: None,
        }
    }
}

impl StackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipv4_addr.is_none() && self.ipv6_addr.is_none() {
            return Err(ConfigError::Invalid("no IPv4 or IPv6 address configured"));
        }
        if self.mac.is_multicast() {
            return Err(ConfigError::Invalid("interface MAC must be unicast"));
        }
        // IPv6 requires links of at least 1280 bytes; IPv4 needs room for 68.
        let min_mtu = if self.ipv6_addr.is_some() { 1280 } else { 68 };
        if self.mtu < min_mtu || self.mtu > 9000 {
            return Err(ConfigError::Invalid("mtu out of range"));
        }
        if self.ipv4_prefix_len > 32 || self.ipv6_prefix_len > 128 {
            return Err(ConfigError::Invalid("prefix length out of range"));
        }
        let (low, high) = self.ephemeral_ports;
        if low == 0 || low > high {
            return Err(ConfigError::Invalid("ephemeral port range is empty"));
        }
        if self.rx_batch == 0 {
            return Err(ConfigError::Invalid("rx_batch must be non-zero"));
        }
        for cache in [&self.arp, &self.neighbor] {
            if cache.max_entries == 0 || cache.retry_interval == 0 {
                return Err(ConfigError::Invalid("neighbor cache bounds must be non-zero"));
            }
        }
        if self.fragment.max_sets == 0 || self.fragment.max_datagram_size > 65_535 + 40 {
            return Err(ConfigError::Invalid("fragment limits invalid"));
        }

        let tcp = &self.tcp;
        if tcp.min_rto == 0 || tcp.min_rto > tcp.max_rto {
            return Err(ConfigError::Invalid("RTO bounds invalid"));
        }
        if tcp.initial_rto < tcp.min_rto || tcp.initial_rto > tcp.max_rto {
            return Err(ConfigError::Invalid("initial RTO outside RTO bounds"));
        }
        if tcp.initial_cwnd_segments == 0 {
            return Err(ConfigError::Invalid("initial cwnd must be non-zero"));
        }
        if tcp.send_buffer == 0 || tcp.recv_buffer == 0 || tcp.recv_buffer > u16::MAX as usize {
            return Err(ConfigError::Invalid("TCP buffer sizes invalid"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(StackConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rto_defaults() {
        let tcp = TcpConfig::default();
        assert_eq!(
            (tcp.initial_rto, tcp.min_rto, tcp.max_rto),
            (1_000, 1_000, 60_000)
        );
        assert_eq!((tcp.max_retransmits, tcp.max_syn_retransmits), (12, 6));
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let mut config = StackConfig::default();
        config.tcp.min_rto = 5_000;
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.ipv4_addr = None;
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.ipv6_addr = Some("fd00::7".parse().unwrap());
        config.mtu = 1000;
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.tcp.recv_buffer = 1 << 20;
        assert!(config.validate().is_err());
    }
}
