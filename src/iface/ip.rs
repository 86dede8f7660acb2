//! Family-independent IP handling: transport dispatch, ICMP error replies,
//! and the timers shared by both families.

use std::net::{IpAddr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace, warn};

use crate::config::Millis;
use crate::error::SocketResult;
use crate::iface::interface::Interface;
use crate::network::icmp::{self, IcmpHeader};
use crate::network::icmpv6::{self, Icmpv6Header};
use crate::network::ipv6::{skip_extension_headers, IPV6_HEADER_LEN};
use crate::network::protocol;
use crate::transport::tcp::{ConnKey, Disposition, TcpHeader};
use crate::transport::udp::{UdpDatagram, UdpHeader};

/// Which ICMP error to send about an offending datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum IcmpError {
    PortUnreachable,
    ProtocolUnreachable,
    ReassemblyTimeExceeded,
}

impl Interface {
    pub(super) fn process_udp(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        payload: &[u8],
        datagram: &[u8],
        unicast: bool,
        now: Millis,
    ) {
        let (header, data) = match UdpHeader::decode(payload, src, dst) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.record_decode_error("udp", &err);
                return;
            }
        };

        match self.udp.get_mut(&header.dst_port) {
            Some(socket) => {
                let delivered = socket.enqueue(UdpDatagram {
                    remote: SocketAddr::new(src, header.src_port),
                    payload: data.to_vec(),
                });
                if delivered {
                    self.stats.udp_delivered += 1;
                } else {
                    trace!(port = header.dst_port, "udp queue full, dropping datagram");
                    self.stats.udp_queue_full += 1;
                }
            }
            None => {
                trace!(port = header.dst_port, %src, "no udp socket bound");
                self.stats.udp_no_port += 1;
                if unicast {
                    self.send_icmp_error(src, IcmpError::PortUnreachable, datagram, now);
                }
            }
        }
    }

    pub(super) fn process_tcp(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        payload: &[u8],
        unicast: bool,
        now: Millis,
    ) {
        let (header, data) = match TcpHeader::decode(payload, src, dst) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.record_decode_error("tcp", &err);
                return;
            }
        };
        if !unicast {
            trace!(%dst, "tcp segment to a group address");
            self.stats.not_for_us += 1;
            return;
        }
        self.stats.tcp_segments_in += 1;

        let local = SocketAddr::new(dst, header.dst_port);
        let remote = SocketAddr::new(src, header.src_port);
        let mss = self.local_mss(dst);
        match self.tcp.on_segment(local, remote, &header, data, mss, now) {
            Disposition::Refused => self.stats.tcp_refused += 1,
            Disposition::Dropped => self.stats.tcp_backlog_drops += 1,
            Disposition::Delivered | Disposition::Spawned => {}
        }
    }

    /// Wrap every segment the TCP store produced and send it
    pub(super) fn flush_tcp(&mut self, now: Millis) {
        let segments: Vec<_> = self.tcp.take_outbound().collect();
        for (key, segment) in segments {
            if segment.retransmission {
                self.stats.tcp_retransmissions += 1;
            }
            if segment.header.flags.rst() {
                self.stats.tcp_resets_sent += 1;
            }
            let bytes = segment
                .header
                .encode(key.local.ip(), key.remote.ip(), &segment.payload);
            self.stats.tcp_segments_out += 1;
            if let Err(err) = self.send_ip(key.remote.ip(), protocol::TCP, &bytes, now) {
                debug!(conn = %key, %err, "cannot send segment");
            }
        }
    }

    pub(super) fn send_udp(
        &mut self,
        port: u16,
        remote: SocketAddr,
        data: &[u8],
        now: Millis,
    ) -> SocketResult<()> {
        let local = self.source_for(remote.ip())?;
        let header = UdpHeader {
            src_port: port,
            dst_port: remote.port(),
        };
        let bytes = header.encode(local, remote.ip(), data);
        self.send_ip(remote.ip(), protocol::UDP, &bytes, now)
    }

    pub(super) fn send_ip(
        &mut self,
        dst: IpAddr,
        protocol: u8,
        payload: &[u8],
        now: Millis,
    ) -> SocketResult<()> {
        match dst {
            IpAddr::V4(dst) => self.send_ipv4(dst, protocol, payload, now),
            IpAddr::V6(dst) => self.send_ipv6(dst, protocol, payload, now),
        }
    }

    /// Report an offending datagram back to its source
    pub(super) fn send_icmp_error(
        &mut self,
        to: IpAddr,
        kind: IcmpError,
        datagram: &[u8],
        now: Millis,
    ) {
        let result = match to {
            IpAddr::V4(dst) => {
                let (msg_type, code) = match kind {
                    IcmpError::PortUnreachable => {
                        (icmp::ICMP_TYPE_DEST_UNREACHABLE, icmp::ICMP_CODE_PORT_UNREACHABLE)
                    }
                    IcmpError::ProtocolUnreachable => (
                        icmp::ICMP_TYPE_DEST_UNREACHABLE,
                        icmp::ICMP_CODE_PROTOCOL_UNREACHABLE,
                    ),
                    IcmpError::ReassemblyTimeExceeded => (
                        icmp::ICMP_TYPE_TIME_EXCEEDED,
                        icmp::ICMP_CODE_REASSEMBLY_TIME_EXCEEDED,
                    ),
                };
                let message = IcmpHeader::error(msg_type, code).encode(icmp::error_quote(datagram));
                self.send_ipv4(dst, protocol::ICMP, &message, now)
            }
            IpAddr::V6(dst) => {
                let (msg_type, code) = match kind {
                    IcmpError::PortUnreachable => (
                        icmpv6::ICMPV6_TYPE_DEST_UNREACHABLE,
                        icmpv6::ICMPV6_CODE_PORT_UNREACHABLE,
                    ),
                    // ICMPv6 reports an unknown next header as a parameter
                    // problem; this stack stays silent instead.
                    IcmpError::ProtocolUnreachable => return,
                    IcmpError::ReassemblyTimeExceeded => (
                        icmpv6::ICMPV6_TYPE_TIME_EXCEEDED,
                        icmpv6::ICMPV6_CODE_REASSEMBLY_TIME_EXCEEDED,
                    ),
                };
                let Some(src) = self.config.ipv6_addr else {
                    return;
                };
                let message = Icmpv6Header::new(msg_type, code).encode(
                    src,
                    dst,
                    icmpv6::error_quote(datagram),
                );
                self.send_ipv6(dst, protocol::ICMPV6, &message, now)
            }
        };
        match result {
            Ok(()) => {
                trace!(%to, ?kind, "icmp error sent");
                self.stats.icmp_errors_sent += 1;
            }
            Err(err) => debug!(%to, ?kind, %err, "cannot send icmp error"),
        }
    }

    /// An ICMP destination unreachable quoting one of our TCP segments
    pub(super) fn process_unreachable(&mut self, quoted: Option<ConnKey>) {
        self.stats.icmp_errors_in += 1;
        if let Some(key) = quoted {
            debug!(conn = %key, "destination unreachable for connection");
            self.tcp.on_unreachable_key(key);
        }
    }

    /// Retry or give up on pending neighbor resolutions
    pub(super) fn poll_resolution(&mut self, now: Millis) {
        let arp = self.arp.poll(now);
        for addr in arp.retry {
            self.send_arp_request(addr);
        }
        let nd = self.nd.poll(now);
        for addr in nd.retry {
            self.send_neighbor_solicit(addr);
        }

        let failed: Vec<(IpAddr, usize)> = arp
            .failed
            .into_iter()
            .map(|(addr, dropped)| (IpAddr::V4(addr), dropped))
            .chain(
                nd.failed
                    .into_iter()
                    .map(|(addr, dropped)| (IpAddr::V6(addr), dropped)),
            )
            .collect();
        for (addr, dropped) in failed {
            self.stats.resolution_failures += 1;
            self.stats.resolution_drops += dropped as u64;
            let via_gateway = self.is_gateway(addr);
            let config = &self.config;
            let prefix4 = (config.ipv4_addr, config.ipv4_prefix_len);
            let prefix6 = (config.ipv6_addr, config.ipv6_prefix_len);
            warn!(%addr, via_gateway, "neighbor unreachable");
            self.tcp.on_unreachable(|remote| {
                remote == addr
                    || (via_gateway
                        && remote.is_ipv4() == addr.is_ipv4()
                        && !on_link_with(remote, prefix4, prefix6))
            });
        }
    }

    /// Drop expired fragment sets, telling the source when we had its first
    /// fragment
    pub(super) fn poll_reassembly(&mut self, now: Millis) {
        for set in self.reassembly.poll(now) {
            self.stats.reassembly_timeouts += 1;
            debug!(src = %set.key.src, id = set.key.id, "reassembly timed out");
            if let Some(first) = set.first_fragment {
                self.send_icmp_error(
                    set.key.src,
                    IcmpError::ReassemblyTimeExceeded,
                    &first,
                    now,
                );
            }
        }
    }

    fn is_gateway(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(addr) => self.config.ipv4_gateway == Some(addr),
            IpAddr::V6(addr) => self.config.ipv6_gateway == Some(addr),
        }
    }
}

type Prefix<A> = (Option<A>, u8);

/// Whether `addr` shares the configured prefix of its family
pub(super) fn on_link_with(
    addr: IpAddr,
    prefix4: Prefix<std::net::Ipv4Addr>,
    prefix6: Prefix<std::net::Ipv6Addr>,
) -> bool {
    match addr {
        IpAddr::V4(addr) => prefix4.0.map_or(false, |ours| {
            let mask = u32::MAX.checked_shl(32 - prefix4.1 as u32).unwrap_or(0);
            u32::from(addr) & mask == u32::from(ours) & mask
        }),
        IpAddr::V6(addr) => {
            if addr.segments()[0] & 0xffc0 == 0xfe80 {
                return true;
            }
            prefix6.0.map_or(false, |ours| {
                let mask = u128::MAX.checked_shl(128 - prefix6.1 as u32).unwrap_or(0);
                u128::from(addr) & mask == u128::from(ours) & mask
            })
        }
    }
}

/// Connection identity of the TCP segment quoted in an ICMP error, as seen
/// from our side. `quote` starts at the quoted IP header.
pub(super) fn quoted_tcp_key(quote: &[u8]) -> Option<ConnKey> {
    let version = quote.first()? >> 4;
    let (src, dst, next_header, transport) = match version {
        4 => {
            let header_len = ((quote[0] & 0x0F) as usize) * 4;
            if header_len < 20 || quote.len() < header_len + 4 {
                return None;
            }
            let src: [u8; 4] = quote[12..16].try_into().ok()?;
            let dst: [u8; 4] = quote[16..20].try_into().ok()?;
            (
                IpAddr::from(src),
                IpAddr::from(dst),
                quote[9],
                &quote[header_len..],
            )
        }
        6 => {
            if quote.len() < IPV6_HEADER_LEN {
                return None;
            }
            let src: [u8; 16] = quote[8..24].try_into().ok()?;
            let dst: [u8; 16] = quote[24..40].try_into().ok()?;
            let (next_header, rest) =
                skip_extension_headers(quote[6], &quote[IPV6_HEADER_LEN..]).ok()?;
            (IpAddr::from(src), IpAddr::from(dst), next_header, rest)
        }
        _ => return None,
    };
    if next_header != protocol::TCP || transport.len() < 4 {
        return None;
    }
    Some(ConnKey {
        local: SocketAddr::new(src, BigEndian::read_u16(&transport[0..2])),
        remote: SocketAddr::new(dst, BigEndian::read_u16(&transport[2..4])),
    })
}
