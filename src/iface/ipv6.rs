use std::net::{IpAddr, Ipv6Addr};

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::Millis;
use crate::error::{SocketError, SocketResult};
use crate::iface::fragment::{FragmentKey, Reassembly};
use crate::iface::interface::Interface;
use crate::iface::ip::{on_link_with, quoted_tcp_key};
use crate::iface::neighbor::Resolution;
use crate::link::{ethertype, MacAddr};
use crate::network::icmpv6::{
    Icmpv6Header, NdMessage, ICMPV6_TYPE_DEST_UNREACHABLE, ICMPV6_TYPE_ECHO_REPLY,
    ICMPV6_TYPE_ECHO_REQUEST, ICMPV6_TYPE_NEIGHBOR_ADVERT, ICMPV6_TYPE_NEIGHBOR_SOLICIT,
    ND_HOP_LIMIT,
};
use crate::network::ipv6::{
    skip_extension_headers, solicited_node, Ipv6FragmentHeader, Ipv6Header, IPV6_HEADER_LEN,
};
use crate::network::protocol;

const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

impl Interface {
    pub(super) fn process_ipv6_packet(&mut self, data: &[u8], now: Millis) {
        let (header, payload) = match Ipv6Header::decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.record_decode_error("ipv6", &err);
                return;
            }
        };
        let Some(unicast) = self.ipv6_destination(header.dst_addr) else {
            self.stats.not_for_us += 1;
            return;
        };
        let datagram = &data[..IPV6_HEADER_LEN + payload.len()];
        let (next_header, rest) = match skip_extension_headers(header.next_header, payload) {
            Ok(found) => found,
            Err(err) => {
                self.stats.record_decode_error("ipv6 extension", &err);
                return;
            }
        };

        if next_header != protocol::IPV6_FRAGMENT {
            self.deliver_ipv6(&header, next_header, rest, datagram, unicast, now);
            return;
        }

        let (fragment, chunk) = match Ipv6FragmentHeader::decode(rest) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.record_decode_error("ipv6 fragment", &err);
                return;
            }
        };
        if fragment.offset == 0 && !fragment.more_fragments {
            // Atomic fragment (RFC 6946): nothing to reassemble.
            self.deliver_unfragmentable(&header, fragment.next_header, chunk, datagram, unicast, now);
            return;
        }

        self.stats.fragments_in += 1;
        let key = FragmentKey {
            src: IpAddr::V6(header.src_addr),
            dst: IpAddr::V6(header.dst_addr),
            id: fragment.id,
            protocol: fragment.next_header,
        };
        match self.reassembly.add_fragment(
            key,
            fragment.offset as usize,
            chunk,
            fragment.more_fragments,
            datagram,
            now,
        ) {
            Reassembly::Complete(payload) => {
                self.stats.reassembled += 1;
                let whole = Ipv6Header {
                    next_header: fragment.next_header,
                    ..header.clone()
                };
                let datagram = whole.encode(&payload);
                self.deliver_unfragmentable(
                    &whole,
                    fragment.next_header,
                    &payload,
                    &datagram,
                    unicast,
                    now,
                );
            }
            Reassembly::Incomplete => {}
            Reassembly::Discarded(reason) => {
                debug!(src = %header.src_addr, id = fragment.id, ?reason, "fragment dropped");
                self.stats.fragments_dropped += 1;
            }
        }
    }

    /// `Some(true)` for our unicast address, `Some(false)` for a group we
    /// listen on, `None` for anything else
    fn ipv6_destination(&self, dst: Ipv6Addr) -> Option<bool> {
        let ours = self.config.ipv6_addr?;
        if dst == ours {
            Some(true)
        } else if dst == ALL_NODES || dst == solicited_node(ours) {
            Some(false)
        } else {
            None
        }
    }

    /// Deliver what follows a Fragment header, which may still start with
    /// Destination Options
    fn deliver_unfragmentable(
        &mut self,
        header: &Ipv6Header,
        next_header: u8,
        payload: &[u8],
        datagram: &[u8],
        unicast: bool,
        now: Millis,
    ) {
        match skip_extension_headers(next_header, payload) {
            Ok((protocol::IPV6_FRAGMENT, _)) => {
                debug!(src = %header.src_addr, "nested fragment header");
                self.stats.fragments_dropped += 1;
            }
            Ok((next_header, rest)) => {
                self.deliver_ipv6(header, next_header, rest, datagram, unicast, now)
            }
            Err(err) => self.stats.record_decode_error("ipv6 extension", &err),
        }
    }

    fn deliver_ipv6(
        &mut self,
        header: &Ipv6Header,
        next_header: u8,
        payload: &[u8],
        datagram: &[u8],
        unicast: bool,
        now: Millis,
    ) {
        let src = IpAddr::V6(header.src_addr);
        let dst = IpAddr::V6(header.dst_addr);
        match next_header {
            protocol::ICMPV6 => self.process_icmpv6(header, payload, unicast, now),
            protocol::TCP => self.process_tcp(src, dst, payload, unicast, now),
            protocol::UDP => self.process_udp(src, dst, payload, datagram, unicast, now),
            other => {
                trace!(next_header = other, "unsupported next header");
                self.stats.unsupported += 1;
            }
        }
    }

    fn process_icmpv6(&mut self, ip_header: &Ipv6Header, payload: &[u8], unicast: bool, now: Millis) {
        let (header, body) =
            match Icmpv6Header::decode(payload, ip_header.src_addr, ip_header.dst_addr) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.stats.record_decode_error("icmpv6", &err);
                    return;
                }
            };

        match header.msg_type {
            ICMPV6_TYPE_NEIGHBOR_SOLICIT | ICMPV6_TYPE_NEIGHBOR_ADVERT => {
                // Only on-link senders can produce hop limit 255.
                if ip_header.hop_limit != ND_HOP_LIMIT {
                    trace!(hop_limit = ip_header.hop_limit, "nd message with bad hop limit");
                    self.stats.malformed += 1;
                    return;
                }
                match NdMessage::decode(&header, body) {
                    Ok(Some(message)) => self.process_nd(ip_header, message, now),
                    Ok(None) => {}
                    Err(err) => self.stats.record_decode_error("nd", &err),
                }
            }
            ICMPV6_TYPE_ECHO_REQUEST => {
                let Some(ours) = self.config.ipv6_addr else {
                    return;
                };
                if !unicast {
                    trace!("ignoring multicast echo request");
                    return;
                }
                let reply = Icmpv6Header {
                    msg_type: ICMPV6_TYPE_ECHO_REPLY,
                    ..header
                };
                let message = reply.encode(ours, ip_header.src_addr, body);
                match self.send_ipv6(ip_header.src_addr, protocol::ICMPV6, &message, now) {
                    Ok(()) => self.stats.icmp_echo_replies += 1,
                    Err(err) => debug!(%err, "cannot send echo reply"),
                }
            }
            ICMPV6_TYPE_DEST_UNREACHABLE => {
                // The 4 unused bytes sit in the header; the quote follows.
                self.process_unreachable(quoted_tcp_key(body));
            }
            msg_type if header.is_error() => {
                trace!(msg_type, "icmpv6 error");
                self.stats.icmp_errors_in += 1;
            }
            msg_type => trace!(msg_type, "unhandled icmpv6 message"),
        }
    }

    fn process_nd(&mut self, ip_header: &Ipv6Header, message: NdMessage, now: Millis) {
        let Some(ours) = self.config.ipv6_addr else {
            return;
        };
        match message {
            NdMessage::NeighborSolicit { target, source_mac } => {
                if target != ours {
                    return;
                }
                let from = ip_header.src_addr;
                if let Some(mac) = source_mac {
                    if self.config.neighbor.learn_from_requests && !from.is_unspecified() {
                        self.learn_ipv6(from, mac, now);
                    }
                }
                let (dst, solicited) = if from.is_unspecified() {
                    (ALL_NODES, false)
                } else {
                    (from, true)
                };
                let advert = NdMessage::NeighborAdvert {
                    router: false,
                    solicited,
                    override_entry: true,
                    target: ours,
                    target_mac: Some(self.config.mac),
                };
                trace!(to = %dst, "answering neighbor solicitation");
                match self.send_nd(dst, advert, now) {
                    Ok(()) => self.stats.nd_adverts_sent += 1,
                    Err(err) => debug!(%err, "cannot send neighbor advertisement"),
                }
            }
            NdMessage::NeighborAdvert {
                solicited,
                target,
                target_mac,
                ..
            } => {
                let Some(mac) = target_mac else {
                    return;
                };
                if target == ours {
                    if mac != self.config.mac {
                        warn!(ip = %ours, other = %mac, "another host claims our address");
                        self.stats.arp_conflicts += 1;
                    }
                    return;
                }
                let unsolicited_ok =
                    self.config.neighbor.accept_gratuitous && self.nd.contains(target);
                if solicited || unsolicited_ok {
                    self.learn_ipv6(target, mac, now);
                }
            }
        }
    }

    fn learn_ipv6(&mut self, addr: Ipv6Addr, mac: MacAddr, now: Millis) {
        for packet in self.nd.handle_reply(addr, mac, now) {
            self.send_frame(mac, ethertype::IPV6, &packet);
        }
    }

    /// Send an ND message with the mandatory hop limit
    fn send_nd(&mut self, dst: Ipv6Addr, message: NdMessage, now: Millis) -> SocketResult<()> {
        let src = self.config.ipv6_addr.ok_or(SocketError::AddressFamily)?;
        let mut header = Ipv6Header::new(protocol::ICMPV6, src, dst);
        header.hop_limit = ND_HOP_LIMIT;
        let packet = header.encode(&message.encode(src, dst));
        self.route_ipv6(dst, packet, now)
    }

    pub(super) fn send_neighbor_solicit(&mut self, target: Ipv6Addr) {
        let Some(src) = self.config.ipv6_addr else {
            return;
        };
        let dst = solicited_node(target);
        let message = NdMessage::NeighborSolicit {
            target,
            source_mac: Some(self.config.mac),
        };
        let mut header = Ipv6Header::new(protocol::ICMPV6, src, dst);
        header.hop_limit = ND_HOP_LIMIT;
        let packet = header.encode(&message.encode(src, dst));
        self.send_frame(MacAddr::ipv6_multicast(dst), ethertype::IPV6, &packet);
        self.stats.nd_solicits_sent += 1;
    }

    /// Send an upper-layer payload, fragmenting it when it exceeds the MTU
    pub(super) fn send_ipv6(
        &mut self,
        dst: Ipv6Addr,
        next_header: u8,
        payload: &[u8],
        now: Millis,
    ) -> SocketResult<()> {
        let src = self.config.ipv6_addr.ok_or(SocketError::AddressFamily)?;
        let header = Ipv6Header::new(next_header, src, dst);
        if IPV6_HEADER_LEN + payload.len() <= self.config.mtu {
            return self.route_ipv6(dst, header.encode(payload), now);
        }

        let id: u32 = self.rng.gen();
        let packets = header.fragment(payload, id, self.config.mtu);
        trace!(%dst, id, count = packets.len(), "fragmenting datagram");
        self.stats.fragments_out += packets.len() as u64;
        for packet in packets {
            self.route_ipv6(dst, packet, now)?;
        }
        Ok(())
    }

    fn route_ipv6(&mut self, dst: Ipv6Addr, packet: Vec<u8>, now: Millis) -> SocketResult<()> {
        if dst.is_multicast() {
            self.send_frame(MacAddr::ipv6_multicast(dst), ethertype::IPV6, &packet);
            return Ok(());
        }
        let on_link = on_link_with(
            IpAddr::V6(dst),
            (None, 0),
            (self.config.ipv6_addr, self.config.ipv6_prefix_len),
        );
        let hop = match (on_link, self.config.ipv6_gateway) {
            (true, _) => dst,
            (false, Some(gateway)) => gateway,
            (false, None) => {
                debug!(%dst, "no route");
                self.stats.no_route += 1;
                return Err(SocketError::Unreachable);
            }
        };

        match self.nd.resolve(hop, packet, now) {
            Resolution::Resolved { mac, packet } => {
                self.send_frame(mac, ethertype::IPV6, &packet)
            }
            Resolution::Queued { request_needed } => {
                if request_needed {
                    self.send_neighbor_solicit(hop);
                }
            }
            Resolution::Dropped => self.stats.resolution_drops += 1,
        }
        Ok(())
    }
}
