use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, trace, warn};

use crate::config::Millis;
use crate::error::{SocketError, SocketResult};
use crate::iface::fragment::{FragmentKey, Reassembly};
use crate::iface::interface::Interface;
use crate::iface::ip::{quoted_tcp_key, IcmpError};
use crate::iface::neighbor::Resolution;
use crate::link::{ethertype, ArpOperation, ArpPacket, MacAddr};
use crate::network::icmp::{IcmpHeader, ICMP_TYPE_DEST_UNREACHABLE, ICMP_TYPE_ECHO_REPLY};
use crate::network::ipv4::{protocol, Ipv4Header};

impl Interface {
    pub(super) fn process_arp(&mut self, data: &[u8], now: Millis) {
        let packet = match ArpPacket::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.stats.record_decode_error("arp", &err);
                return;
            }
        };
        let Some(our_ip) = self.config.ipv4_addr else {
            return;
        };

        if packet.sender_ip == our_ip && packet.sender_mac != self.config.mac {
            warn!(
                ip = %our_ip,
                other = %packet.sender_mac,
                "another host claims our address"
            );
            self.stats.arp_conflicts += 1;
            return;
        }

        let accept_gratuitous =
            self.config.arp.accept_gratuitous && self.arp.contains(packet.sender_ip);
        match packet.operation {
            ArpOperation::Request if packet.target_ip == our_ip => {
                if self.config.arp.learn_from_requests && !packet.sender_ip.is_unspecified() {
                    self.learn_ipv4(packet.sender_ip, packet.sender_mac, now);
                }
                let reply = ArpPacket::reply_to(&packet, self.config.mac);
                trace!(to = %packet.sender_ip, "answering arp request");
                self.send_frame(packet.sender_mac, ethertype::ARP, &reply.encode());
                self.stats.arp_replies_sent += 1;
            }
            ArpOperation::Request if packet.is_gratuitous() && accept_gratuitous => {
                self.learn_ipv4(packet.sender_ip, packet.sender_mac, now);
            }
            ArpOperation::Reply if packet.target_ip == our_ip => {
                self.learn_ipv4(packet.sender_ip, packet.sender_mac, now);
            }
            ArpOperation::Reply if packet.is_gratuitous() && accept_gratuitous => {
                self.learn_ipv4(packet.sender_ip, packet.sender_mac, now);
            }
            _ => trace!(target = %packet.target_ip, "arp packet not for us"),
        }
    }

    fn learn_ipv4(&mut self, addr: Ipv4Addr, mac: MacAddr, now: Millis) {
        for packet in self.arp.handle_reply(addr, mac, now) {
            self.send_frame(mac, ethertype::IPV4, &packet);
        }
    }

    pub(super) fn send_arp_request(&mut self, target: Ipv4Addr) {
        let Some(our_ip) = self.config.ipv4_addr else {
            return;
        };
        let request = ArpPacket::request(self.config.mac, our_ip, target);
        self.send_frame(MacAddr::BROADCAST, ethertype::ARP, &request.encode());
        self.stats.arp_requests_sent += 1;
    }

    pub(super) fn process_ipv4_packet(&mut self, data: &[u8], now: Millis) {
        let (header, payload) = match Ipv4Header::decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.record_decode_error("ipv4", &err);
                return;
            }
        };
        let Some(unicast) = self.ipv4_destination(header.dst_addr) else {
            self.stats.not_for_us += 1;
            return;
        };
        let datagram = &data[..header.header_len() + payload.len()];

        if !header.is_fragment() {
            self.deliver_ipv4(&header, payload, datagram, unicast, now);
            return;
        }

        self.stats.fragments_in += 1;
        let key = FragmentKey {
            src: IpAddr::V4(header.src_addr),
            dst: IpAddr::V4(header.dst_addr),
            id: header.id as u32,
            protocol: header.protocol,
        };
        let offset = header.frag_offset as usize;
        match self.reassembly.add_fragment(
            key,
            offset,
            payload,
            header.more_fragments,
            datagram,
            now,
        ) {
            Reassembly::Complete(payload) => {
                self.stats.reassembled += 1;
                let mut whole = header.clone();
                whole.more_fragments = false;
                whole.frag_offset = 0;
                let datagram = whole.encode(&payload);
                self.deliver_ipv4(&whole, &payload, &datagram, unicast, now);
            }
            Reassembly::Incomplete => {}
            Reassembly::Discarded(reason) => {
                debug!(src = %header.src_addr, id = header.id, ?reason, "fragment dropped");
                self.stats.fragments_dropped += 1;
            }
        }
    }

    /// `Some(true)` for our unicast address, `Some(false)` for a broadcast we
    /// accept, `None` for anything else
    fn ipv4_destination(&self, dst: Ipv4Addr) -> Option<bool> {
        let ours = self.config.ipv4_addr?;
        if dst == ours {
            Some(true)
        } else if dst.is_broadcast() || Some(dst) == self.ipv4_subnet_broadcast() {
            Some(false)
        } else {
            None
        }
    }

    fn ipv4_subnet_broadcast(&self) -> Option<Ipv4Addr> {
        let ours = u32::from(self.config.ipv4_addr?);
        let host_bits = u32::MAX
            .checked_shr(self.config.ipv4_prefix_len as u32)
            .unwrap_or(0);
        (host_bits != 0).then(|| Ipv4Addr::from(ours | host_bits))
    }

    fn deliver_ipv4(
        &mut self,
        header: &Ipv4Header,
        payload: &[u8],
        datagram: &[u8],
        unicast: bool,
        now: Millis,
    ) {
        let src = IpAddr::V4(header.src_addr);
        let dst = IpAddr::V4(header.dst_addr);
        match header.protocol {
            protocol::ICMP => self.process_icmpv4(header, payload, unicast, now),
            protocol::TCP => self.process_tcp(src, dst, payload, unicast, now),
            protocol::UDP => self.process_udp(src, dst, payload, datagram, unicast, now),
            other => {
                trace!(protocol = other, "unsupported ip protocol");
                self.stats.unsupported += 1;
                if unicast {
                    self.send_icmp_error(src, IcmpError::ProtocolUnreachable, datagram, now);
                }
            }
        }
    }

    fn process_icmpv4(&mut self, ip_header: &Ipv4Header, payload: &[u8], unicast: bool, now: Millis) {
        let (header, body) = match IcmpHeader::decode(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.record_decode_error("icmp", &err);
                return;
            }
        };

        if header.is_echo_request() {
            if !unicast {
                trace!("ignoring broadcast echo request");
                return;
            }
            let reply = IcmpHeader {
                msg_type: ICMP_TYPE_ECHO_REPLY,
                ..header
            };
            let message = reply.encode(body);
            match self.send_ipv4(ip_header.src_addr, protocol::ICMP, &message, now) {
                Ok(()) => self.stats.icmp_echo_replies += 1,
                Err(err) => debug!(%err, "cannot send echo reply"),
            }
        } else if header.msg_type == ICMP_TYPE_DEST_UNREACHABLE {
            self.process_unreachable(quoted_tcp_key(body));
        } else if header.is_error() {
            self.stats.icmp_errors_in += 1;
        } else {
            trace!(msg_type = header.msg_type, "unhandled icmp message");
        }
    }

    /// Send an upper-layer payload, fragmenting it to fit the MTU
    pub(super) fn send_ipv4(
        &mut self,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
        now: Millis,
    ) -> SocketResult<()> {
        let src = self.config.ipv4_addr.ok_or(SocketError::AddressFamily)?;
        let next_hop = self.ipv4_next_hop(dst)?;

        let id = self.next_ip_id;
        self.next_ip_id = self.next_ip_id.wrapping_add(1);
        let header = Ipv4Header::new(protocol, src, dst, id);
        let packets = header.fragment(payload, self.config.mtu);
        if packets.len() > 1 {
            trace!(%dst, id, count = packets.len(), "fragmenting datagram");
            self.stats.fragments_out += packets.len() as u64;
        }

        for packet in packets {
            match next_hop {
                None => self.send_frame(MacAddr::BROADCAST, ethertype::IPV4, &packet),
                Some(hop) => self.resolve_and_send_ipv4(hop, packet, now),
            }
        }
        Ok(())
    }

    /// Neighbor to hand a packet for `dst` to; `None` means link broadcast
    fn ipv4_next_hop(&mut self, dst: Ipv4Addr) -> SocketResult<Option<Ipv4Addr>> {
        if dst.is_broadcast() || Some(dst) == self.ipv4_subnet_broadcast() {
            return Ok(None);
        }
        let on_link = super::ip::on_link_with(
            IpAddr::V4(dst),
            (self.config.ipv4_addr, self.config.ipv4_prefix_len),
            (None, 0),
        );
        if on_link {
            return Ok(Some(dst));
        }
        match self.config.ipv4_gateway {
            Some(gateway) => Ok(Some(gateway)),
            None => {
                debug!(%dst, "no route");
                self.stats.no_route += 1;
                Err(SocketError::Unreachable)
            }
        }
    }

    fn resolve_and_send_ipv4(&mut self, hop: Ipv4Addr, packet: Vec<u8>, now: Millis) {
        match self.arp.resolve(hop, packet, now) {
            Resolution::Resolved { mac, packet } => {
                self.send_frame(mac, ethertype::IPV4, &packet)
            }
            Resolution::Queued { request_needed } => {
                if request_needed {
                    self.send_arp_request(hop);
                }
            }
            Resolution::Dropped => self.stats.resolution_drops += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::config::StackConfig;
    use crate::link::EthernetHeader;
    use crate::transport::udp::UdpHeader;

    const PEER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 1);

    fn iface() -> Interface {
        Interface::new(StackConfig {
            rng_seed: Some(1),
            ..StackConfig::default()
        })
        .unwrap()
    }

    fn frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        EthernetHeader {
            dst: MacAddr([0x02, 0x00, 0x00, 0x77, 0x77, 0x77]),
            src: PEER_MAC,
            ethertype,
        }
        .encode(payload)
    }

    fn ipv4_frame(protocol: u8, payload: &[u8]) -> Vec<u8> {
        let header = Ipv4Header::new(protocol, PEER_IP, Ipv4Addr::new(192, 168, 9, 7), 77);
        frame(ethertype::IPV4, &header.encode(payload))
    }

    fn sent(iface: &mut Interface) -> Vec<(EthernetHeader, Vec<u8>)> {
        iface
            .drain_frames()
            .map(|frame| {
                let (eth, payload) = EthernetHeader::decode(&frame).unwrap();
                (eth, payload.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_arp_request_is_answered_and_learned() {
        let mut iface = iface();
        let request = ArpPacket::request(PEER_MAC, PEER_IP, Ipv4Addr::new(192, 168, 9, 7));
        iface.receive_frame(&frame(ethertype::ARP, &request.encode()), 0);

        let out = sent(&mut iface);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.dst, PEER_MAC);
        let reply = ArpPacket::decode(&out[0].1).unwrap();
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.sender_mac, iface.mac());
        assert_eq!(reply.target_ip, PEER_IP);
        assert_eq!(iface.arp_lookup(PEER_IP, 1), Some(PEER_MAC));
    }

    #[test]
    fn test_address_conflict_is_counted() {
        let mut iface = iface();
        let claim = ArpPacket::request(
            PEER_MAC,
            Ipv4Addr::new(192, 168, 9, 7),
            Ipv4Addr::new(192, 168, 9, 7),
        );
        iface.receive_frame(&frame(ethertype::ARP, &claim.encode()), 0);
        assert_eq!(iface.stats().arp_conflicts, 1);
        assert!(sent(&mut iface).is_empty());
    }

    #[test]
    fn test_echo_request_is_answered() {
        let mut iface = iface();
        iface.learn_ipv4(PEER_IP, PEER_MAC, 0);
        let ping = IcmpHeader::echo_request(0x42, 1).encode(b"abc");
        iface.receive_frame(&ipv4_frame(protocol::ICMP, &ping), 0);

        let out = sent(&mut iface);
        assert_eq!(out.len(), 1);
        let (ip, payload) = Ipv4Header::decode(&out[0].1).unwrap();
        assert_eq!(ip.dst_addr, PEER_IP);
        let (icmp, body) = IcmpHeader::decode(payload).unwrap();
        assert!(icmp.is_echo_reply());
        assert_eq!((icmp.identifier(), icmp.sequence()), (0x42, 1));
        assert_eq!(body, b"abc");
    }

    #[test]
    fn test_closed_udp_port_gets_port_unreachable() {
        let mut iface = iface();
        iface.learn_ipv4(PEER_IP, PEER_MAC, 0);
        let src = IpAddr::V4(PEER_IP);
        let dst = IpAddr::V4(Ipv4Addr::new(192, 168, 9, 7));
        let udp = UdpHeader {
            src_port: 4000,
            dst_port: 9,
        }
        .encode(src, dst, b"x");
        iface.receive_frame(&ipv4_frame(protocol::UDP, &udp), 0);

        let out = sent(&mut iface);
        assert_eq!(out.len(), 1);
        let (_, payload) = Ipv4Header::decode(&out[0].1).unwrap();
        let (icmp, quote) = IcmpHeader::decode(payload).unwrap();
        assert_eq!(icmp.msg_type, ICMP_TYPE_DEST_UNREACHABLE);
        assert_eq!(icmp.msg_code, 3);
        assert_eq!(quote.len(), 28);
        assert_eq!(iface.stats().udp_no_port, 1);
    }

    #[test]
    fn test_unresolved_send_queues_behind_arp_request() {
        let mut iface = iface();
        iface.udp_bind(5000).unwrap();
        iface
            .udp_send_to(5000, "192.168.9.20:53".parse().unwrap(), b"q", 0)
            .unwrap();
        let out = sent(&mut iface);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.dst, MacAddr::BROADCAST);
        assert_eq!(out[0].0.ethertype, ethertype::ARP);

        // Off-link destinations resolve the gateway instead.
        iface
            .udp_send_to(5000, "8.8.8.8:53".parse().unwrap(), b"q", 0)
            .unwrap();
        let out = sent(&mut iface);
        let request = ArpPacket::decode(&out[0].1).unwrap();
        assert_eq!(request.target_ip, PEER_IP);
    }

    #[test]
    fn test_large_datagram_is_fragmented() {
        let mut iface = iface();
        iface.learn_ipv4(PEER_IP, PEER_MAC, 0);
        iface.udp_bind(5000).unwrap();
        let data = vec![7u8; 3000];
        iface
            .udp_send_to(5000, SocketAddr::from((PEER_IP, 9)), &data, 0)
            .unwrap();
        let out = sent(&mut iface);
        assert_eq!(out.len(), 3);
        for (eth, packet) in &out {
            assert_eq!(eth.dst, PEER_MAC);
            assert!(packet.len() <= 1500);
        }
        assert_eq!(iface.stats().fragments_out, 3);
    }
}
