//! Two interfaces wired back to back, driven on a simulated clock

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use toy_network::config::StackConfig;
use toy_network::transport::UdpDatagram;
use toy_network::{
    Interface, MacAddr, Millis, Received, SocketError, SocketId, TcpEvent, TcpState,
};

const A_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
const B_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);
const A_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 7);
const B_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 8);
const A_IP6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 7);
const B_IP6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

struct Pair {
    a: Interface,
    b: Interface,
    now: Millis,
}

impl Pair {
    fn new() -> Self {
        Self::build(false)
    }

    /// Both interfaces also carry an address on fd00::/64
    fn dual_stack() -> Self {
        Self::build(true)
    }

    fn build(ipv6: bool) -> Self {
        let a = StackConfig {
            mac: A_MAC,
            ipv4_addr: Some(A_IP),
            ipv6_addr: ipv6.then_some(A_IP6),
            rng_seed: Some(1),
            ..StackConfig::default()
        };
        let b = StackConfig {
            mac: B_MAC,
            ipv4_addr: Some(B_IP),
            ipv6_addr: ipv6.then_some(B_IP6),
            rng_seed: Some(2),
            ..StackConfig::default()
        };
        Pair {
            a: Interface::new(a).unwrap(),
            b: Interface::new(b).unwrap(),
            now: 0,
        }
    }

    fn exchange(&mut self) {
        self.exchange_with(|_, _| true);
    }

    /// Move frames both ways until the link is quiet; `keep` decides which
    /// frames survive the wire
    fn exchange_with(&mut self, mut keep: impl FnMut(Side, &[u8]) -> bool) {
        for _ in 0..10_000 {
            let mut moved = false;
            while let Some(frame) = self.a.transmit() {
                moved = true;
                if keep(Side::A, &frame) {
                    self.b.receive_frame(&frame, self.now);
                }
            }
            while let Some(frame) = self.b.transmit() {
                moved = true;
                if keep(Side::B, &frame) {
                    self.a.receive_frame(&frame, self.now);
                }
            }
            if !moved {
                return;
            }
        }
        panic!("link never went quiet");
    }

    fn advance(&mut self, ms: Millis) {
        self.now += ms;
        self.a.poll(self.now);
        self.b.poll(self.now);
        self.exchange();
    }

    /// Open a connection from A to B:`port`, returning both ends
    fn connect(&mut self, remote: IpAddr, port: u16) -> (SocketId, SocketId) {
        let listener = self.b.tcp_listen(port, None).unwrap();
        let client = self
            .a
            .tcp_connect(SocketAddr::new(remote, port), self.now)
            .unwrap();
        self.exchange();
        let server = self.b.tcp_accept(listener).unwrap().expect("accepted");
        assert_eq!(self.a.tcp_state(client), Some(TcpState::Established));
        assert_eq!(self.b.tcp_state(server), Some(TcpState::Established));
        (client, server)
    }
}

fn events(iface: &mut Interface) -> Vec<(SocketId, TcpEvent)> {
    iface.take_events().collect()
}

fn drain(iface: &mut Interface, id: SocketId, now: Millis) -> Vec<u8> {
    let mut data = Vec::new();
    while let Received::Data(chunk) = iface.tcp_recv(id, 65_536, now).unwrap() {
        data.extend(chunk);
    }
    data
}

#[test]
fn test_handshake_and_transfer() {
    let mut pair = Pair::new();
    let (client, server) = pair.connect(IpAddr::V4(B_IP), 80);

    assert_eq!(pair.a.arp_lookup(B_IP, pair.now), Some(B_MAC));
    assert_eq!(pair.b.arp_lookup(A_IP, pair.now), Some(A_MAC));
    assert_eq!(pair.b.stats().arp_replies_sent, 1);
    assert_eq!(pair.a.tcp_local_addr(client), pair.b.tcp_peer_addr(server));
    assert_eq!(pair.a.tcp_peer_addr(client), pair.b.tcp_local_addr(server));
    assert_eq!(events(&mut pair.a), vec![(client, TcpEvent::Established)]);

    assert_eq!(pair.a.tcp_send(client, b"hello", pair.now), Ok(5));
    pair.exchange();
    assert_eq!(events(&mut pair.b), vec![(server, TcpEvent::DataAvailable)]);
    assert_eq!(drain(&mut pair.b, server, pair.now), b"hello");

    assert_eq!(pair.b.tcp_send(server, b"world", pair.now), Ok(5));
    pair.exchange();
    assert_eq!(drain(&mut pair.a, client, pair.now), b"world");
}

#[test]
fn test_graceful_close_ends_in_time_wait() {
    let mut pair = Pair::new();
    let (client, server) = pair.connect(IpAddr::V4(B_IP), 80);
    events(&mut pair.a);

    pair.a.tcp_close(client, pair.now).unwrap();
    pair.exchange();
    pair.advance(200);
    assert!(events(&mut pair.b).contains(&(server, TcpEvent::PeerClosed)));
    assert_eq!(pair.b.tcp_recv(server, 100, pair.now), Ok(Received::Eof));

    pair.b.tcp_close(server, pair.now).unwrap();
    pair.exchange();
    pair.advance(200);
    assert_eq!(pair.b.tcp_state(server), None);
    assert_eq!(pair.a.tcp_state(client), Some(TcpState::TimeWait));

    let msl = pair.a.config().tcp.msl;
    pair.advance(2 * msl + 1);
    assert_eq!(pair.a.tcp_state(client), None);
}

#[test]
fn test_syn_to_closed_port_is_reset() {
    let mut pair = Pair::new();
    let client = pair
        .a
        .tcp_connect(SocketAddr::new(IpAddr::V4(B_IP), 81), pair.now)
        .unwrap();
    pair.exchange();

    assert!(events(&mut pair.a).contains(&(client, TcpEvent::Reset)));
    assert_eq!(pair.a.tcp_error(client), Some(SocketError::Reset));
    assert_eq!(pair.b.stats().tcp_refused, 1);
    assert_eq!(pair.b.stats().tcp_resets_sent, 1);
}

#[test]
fn test_unresolvable_neighbor_fails_connect() {
    let mut pair = Pair::new();
    let ghost = Ipv4Addr::new(192, 168, 9, 99);
    let client = pair
        .a
        .tcp_connect(SocketAddr::new(IpAddr::V4(ghost), 80), pair.now)
        .unwrap();
    pair.exchange();
    assert_eq!(pair.a.stats().arp_requests_sent, 1);

    for _ in 0..3 {
        pair.advance(1_000);
    }
    assert!(events(&mut pair.a).contains(&(client, TcpEvent::Unreachable)));
    assert_eq!(pair.a.tcp_error(client), Some(SocketError::Unreachable));
    assert_eq!(pair.a.stats().resolution_failures, 1);
    assert_eq!(pair.a.arp_lookup(ghost, pair.now), None);
}

#[test]
fn test_udp_to_closed_port_returns_icmp() {
    let mut pair = Pair::new();
    pair.a.udp_bind(5000).unwrap();
    let remote = SocketAddr::new(IpAddr::V4(B_IP), 9999);
    assert_eq!(pair.a.udp_send_to(5000, remote, b"ping", pair.now), Ok(4));
    pair.exchange();

    assert_eq!(pair.b.stats().udp_no_port, 1);
    assert_eq!(pair.b.stats().icmp_errors_sent, 1);
    assert_eq!(pair.a.stats().icmp_errors_in, 1);
}

#[test]
fn test_fragmented_udp_datagram_is_reassembled() {
    let mut pair = Pair::new();
    pair.a.udp_bind(5000).unwrap();
    pair.b.udp_bind(7).unwrap();
    let payload: Vec<u8> = (0..4000u32).map(|i| (i % 253) as u8).collect();
    let remote = SocketAddr::new(IpAddr::V4(B_IP), 7);

    pair.a.udp_send_to(5000, remote, &payload, pair.now).unwrap();
    pair.exchange();

    assert_eq!(pair.a.stats().fragments_out, 3);
    assert_eq!(pair.b.stats().reassembled, 1);
    assert_eq!(
        pair.b.udp_recv_from(7),
        Ok(Some(UdpDatagram {
            remote: SocketAddr::new(IpAddr::V4(A_IP), 5000),
            payload,
        }))
    );
}

#[test]
fn test_ipv6_transfer_over_neighbor_discovery() {
    let mut pair = Pair::dual_stack();
    let (client, server) = pair.connect(IpAddr::V6(B_IP6), 80);

    assert_eq!(pair.a.nd_lookup(B_IP6, pair.now), Some(B_MAC));
    assert_eq!(pair.b.nd_lookup(A_IP6, pair.now), Some(A_MAC));
    assert_eq!(
        pair.a.tcp_local_addr(client).map(|addr| addr.ip()),
        Some(IpAddr::V6(A_IP6))
    );

    let message = vec![0x5a; 3000];
    assert_eq!(pair.a.tcp_send(client, &message, pair.now), Ok(3000));
    pair.exchange();
    pair.advance(200);
    assert_eq!(drain(&mut pair.b, server, pair.now), message);
}

#[test]
fn test_bulk_transfer() {
    let mut pair = Pair::new();
    let (client, server) = pair.connect(IpAddr::V4(B_IP), 80);
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let mut sent = 0;
    let mut received = Vec::new();
    for _ in 0..5_000 {
        if sent < data.len() {
            sent += pair.a.tcp_send(client, &data[sent..], pair.now).unwrap();
        }
        pair.exchange();
        received.extend(drain(&mut pair.b, server, pair.now));
        if received.len() == data.len() {
            break;
        }
        pair.advance(50);
    }
    assert_eq!(received.len(), data.len());
    assert!(received == data);
}

#[test]
fn test_lost_segment_is_retransmitted() {
    let mut pair = Pair::new();
    let (client, server) = pair.connect(IpAddr::V4(B_IP), 80);

    let message = vec![7u8; 1000];
    pair.a.tcp_send(client, &message, pair.now).unwrap();
    let mut dropped = false;
    pair.exchange_with(|side, frame| {
        if side == Side::A && frame.len() > 1000 && !dropped {
            dropped = true;
            return false;
        }
        true
    });
    assert!(dropped);
    assert!(drain(&mut pair.b, server, pair.now).is_empty());

    let deadline = pair.a.next_deadline().expect("retransmission timer");
    pair.advance(deadline - pair.now);
    assert_eq!(pair.a.stats().tcp_retransmissions, 1);
    assert_eq!(drain(&mut pair.b, server, pair.now), message);
}

#[test]
fn test_silent_peer_times_out() {
    let mut pair = Pair::new();
    let (client, _server) = pair.connect(IpAddr::V4(B_IP), 80);
    events(&mut pair.a);

    pair.a.tcp_send(client, b"anyone there?", pair.now).unwrap();
    let mut timed_out = false;
    for _ in 0..500 {
        pair.a.drain_frames().for_each(drop);
        let Some(deadline) = pair.a.next_deadline() else {
            break;
        };
        pair.now = pair.now.max(deadline);
        pair.a.poll(pair.now);
        if events(&mut pair.a).contains(&(client, TcpEvent::TimedOut)) {
            timed_out = true;
            break;
        }
    }
    assert!(timed_out);
    assert_eq!(pair.a.tcp_error(client), Some(SocketError::TimedOut));
    let retransmits = pair.a.config().tcp.max_retransmits as u64;
    assert!(pair.a.stats().tcp_retransmissions >= retransmits);
}
