//! Network interface and packet processing
//!
//! The [`Interface`] owns every piece of protocol state for one Ethernet link:
//! - ARP and Neighbor Discovery caches
//! - IPv4 / IPv6 fragment reassembly
//! - TCP connections and listeners, bound UDP ports
//! - the queue of frames waiting to go out
//!
//! It never touches a device or a clock. Callers hand it frames with
//! [`Interface::receive_frame`], fire its timers with [`Interface::poll`] and
//! drain [`Interface::transmit`]. Protocol handling is split across the
//! sibling `ipv4`, `ipv6` and `ip` modules.

use std::collections::{vec_deque, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::config::{Millis, StackConfig};
use crate::error::{ConfigError, SocketError, SocketResult};
use crate::iface::fragment::Reassembler;
use crate::iface::neighbor::NeighborCache;
use crate::link::{ethertype, EthernetHeader, MacAddr};
use crate::network::ipv4::IPV4_HEADER_LEN;
use crate::network::ipv6::IPV6_HEADER_LEN;
use crate::stats::Stats;
use crate::transport::tcp::{ConnKey, Received, SocketId, TcpEvent, TcpState, TcpStore, TCP_HEADER_LEN};
use crate::transport::udp::{UdpDatagram, UdpSocket, UDP_HEADER_LEN};

pub struct Interface {
    pub(super) config: StackConfig,
    pub(super) arp: NeighborCache<Ipv4Addr>,
    pub(super) nd: NeighborCache<Ipv6Addr>,
    pub(super) reassembly: Reassembler,
    pub(super) tcp: TcpStore,
    pub(super) udp: HashMap<u16, UdpSocket>,
    pub(super) stats: Stats,
    pub(super) rng: StdRng,
    pub(super) next_ip_id: u16,
    pub(super) output_queue: VecDeque<Vec<u8>>,
}

impl Interface {
    /// Create an interface from a validated configuration
    pub fn new(config: StackConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let tcp_rng = StdRng::seed_from_u64(rng.gen());
        let next_ip_id = rng.gen();
        debug!(
            mac = %config.mac,
            ipv4 = ?config.ipv4_addr,
            ipv6 = ?config.ipv6_addr,
            mtu = config.mtu,
            "interface up"
        );

        Ok(Interface {
            arp: NeighborCache::new(&config.arp),
            nd: NeighborCache::new(&config.neighbor),
            reassembly: Reassembler::new(&config.fragment),
            tcp: TcpStore::new(&config.tcp, config.ephemeral_ports, tcp_rng),
            udp: HashMap::new(),
            stats: Stats::default(),
            rng,
            next_ip_id,
            output_queue: VecDeque::new(),
            config,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn mac(&self) -> MacAddr {
        self.config.mac
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Link address cached for an IPv4 neighbor
    pub fn arp_lookup(&self, addr: Ipv4Addr, now: Millis) -> Option<MacAddr> {
        self.arp.lookup(addr, now)
    }

    /// Link address cached for an IPv6 neighbor
    pub fn nd_lookup(&self, addr: Ipv6Addr, now: Millis) -> Option<MacAddr> {
        self.nd.lookup(addr, now)
    }

    /// Process one inbound Ethernet frame
    pub fn receive_frame(&mut self, frame: &[u8], now: Millis) {
        self.stats.frames_in += 1;
        let (eth, payload) = match EthernetHeader::decode(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.record_decode_error("ethernet", &err);
                return;
            }
        };
        if eth.dst != self.config.mac && !eth.dst.is_multicast() {
            self.stats.not_for_us += 1;
            return;
        }

        match eth.ethertype {
            ethertype::ARP => self.process_arp(payload, now),
            ethertype::IPV4 => self.process_ipv4_packet(payload, now),
            ethertype::IPV6 => self.process_ipv6_packet(payload, now),
            other => {
                trace!(ethertype = format_args!("{other:#06x}"), "unsupported ethertype");
                self.stats.unsupported += 1;
            }
        }
        self.flush_tcp(now);
    }

    /// Fire every timer due at `now`
    pub fn poll(&mut self, now: Millis) {
        self.tcp.poll(now);
        self.poll_resolution(now);
        self.poll_reassembly(now);
        self.flush_tcp(now);
    }

    /// Earliest time [`Interface::poll`] has work to do
    pub fn next_deadline(&self) -> Option<Millis> {
        [
            self.tcp.next_deadline(),
            self.arp.next_deadline(),
            self.nd.next_deadline(),
            self.reassembly.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Next frame to put on the wire
    pub fn transmit(&mut self) -> Option<Vec<u8>> {
        self.output_queue.pop_front()
    }

    pub fn drain_frames(&mut self) -> vec_deque::Drain<'_, Vec<u8>> {
        self.output_queue.drain(..)
    }

    /// Socket notifications in the order they happened
    pub fn take_events(&mut self) -> vec_deque::Drain<'_, (SocketId, TcpEvent)> {
        self.tcp.take_events()
    }

    pub(super) fn send_frame(&mut self, dst: MacAddr, ethertype: u16, payload: &[u8]) {
        let header = EthernetHeader {
            dst,
            src: self.config.mac,
            ethertype,
        };
        self.output_queue.push_back(header.encode(payload));
        self.stats.frames_out += 1;
    }

    /// Largest TCP payload a peer should send us over `local`'s family
    pub(super) fn local_mss(&self, local: IpAddr) -> u16 {
        let ip_header = match local {
            IpAddr::V4(_) => IPV4_HEADER_LEN,
            IpAddr::V6(_) => IPV6_HEADER_LEN,
        };
        let mss = self.config.mtu.saturating_sub(ip_header + TCP_HEADER_LEN);
        mss.min(u16::MAX as usize) as u16
    }

    /// Our address in the family of `remote`
    pub(super) fn source_for(&self, remote: IpAddr) -> SocketResult<IpAddr> {
        let local = match remote {
            IpAddr::V4(_) => self.config.ipv4_addr.map(IpAddr::V4),
            IpAddr::V6(_) => self.config.ipv6_addr.map(IpAddr::V6),
        };
        local.ok_or(SocketError::AddressFamily)
    }

    // TCP

    /// Open a connection; it completes asynchronously with an
    /// [`TcpEvent::Established`] or a failure event
    pub fn tcp_connect(&mut self, remote: SocketAddr, now: Millis) -> SocketResult<SocketId> {
        let local_ip = self.source_for(remote.ip())?;
        let port = self.tcp.allocate_port(local_ip, remote)?;
        let key = ConnKey {
            local: SocketAddr::new(local_ip, port),
            remote,
        };
        let id = self.tcp.connect(key, self.local_mss(local_ip), now)?;
        self.flush_tcp(now);
        Ok(id)
    }

    pub fn tcp_listen(&mut self, port: u16, backlog: Option<usize>) -> SocketResult<SocketId> {
        self.tcp.listen(port, backlog)
    }

    /// Take an established connection off a listener, if one is waiting
    pub fn tcp_accept(&mut self, listener: SocketId) -> SocketResult<Option<SocketId>> {
        self.tcp.accept(listener)
    }

    pub fn tcp_has_pending(&self, listener: SocketId) -> bool {
        self.tcp.has_ready(listener)
    }

    pub fn tcp_send(&mut self, id: SocketId, data: &[u8], now: Millis) -> SocketResult<usize> {
        let result = self.tcp.send(id, data, now);
        self.flush_tcp(now);
        result
    }

    pub fn tcp_send_capacity(&self, id: SocketId) -> SocketResult<usize> {
        self.tcp.send_capacity(id)
    }

    pub fn tcp_recv(&mut self, id: SocketId, max: usize, now: Millis) -> SocketResult<Received> {
        let result = self.tcp.recv(id, max);
        self.flush_tcp(now);
        result
    }

    pub fn tcp_close(&mut self, id: SocketId, now: Millis) -> SocketResult<()> {
        let result = self.tcp.close(id, now);
        self.flush_tcp(now);
        result
    }

    pub fn tcp_abort(&mut self, id: SocketId, now: Millis) -> SocketResult<()> {
        let result = self.tcp.abort(id, now);
        self.flush_tcp(now);
        result
    }

    pub fn tcp_state(&self, id: SocketId) -> Option<TcpState> {
        self.tcp.state(id)
    }

    /// Why the connection failed, if it did
    pub fn tcp_error(&self, id: SocketId) -> Option<SocketError> {
        self.tcp.tcb(id).and_then(|tcb| tcb.error().cloned())
    }

    pub fn tcp_local_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.tcp.key(id).map(|key| key.local)
    }

    pub fn tcp_peer_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.tcp.key(id).map(|key| key.remote)
    }

    // UDP

    /// Bind a UDP port; port 0 picks a free ephemeral one
    pub fn udp_bind(&mut self, port: u16) -> SocketResult<u16> {
        let port = match port {
            0 => self.free_udp_port()?,
            port if self.udp.contains_key(&port) => return Err(SocketError::AddressInUse),
            port => port,
        };
        self.udp
            .insert(port, UdpSocket::new(port, self.config.udp_queue_len));
        debug!(port, "udp port bound");
        Ok(port)
    }

    fn free_udp_port(&mut self) -> SocketResult<u16> {
        let (low, high) = self.config.ephemeral_ports;
        let span = (high - low) as u32 + 1;
        let start = self.rng.gen_range(0..span);
        (0..span)
            .map(|i| low + ((start + i) % span) as u16)
            .find(|port| !self.udp.contains_key(port))
            .ok_or(SocketError::PortsExhausted)
    }

    pub fn udp_close(&mut self, port: u16) -> SocketResult<()> {
        self.udp
            .remove(&port)
            .map(|_| debug!(port, "udp port closed"))
            .ok_or(SocketError::UnknownSocket)
    }

    pub fn udp_send_to(
        &mut self,
        port: u16,
        remote: SocketAddr,
        data: &[u8],
        now: Millis,
    ) -> SocketResult<usize> {
        if !self.udp.contains_key(&port) {
            return Err(SocketError::UnknownSocket);
        }
        let ip_header = if remote.is_ipv4() { IPV4_HEADER_LEN } else { 0 };
        if UDP_HEADER_LEN + data.len() + ip_header > u16::MAX as usize {
            return Err(SocketError::MessageTooLarge);
        }
        self.send_udp(port, remote, data, now)?;
        self.stats.udp_sent += 1;
        Ok(data.len())
    }

    pub fn udp_recv_from(&mut self, port: u16) -> SocketResult<Option<UdpDatagram>> {
        self.udp
            .get_mut(&port)
            .map(UdpSocket::recv)
            .ok_or(SocketError::UnknownSocket)
    }

    pub fn udp_has_packet(&self, port: u16) -> bool {
        self.udp.get(&port).map_or(false, UdpSocket::has_packet)
    }
}
