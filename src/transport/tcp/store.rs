//! TCP control block store
//!
//! Owns every TCB and listener. Connections are addressed by a stable
//! [`SocketId`] handed to the application and looked up from arriving
//! segments through their 4-tuple.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};

use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, trace};

use super::fsm::TcpState;
use super::header::TcpHeader;
use super::seq::SeqNum;
use super::tcb::{reset_for, ConnKey, Received, Tcb, TcpEvent, TcpSegment};
use crate::config::{Millis, TcpConfig};
use crate::error::{SocketError, SocketResult};

/// Handle for a TCP connection or listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

#[derive(Debug)]
struct Listener {
    port: u16,
    backlog: usize,
    /// Children still in the handshake
    pending: HashSet<SocketId>,
    /// Established children waiting for accept
    ready: VecDeque<SocketId>,
}

/// What became of an arriving segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    /// A SYN spawned a connection from a listener
    Spawned,
    /// No connection or listener; a RST was queued unless the segment was one
    Refused,
    /// Listener backlog or connection table full
    Dropped,
}

#[derive(Debug)]
pub struct TcpStore {
    config: TcpConfig,
    conns: BTreeMap<SocketId, Tcb>,
    by_key: HashMap<ConnKey, SocketId>,
    listeners: BTreeMap<SocketId, Listener>,
    listen_ports: HashMap<u16, SocketId>,
    /// Unaccepted child -> listener
    parent: HashMap<SocketId, SocketId>,
    next_id: u32,
    ephemeral: (u16, u16),
    rng: StdRng,
    outbound: VecDeque<(ConnKey, TcpSegment)>,
    events: VecDeque<(SocketId, TcpEvent)>,
}

impl TcpStore {
    pub fn new(config: &TcpConfig, ephemeral: (u16, u16), rng: StdRng) -> Self {
        TcpStore {
            config: config.clone(),
            conns: BTreeMap::new(),
            by_key: HashMap::new(),
            listeners: BTreeMap::new(),
            listen_ports: HashMap::new(),
            parent: HashMap::new(),
            next_id: 1,
            ephemeral,
            rng,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    fn allocate_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn isn(&mut self) -> SeqNum {
        SeqNum(self.rng.gen())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn state(&self, id: SocketId) -> Option<TcpState> {
        self.conns.get(&id).map(Tcb::state)
    }

    pub fn key(&self, id: SocketId) -> Option<ConnKey> {
        self.conns.get(&id).map(Tcb::key)
    }

    pub fn tcb(&self, id: SocketId) -> Option<&Tcb> {
        self.conns.get(&id)
    }

    /// Pick a local port not used towards `remote` by any connection
    pub fn allocate_port(&mut self, local_ip: IpAddr, remote: SocketAddr) -> SocketResult<u16> {
        let (low, high) = self.ephemeral;
        let span = (high - low) as u32 + 1;
        let start = self.rng.gen_range(0..span);
        for i in 0..span {
            let port = low + ((start + i) % span) as u16;
            let key = ConnKey {
                local: SocketAddr::new(local_ip, port),
                remote,
            };
            if !self.listen_ports.contains_key(&port) && !self.by_key.contains_key(&key) {
                return Ok(port);
            }
        }
        Err(SocketError::PortsExhausted)
    }

    /// Active open
    pub fn connect(&mut self, key: ConnKey, local_mss: u16, now: Millis) -> SocketResult<SocketId> {
        if self.by_key.contains_key(&key) {
            return Err(SocketError::AddressInUse);
        }
        if self.conns.len() >= self.config.max_connections {
            return Err(SocketError::TableFull);
        }
        let id = self.allocate_id();
        let iss = self.isn();
        let tcb = Tcb::connect(key, iss, &self.config, local_mss, now);
        debug!(conn = %key, ?id, "active open");
        self.conns.insert(id, tcb);
        self.by_key.insert(key, id);
        self.collect(id);
        Ok(id)
    }

    /// Passive open on `port` for every local address
    pub fn listen(&mut self, port: u16, backlog: Option<usize>) -> SocketResult<SocketId> {
        if port == 0 || self.listen_ports.contains_key(&port) {
            return Err(SocketError::AddressInUse);
        }
        let id = self.allocate_id();
        self.listeners.insert(
            id,
            Listener {
                port,
                backlog: backlog.unwrap_or(self.config.default_backlog).max(1),
                pending: HashSet::new(),
                ready: VecDeque::new(),
            },
        );
        self.listen_ports.insert(port, id);
        debug!(port, ?id, "listening");
        Ok(id)
    }

    pub fn is_listener(&self, id: SocketId) -> bool {
        self.listeners.contains_key(&id)
    }

    /// Take the next established connection, if any
    pub fn accept(&mut self, listener: SocketId) -> SocketResult<Option<SocketId>> {
        let entry = self
            .listeners
            .get_mut(&listener)
            .ok_or(SocketError::UnknownSocket)?;
        let child = entry.ready.pop_front();
        if let Some(child) = child {
            self.parent.remove(&child);
        }
        Ok(child)
    }

    pub fn has_ready(&self, listener: SocketId) -> bool {
        self.listeners
            .get(&listener)
            .map_or(false, |l| !l.ready.is_empty())
    }

    pub fn close_listener(&mut self, listener: SocketId, now: Millis) -> SocketResult<()> {
        let entry = self
            .listeners
            .remove(&listener)
            .ok_or(SocketError::UnknownSocket)?;
        self.listen_ports.remove(&entry.port);
        for child in entry.pending.into_iter().chain(entry.ready) {
            if let Some(tcb) = self.conns.get_mut(&child) {
                tcb.abort(now);
            }
            self.collect(child);
        }
        debug!(port = entry.port, "listener closed");
        Ok(())
    }

    /// Route one arriving segment
    pub fn on_segment(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        header: &TcpHeader,
        payload: &[u8],
        local_mss: u16,
        now: Millis,
    ) -> Disposition {
        let key = ConnKey { local, remote };
        if let Some(&id) = self.by_key.get(&key) {
            if let Some(tcb) = self.conns.get_mut(&id) {
                tcb.on_segment(header, payload, now);
            }
            self.collect(id);
            return Disposition::Delivered;
        }

        let flags = header.flags;
        let listener_id = self.listen_ports.get(&local.port()).copied();
        match listener_id {
            Some(listener_id) if flags.syn() && !flags.ack() && !flags.rst() => {
                self.spawn(listener_id, key, header, local_mss, now)
            }
            _ => {
                if let Some(rst) = reset_for(header, payload.len()) {
                    trace!(conn = %key, flags = %flags, "no connection, answering with RST");
                    self.outbound.push_back((
                        key,
                        TcpSegment {
                            header: rst,
                            payload: Vec::new(),
                            retransmission: false,
                        },
                    ));
                }
                Disposition::Refused
            }
        }
    }

    fn spawn(
        &mut self,
        listener_id: SocketId,
        key: ConnKey,
        syn: &TcpHeader,
        local_mss: u16,
        now: Millis,
    ) -> Disposition {
        let full = self
            .listeners
            .get(&listener_id)
            .map_or(true, |l| l.pending.len() + l.ready.len() >= l.backlog);
        if full || self.conns.len() >= self.config.max_connections {
            debug!(conn = %key, "backlog full, dropping SYN");
            return Disposition::Dropped;
        }
        let id = self.allocate_id();
        let iss = self.isn();
        let tcb = Tcb::accept_syn(key, iss, &self.config, local_mss, syn, now);
        debug!(conn = %key, ?id, "passive open");
        self.conns.insert(id, tcb);
        self.by_key.insert(key, id);
        self.parent.insert(id, listener_id);
        if let Some(listener) = self.listeners.get_mut(&listener_id) {
            listener.pending.insert(id);
        }
        self.collect(id);
        Disposition::Spawned
    }

    /// Move a TCB's queued segments and events out, and retire it when done
    fn collect(&mut self, id: SocketId) {
        let Some(tcb) = self.conns.get_mut(&id) else {
            return;
        };
        let key = tcb.key();
        self.outbound
            .extend(tcb.take_outbound().map(|segment| (key, segment)));
        let events: Vec<TcpEvent> = tcb.take_events().collect();
        let released = tcb.is_released();
        let user_closed = tcb.user_closed();

        let parent = self.parent.get(&id).copied();
        for event in events {
            match parent {
                Some(listener_id) => {
                    // Not yet accepted: the application only learns about it
                    // through accept.
                    if event == TcpEvent::Established {
                        if let Some(listener) = self.listeners.get_mut(&listener_id) {
                            listener.pending.remove(&id);
                            listener.ready.push_back(id);
                        }
                    }
                }
                None => self.events.push_back((id, event)),
            }
        }

        if released {
            self.by_key.remove(&key);
            if user_closed || parent.is_some() {
                self.conns.remove(&id);
                if let Some(listener_id) = self.parent.remove(&id) {
                    if let Some(listener) = self.listeners.get_mut(&listener_id) {
                        listener.pending.remove(&id);
                        listener.ready.retain(|&child| child != id);
                    }
                }
                trace!(conn = %key, ?id, "connection removed");
            }
        }
    }

    /// Fire due timers on every connection
    pub fn poll(&mut self, now: Millis) {
        let due: Vec<SocketId> = self
            .conns
            .iter()
            .filter(|(_, tcb)| tcb.next_deadline().map_or(false, |at| at <= now))
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            if let Some(tcb) = self.conns.get_mut(&id) {
                tcb.poll(now);
            }
            self.collect(id);
        }
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.conns.values().filter_map(Tcb::next_deadline).min()
    }

    fn conn_mut(&mut self, id: SocketId) -> SocketResult<&mut Tcb> {
        self.conns.get_mut(&id).ok_or(SocketError::UnknownSocket)
    }

    pub fn send(&mut self, id: SocketId, data: &[u8], now: Millis) -> SocketResult<usize> {
        let result = self.conn_mut(id)?.send(data, now);
        self.collect(id);
        result
    }

    pub fn send_capacity(&self, id: SocketId) -> SocketResult<usize> {
        self.conns
            .get(&id)
            .map(Tcb::send_capacity)
            .ok_or(SocketError::UnknownSocket)
    }

    pub fn recv(&mut self, id: SocketId, max: usize) -> SocketResult<Received> {
        let result = self.conn_mut(id)?.recv(max);
        self.collect(id);
        result
    }

    pub fn close(&mut self, id: SocketId, now: Millis) -> SocketResult<()> {
        if self.listeners.contains_key(&id) {
            return self.close_listener(id, now);
        }
        let result = self.conn_mut(id)?.close(now);
        self.collect(id);
        result
    }

    pub fn abort(&mut self, id: SocketId, now: Millis) -> SocketResult<()> {
        self.conn_mut(id)?.abort(now);
        self.collect(id);
        Ok(())
    }

    /// Fail every connection still opening towards a remote address for
    /// which `unreachable` holds
    pub fn on_unreachable<F>(&mut self, unreachable: F)
    where
        F: Fn(IpAddr) -> bool,
    {
        let ids: Vec<SocketId> = self
            .conns
            .iter()
            .filter(|(_, tcb)| unreachable(tcb.key().remote.ip()))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            if let Some(tcb) = self.conns.get_mut(&id) {
                tcb.on_unreachable();
            }
            self.collect(id);
        }
    }

    /// An ICMP error quoted a segment of this connection
    pub fn on_unreachable_key(&mut self, key: ConnKey) {
        if let Some(&id) = self.by_key.get(&key) {
            if let Some(tcb) = self.conns.get_mut(&id) {
                tcb.on_unreachable();
            }
            self.collect(id);
        }
    }

    pub fn take_outbound(&mut self) -> std::collections::vec_deque::Drain<'_, (ConnKey, TcpSegment)> {
        self.outbound.drain(..)
    }

    pub fn take_events(&mut self) -> std::collections::vec_deque::Drain<'_, (SocketId, TcpEvent)> {
        self.events.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::transport::tcp::header::TcpFlags;

    fn store() -> TcpStore {
        TcpStore::new(&TcpConfig::default(), (50000, 50003), StdRng::seed_from_u64(7))
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// Feed every queued segment of `from` into `to`, swapping addresses
    fn exchange(from: &mut TcpStore, to: &mut TcpStore, now: Millis) -> usize {
        let segments: Vec<_> = from.take_outbound().collect();
        for (key, segment) in &segments {
            to.on_segment(key.remote, key.local, &segment.header, &segment.payload, 1460, now);
        }
        segments.len()
    }

    #[test]
    fn test_listen_accept_and_exchange() {
        let mut server = store();
        let mut client = store();
        let listener = server.listen(80, Some(2)).unwrap();
        assert_eq!(server.listen(80, None), Err(SocketError::AddressInUse));

        let local_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let remote = addr("10.0.0.2:80");
        let port = client.allocate_port(local_ip, remote).unwrap();
        let key = ConnKey {
            local: SocketAddr::new(local_ip, port),
            remote,
        };
        let conn = client.connect(key, 1460, 0).unwrap();
        assert_eq!(client.connect(key, 1460, 0), Err(SocketError::AddressInUse));

        exchange(&mut client, &mut server, 0);
        assert_eq!(server.accept(listener), Ok(None));
        exchange(&mut server, &mut client, 0);
        exchange(&mut client, &mut server, 0);

        let child = server.accept(listener).unwrap().unwrap();
        assert_eq!(server.state(child), Some(TcpState::Established));
        assert_eq!(
            client.take_events().collect::<Vec<_>>(),
            vec![(conn, TcpEvent::Established)]
        );
        // Events from before accept are not replayed.
        assert!(server.take_events().next().is_none());

        client.send(conn, b"ping", 1).unwrap();
        exchange(&mut client, &mut server, 1);
        assert_eq!(server.recv(child, 64), Ok(Received::Data(b"ping".to_vec())));
    }

    #[test]
    fn test_segment_without_listener_is_refused_with_rst() {
        let mut server = store();
        let syn = TcpHeader {
            src_port: 3000,
            dst_port: 81,
            seq_number: 41,
            ack_number: 0,
            flags: TcpFlags::SYN,
            window_size: 512,
            urgent_ptr: 0,
            mss: None,
        };
        let disposition =
            server.on_segment(addr("10.0.0.2:81"), addr("10.0.0.1:3000"), &syn, &[], 1460, 0);
        assert_eq!(disposition, Disposition::Refused);
        let (key, rst) = server.take_outbound().next().unwrap();
        assert_eq!(key.remote, addr("10.0.0.1:3000"));
        assert_eq!(rst.header.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(rst.header.ack_number, 42);
    }

    #[test]
    fn test_backlog_limits_pending_handshakes() {
        let mut server = store();
        server.listen(80, Some(1)).unwrap();
        let mut syn = TcpHeader {
            src_port: 3000,
            dst_port: 80,
            seq_number: 1,
            ack_number: 0,
            flags: TcpFlags::SYN,
            window_size: 512,
            urgent_ptr: 0,
            mss: None,
        };
        let local = addr("10.0.0.2:80");
        assert_eq!(
            server.on_segment(local, addr("10.0.0.1:3000"), &syn, &[], 1460, 0),
            Disposition::Spawned
        );
        syn.src_port = 3001;
        assert_eq!(
            server.on_segment(local, addr("10.0.0.1:3001"), &syn, &[], 1460, 0),
            Disposition::Dropped
        );
    }

    #[test]
    fn test_ephemeral_ports_exhaust() {
        let mut client = store();
        let local_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let remote = addr("10.0.0.2:80");
        for _ in 0..4 {
            let port = client.allocate_port(local_ip, remote).unwrap();
            let key = ConnKey {
                local: SocketAddr::new(local_ip, port),
                remote,
            };
            client.connect(key, 1460, 0).unwrap();
        }
        assert_eq!(
            client.allocate_port(local_ip, remote),
            Err(SocketError::PortsExhausted)
        );
    }

    #[test]
    fn test_unreachable_fails_opening_connections() {
        let mut client = store();
        let key = ConnKey {
            local: addr("10.0.0.1:50000"),
            remote: addr("10.0.0.9:80"),
        };
        let conn = client.connect(key, 1460, 0).unwrap();
        let failed: IpAddr = "10.0.0.9".parse().unwrap();
        client.on_unreachable(|remote| remote == failed);
        assert_eq!(
            client.take_events().collect::<Vec<_>>(),
            vec![(conn, TcpEvent::Unreachable)]
        );
        assert_eq!(client.recv(conn, 10), Err(SocketError::Unreachable));
        client.close(conn, 1).unwrap();
        assert!(client.is_empty());
        assert_eq!(client.next_deadline(), None);
    }
}
