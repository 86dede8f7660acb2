//! Event and timer loop
//!
//! A [`Stack`] owns an [`Interface`] and a [`Device`] and runs them on one
//! thread. Each iteration:
//! - reads a bounded batch of frames from the device
//! - serves socket requests queued by [`StackHandle`]s
//! - fires due timers
//! - completes parked requests that can now make progress
//! - flushes outbound frames to the device
//!
//! Requests that cannot finish right away (receive on an empty buffer, send
//! on a full one, connect, accept) are parked and retried every iteration.

use std::mem;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::Millis;
use crate::error::{DeviceError, SocketError, SocketResult};
use crate::iface::{Device, Interface};
use crate::transport::tcp::{Received, SocketId, TcpEvent};
use crate::transport::udp::UdpDatagram;

/// Longest the loop sleeps waiting for requests when idle
const IDLE_WAIT: Millis = 5;

pub(crate) type Reply<T> = Sender<SocketResult<T>>;

pub(crate) enum Request {
    Connect {
        remote: SocketAddr,
        reply: Reply<SocketId>,
    },
    Listen {
        port: u16,
        backlog: Option<usize>,
        reply: Reply<SocketId>,
    },
    Accept {
        listener: SocketId,
        reply: Reply<SocketId>,
    },
    Send {
        id: SocketId,
        data: Vec<u8>,
        reply: Reply<usize>,
    },
    Recv {
        id: SocketId,
        max: usize,
        reply: Reply<Received>,
    },
    Close {
        id: SocketId,
        reply: Reply<()>,
    },
    Abort {
        id: SocketId,
        reply: Reply<()>,
    },
    PeerAddr {
        id: SocketId,
        reply: Reply<(SocketAddr, SocketAddr)>,
    },
    UdpBind {
        port: u16,
        reply: Reply<u16>,
    },
    UdpSendTo {
        port: u16,
        remote: SocketAddr,
        data: Vec<u8>,
        reply: Reply<usize>,
    },
    UdpRecvFrom {
        port: u16,
        reply: Reply<UdpDatagram>,
    },
    UdpClose {
        port: u16,
        reply: Reply<()>,
    },
    Shutdown,
}

/// A request waiting for the connection to make progress
enum Waiter {
    Connect {
        id: SocketId,
        reply: Reply<SocketId>,
    },
    Accept {
        listener: SocketId,
        reply: Reply<SocketId>,
    },
    Send {
        id: SocketId,
        data: Vec<u8>,
        reply: Reply<usize>,
    },
    Recv {
        id: SocketId,
        max: usize,
        reply: Reply<Received>,
    },
    UdpRecv {
        port: u16,
        reply: Reply<UdpDatagram>,
    },
}

/// Cloneable entry point for application threads
#[derive(Debug, Clone)]
pub struct StackHandle {
    requests: Sender<Request>,
}

impl StackHandle {
    /// Send a request and block for its answer
    pub(crate) fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> SocketResult<T> {
        let (reply, answer) = channel();
        self.requests
            .send(make(reply))
            .map_err(|_| SocketError::StackGone)?;
        answer.recv().map_err(|_| SocketError::StackGone)?
    }

    /// Send a request without waiting for the answer
    pub(crate) fn post<T>(&self, make: impl FnOnce(Reply<T>) -> Request) {
        let (reply, _) = channel();
        let _ = self.requests.send(make(reply));
    }

    /// Ask the loop to stop after the current iteration
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }
}

pub struct Stack<D> {
    iface: Interface,
    device: D,
    requests: Receiver<Request>,
    waiters: Vec<Waiter>,
    subscribers: Vec<Sender<(SocketId, TcpEvent)>>,
    started: Instant,
    stopping: bool,
}

impl<D: Device> Stack<D> {
    pub fn new(iface: Interface, device: D) -> (Self, StackHandle) {
        let (tx, rx) = channel();
        let stack = Stack {
            iface,
            device,
            requests: rx,
            waiters: Vec::new(),
            subscribers: Vec::new(),
            started: Instant::now(),
            stopping: false,
        };
        (stack, StackHandle { requests: tx })
    }

    pub fn interface(&self) -> &Interface {
        &self.iface
    }

    /// Receive every socket notification from now on
    pub fn subscribe(&mut self) -> Receiver<(SocketId, TcpEvent)> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    fn now(&self) -> Millis {
        self.started.elapsed().as_millis() as Millis
    }

    /// Run on a dedicated thread until shut down or every handle is gone
    pub fn spawn(self) -> thread::JoinHandle<Result<(), DeviceError>>
    where
        D: Send + 'static,
    {
        thread::spawn(move || self.run())
    }

    pub fn run(mut self) -> Result<(), DeviceError> {
        info!(mac = %self.iface.mac(), "stack running");
        while self.step()? {}
        info!("stack stopped");
        Ok(())
    }

    /// One loop iteration. Returns `false` once the loop should stop.
    pub fn step(&mut self) -> Result<bool, DeviceError> {
        if self.stopping {
            return Ok(false);
        }
        let now = self.now();
        let mut busy = false;

        for _ in 0..self.iface.config().rx_batch {
            match self.device.read_frame() {
                Ok(Some(frame)) => {
                    busy = true;
                    self.iface.receive_frame(&frame, now);
                }
                Ok(None) => break,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(%err, "device read failed");
                    break;
                }
            }
        }

        loop {
            match self.requests.try_recv() {
                Ok(Request::Shutdown) => {
                    self.stopping = true;
                    break;
                }
                Ok(request) => {
                    busy = true;
                    self.handle(request, now);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("every stack handle dropped");
                    return Ok(false);
                }
            }
        }

        self.iface.poll(now);
        self.dispatch_events();
        self.wake_waiters(now);

        while let Some(frame) = self.iface.transmit() {
            match self.device.write_frame(&frame) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(%err, len = frame.len(), "device write failed, frame dropped"),
            }
        }

        if !busy && !self.stopping {
            self.idle(now);
        }
        Ok(!self.stopping)
    }

    /// Sleep until a request arrives, a timer is due or the idle period ends
    fn idle(&mut self, now: Millis) {
        let wait = self
            .iface
            .next_deadline()
            .map_or(IDLE_WAIT, |at| at.saturating_sub(now).min(IDLE_WAIT));
        if wait == 0 {
            return;
        }
        match self.requests.recv_timeout(Duration::from_millis(wait)) {
            Ok(Request::Shutdown) => self.stopping = true,
            Ok(request) => {
                let now = self.now();
                self.handle(request, now);
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
    }

    fn dispatch_events(&mut self) {
        let events: Vec<(SocketId, TcpEvent)> = self.iface.take_events().collect();
        for (id, event) in events {
            trace!(?id, ?event, "socket event");
            self.subscribers
                .retain(|subscriber| subscriber.send((id, event)).is_ok());
        }
    }

    fn handle(&mut self, request: Request, now: Millis) {
        let iface = &mut self.iface;
        match request {
            Request::Connect { remote, reply } => match iface.tcp_connect(remote, now) {
                Ok(id) => self.waiters.push(Waiter::Connect { id, reply }),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Request::Listen {
                port,
                backlog,
                reply,
            } => {
                let _ = reply.send(iface.tcp_listen(port, backlog));
            }
            Request::Accept { listener, reply } => {
                self.waiters.push(Waiter::Accept { listener, reply });
            }
            Request::Send { id, data, reply } => {
                self.waiters.push(Waiter::Send { id, data, reply });
            }
            Request::Recv { id, max, reply } => {
                self.waiters.push(Waiter::Recv { id, max, reply });
            }
            Request::Close { id, reply } => {
                let _ = reply.send(iface.tcp_close(id, now));
                self.cancel_waiters(id);
            }
            Request::Abort { id, reply } => {
                let _ = reply.send(iface.tcp_abort(id, now));
                self.cancel_waiters(id);
            }
            Request::PeerAddr { id, reply } => {
                let addrs = iface
                    .tcp_local_addr(id)
                    .zip(iface.tcp_peer_addr(id))
                    .ok_or(SocketError::UnknownSocket);
                let _ = reply.send(addrs);
            }
            Request::UdpBind { port, reply } => {
                let _ = reply.send(iface.udp_bind(port));
            }
            Request::UdpSendTo {
                port,
                remote,
                data,
                reply,
            } => {
                let _ = reply.send(iface.udp_send_to(port, remote, &data, now));
            }
            Request::UdpRecvFrom { port, reply } => {
                self.waiters.push(Waiter::UdpRecv { port, reply });
            }
            Request::UdpClose { port, reply } => {
                let _ = reply.send(iface.udp_close(port));
                self.waiters.retain(|waiter| match waiter {
                    Waiter::UdpRecv { port: waiting, .. } => *waiting != port,
                    _ => true,
                });
            }
            Request::Shutdown => {}
        }
        self.wake_waiters(now);
    }

    /// Parked requests on a connection the application closed fail
    fn cancel_waiters(&mut self, closed: SocketId) {
        self.waiters.retain(|waiter| match waiter {
            Waiter::Recv { id, reply, .. } if *id == closed => {
                let _ = reply.send(Err(SocketError::Closing));
                false
            }
            Waiter::Send { id, reply, .. } if *id == closed => {
                let _ = reply.send(Err(SocketError::Closing));
                false
            }
            Waiter::Accept { listener, reply } if *listener == closed => {
                let _ = reply.send(Err(SocketError::Closing));
                false
            }
            _ => true,
        });
    }

    fn wake_waiters(&mut self, now: Millis) {
        for waiter in mem::take(&mut self.waiters) {
            if let Some(waiter) = self.try_complete(waiter, now) {
                self.waiters.push(waiter);
            }
        }
    }

    /// Finish `waiter` if it can; hand it back if it must keep waiting
    fn try_complete(&mut self, waiter: Waiter, now: Millis) -> Option<Waiter> {
        let iface = &mut self.iface;
        match waiter {
            Waiter::Connect { id, reply } => {
                if let Some(err) = iface.tcp_error(id) {
                    // The handle never learns the id, so release it here.
                    let _ = iface.tcp_close(id, now);
                    let _ = reply.send(Err(err));
                    return None;
                }
                match iface.tcp_state(id) {
                    Some(state) if state.is_synchronized() => {
                        let _ = reply.send(Ok(id));
                        None
                    }
                    Some(_) => Some(Waiter::Connect { id, reply }),
                    None => {
                        let _ = reply.send(Err(SocketError::Reset));
                        None
                    }
                }
            }
            Waiter::Accept { listener, reply } => match iface.tcp_accept(listener) {
                Ok(Some(id)) => {
                    let _ = reply.send(Ok(id));
                    None
                }
                Ok(None) => Some(Waiter::Accept { listener, reply }),
                Err(err) => {
                    let _ = reply.send(Err(err));
                    None
                }
            },
            Waiter::Send { id, data, reply } => {
                if data.is_empty() {
                    let _ = reply.send(Ok(0));
                    return None;
                }
                match iface.tcp_send(id, &data, now) {
                    Ok(0) => Some(Waiter::Send { id, data, reply }),
                    result => {
                        let _ = reply.send(result);
                        None
                    }
                }
            }
            Waiter::Recv { id, max, reply } => match iface.tcp_recv(id, max, now) {
                Ok(Received::Empty) => Some(Waiter::Recv { id, max, reply }),
                result => {
                    let _ = reply.send(result);
                    None
                }
            },
            Waiter::UdpRecv { port, reply } => match iface.udp_recv_from(port) {
                Ok(Some(datagram)) => {
                    let _ = reply.send(Ok(datagram));
                    None
                }
                Ok(None) => Some(Waiter::UdpRecv { port, reply }),
                Err(err) => {
                    let _ = reply.send(Err(err));
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::config::StackConfig;
    use crate::link::MacAddr;

    /// Fails the writes whose index is listed, with the given kind
    struct FlakyDevice {
        fail_on: Vec<usize>,
        kind: io::ErrorKind,
        attempts: usize,
        written: Vec<Vec<u8>>,
    }

    impl FlakyDevice {
        fn new(fail_on: Vec<usize>, kind: io::ErrorKind) -> Self {
            FlakyDevice {
                fail_on,
                kind,
                attempts: 0,
                written: Vec::new(),
            }
        }
    }

    impl Device for FlakyDevice {
        fn read_frame(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
            Ok(None)
        }

        fn write_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
            let attempt = self.attempts;
            self.attempts += 1;
            if self.fail_on.contains(&attempt) {
                return Err(io::Error::from(self.kind).into());
            }
            self.written.push(frame.to_vec());
            Ok(())
        }
    }

    fn stack(device: FlakyDevice) -> (Stack<FlakyDevice>, StackHandle) {
        let config = StackConfig {
            mac: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
            ipv4_addr: Some(Ipv4Addr::new(192, 168, 9, 7)),
            rng_seed: Some(3),
            ..StackConfig::default()
        };
        let iface = Interface::new(config).unwrap();
        Stack::new(iface, device)
    }

    fn send_udp(stack: &mut Stack<FlakyDevice>, host: u8) {
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 9, host)), 9);
        let now = stack.now();
        assert_eq!(stack.iface.udp_send_to(5000, remote, b"hi", now), Ok(2));
    }

    #[test]
    fn test_transient_write_error_drops_only_that_frame() {
        let (mut stack, _handle) = stack(FlakyDevice::new(vec![0], io::ErrorKind::WouldBlock));
        stack.iface.udp_bind(5000).unwrap();

        send_udp(&mut stack, 20);
        assert!(matches!(stack.step(), Ok(true)));
        assert!(stack.device.written.is_empty());

        send_udp(&mut stack, 21);
        assert!(matches!(stack.step(), Ok(true)));
        assert_eq!(stack.device.written.len(), 1);
        assert_eq!(stack.iface.stats().arp_requests_sent, 2);
    }

    #[test]
    fn test_fatal_write_error_stops_the_loop() {
        let (mut stack, _handle) = stack(FlakyDevice::new(vec![0], io::ErrorKind::BrokenPipe));
        stack.iface.udp_bind(5000).unwrap();

        send_udp(&mut stack, 20);
        assert!(matches!(stack.step(), Err(DeviceError::Io(_))));
    }

    #[test]
    fn test_device_error_classification() {
        assert!(!DeviceError::FrameTooLarge(9000).is_fatal());
        assert!(!DeviceError::from(io::Error::from(io::ErrorKind::Interrupted)).is_fatal());
        assert!(DeviceError::from(io::Error::from(io::ErrorKind::NotFound)).is_fatal());
    }
}
