//! Two event loops on their own threads, linked by an in-memory device

use std::net::{Ipv4Addr, SocketAddr};
use std::thread;

use toy_network::{
    Interface, MacAddr, QueueDevice, SocketError, Stack, StackConfig, StackHandle, TcpListener,
    TcpStream, UdpSocket,
};

const A_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 7);
const B_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 8);

struct Running {
    handle: StackHandle,
    thread: thread::JoinHandle<Result<(), toy_network::DeviceError>>,
}

impl Running {
    fn stop(self) {
        self.handle.shutdown();
        self.thread.join().unwrap().unwrap();
    }
}

fn start(mac: MacAddr, addr: Ipv4Addr, device: QueueDevice) -> Running {
    let config = StackConfig {
        mac,
        ipv4_addr: Some(addr),
        rng_seed: Some(addr.octets()[3] as u64),
        ..StackConfig::default()
    };
    let (stack, handle) = Stack::new(Interface::new(config).unwrap(), device);
    Running {
        handle,
        thread: stack.spawn(),
    }
}

fn linked() -> (Running, Running) {
    let (dev_a, dev_b) = QueueDevice::pair();
    (
        start(MacAddr([2, 0, 0, 0, 0, 0x0a]), A_IP, dev_a),
        start(MacAddr([2, 0, 0, 0, 0, 0x0b]), B_IP, dev_b),
    )
}

#[test]
fn test_tcp_echo_across_threads() {
    let (a, b) = linked();
    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 249) as u8).collect();
    let expected = data.len();

    let listener = TcpListener::bind(&b.handle, 7, None).unwrap();
    let server = thread::spawn(move || {
        let stream = listener.accept().unwrap();
        let mut got = Vec::new();
        while got.len() < expected {
            match stream.recv(4096).unwrap() {
                Some(chunk) => got.extend(chunk),
                None => break,
            }
        }
        stream.send_all(&got).unwrap();
        stream.close().unwrap();
    });

    let stream = TcpStream::connect(&a.handle, SocketAddr::from((B_IP, 7))).unwrap();
    assert_eq!(stream.peer_addr(), Ok(SocketAddr::from((B_IP, 7))));
    stream.send_all(&data).unwrap();
    let echoed = stream.recv_to_end().unwrap();
    assert!(echoed == data);
    stream.close().unwrap();
    server.join().unwrap();

    a.stop();
    b.stop();
}

#[test]
fn test_connect_to_closed_port_fails() {
    let (a, b) = linked();
    let result = TcpStream::connect(&a.handle, SocketAddr::from((B_IP, 81)));
    assert_eq!(result.map(|stream| stream.id()), Err(SocketError::Reset));
    a.stop();
    b.stop();
}

#[test]
fn test_udp_echo_across_threads() {
    let (a, b) = linked();

    let echo = UdpSocket::bind(&b.handle, 9).unwrap();
    let server = thread::spawn(move || {
        let (payload, from) = echo.recv_from().unwrap();
        echo.send_to(&payload, from).unwrap();
    });

    let socket = UdpSocket::bind(&a.handle, 0).unwrap();
    let port = socket.local_port();
    assert_ne!(port, 0);
    socket
        .send_to(b"are you there", SocketAddr::from((B_IP, 9)))
        .unwrap();
    let (payload, from) = socket.recv_from().unwrap();
    assert_eq!(payload, b"are you there");
    assert_eq!(from, SocketAddr::from((B_IP, 9)));
    server.join().unwrap();

    drop(socket);
    a.stop();
    b.stop();
}
