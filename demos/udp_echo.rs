//! UDP echo service on a tap device
//!
//! ```text
//! sudo cargo run --example udp_echo -- tap0 192.168.9.1/24 192.168.9.7
//! nc -u 192.168.9.7 7
//! ```

mod utils;

use std::env;
use std::error::Error;

use toy_network::{Interface, Stack, StackConfig, TapDevice, UdpSocket};
use tracing_subscriber::EnvFilter;

const ECHO_PORT: u16 = 7;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let tap_name = args.get(1).map_or("tap0", String::as_str);
    let host_cidr = args.get(2).map_or("192.168.9.1/24", String::as_str);
    let stack_ip = args.get(3).map_or("192.168.9.7", String::as_str);

    let (host_ip, prefix_len) = utils::parse_ip_cidr(host_cidr)?;
    let config = StackConfig {
        ipv4_addr: Some(stack_ip.parse()?),
        ipv4_prefix_len: prefix_len,
        ipv4_gateway: Some(host_ip),
        ..StackConfig::default()
    };

    let device = TapDevice::open(tap_name, config.mtu)?;
    utils::configure_interface(device.name(), host_cidr)?;
    let iface = Interface::new(config)?;
    let (stack, handle) = Stack::new(iface, device);
    let _stack_thread = stack.spawn();

    let socket = UdpSocket::bind(&handle, ECHO_PORT)?;
    tracing::info!(port = socket.local_port(), "echoing");
    loop {
        let (data, peer) = socket.recv_from()?;
        tracing::debug!(%peer, len = data.len(), "datagram");
        socket.send_to(&data, peer)?;
    }
}
