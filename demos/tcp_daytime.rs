//! Daytime-style TCP service on a tap device
//!
//! ```text
//! sudo cargo run --example tcp_daytime -- tap0 192.168.9.1/24 192.168.9.7
//! nc 192.168.9.7 13
//! ```

mod utils;

use std::env;
use std::error::Error;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use toy_network::{Interface, Stack, StackConfig, TapDevice, TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

const DAYTIME_PORT: u16 = 13;

fn serve(stream: TcpStream) -> Result<(), Box<dyn Error>> {
    let peer = stream.peer_addr()?;
    let seconds = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let message = format!("{seconds} seconds since the Unix epoch\r\n");
    stream.send_all(message.as_bytes())?;
    stream.close()?;
    tracing::info!(%peer, "daytime sent");
    Ok(())
}

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
    let stack_thread = stack.spawn();

    let listener = TcpListener::bind(&handle, DAYTIME_PORT, None)?;
    tracing::info!(port = DAYTIME_PORT, "listening");
    loop {
        match listener.accept() {
            Ok(stream) => {
                thread::spawn(move || {
                    if let Err(err) = serve(stream) {
                        tracing::warn!(%err, "daytime connection failed");
                    }
                });
            }
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                break;
            }
        }
    }

    handle.shutdown();
    match stack_thread.join() {
        Ok(result) => result?,
        Err(_) => return Err("stack thread panicked".into()),
    }
    Ok(())
}
