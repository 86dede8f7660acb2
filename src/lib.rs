//! A user-space TCP/IP stack
//!
//! This library terminates and originates traffic on an Ethernet link:
//! - Ethernet, ARP and IPv6 Neighbor Discovery
//! - IPv4 and IPv6 with fragmentation and reassembly
//! - ICMP echo and error handling
//! - UDP and TCP with retransmission and congestion control
//! - An event loop and blocking socket handles on top of it

pub mod config;
pub mod error;
pub mod iface;
pub mod link;
pub mod network;
pub mod socket;
pub mod stack;
pub mod stats;
pub mod transport;

// Re-export commonly used types
pub use config::{Millis, StackConfig};
pub use error::{ConfigError, DecodeError, DeviceError, SocketError};
pub use iface::{Device, Interface, QueueDevice, TapDevice};
pub use link::MacAddr;
pub use socket::{TcpListener, TcpStream, UdpSocket};
pub use stack::{Stack, StackHandle};
pub use stats::Stats;
pub use transport::tcp::{Received, SocketId, TcpEvent, TcpState};
