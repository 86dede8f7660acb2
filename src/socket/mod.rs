//! Blocking socket handles
//!
//! Thin wrappers that turn application calls into requests for the event
//! loop and block on the answer. They may be used from any thread.

pub mod tcp;
pub mod udp;

pub use tcp::{TcpListener, TcpStream};
pub use udp::UdpSocket;
