//! Network interface layer
//!
//! This module ties the protocol codecs together into a working host:
//! - Interface state and frame dispatch (ARP, IPv4, IPv6)
//! - Neighbor resolution caches and fragment reassembly
//! - ICMP replies and errors, UDP delivery, TCP segment routing
//! - Raw frame devices the interface is driven from

pub mod device;
pub mod fragment;
pub mod interface;
mod ip;
mod ipv4;
mod ipv6;
pub mod neighbor;

// Re-export commonly used items
pub use device::{Device, QueueDevice, TapDevice};
pub use interface::Interface;
