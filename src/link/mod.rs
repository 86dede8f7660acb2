//! Link layer protocols implementation
//!
//! - Ethernet II framing
//! - ARP for IPv4 over Ethernet

pub mod arp;
pub mod ethernet;

pub use arp::{ArpOperation, ArpPacket};
pub use ethernet::{ethertype, EthernetHeader, MacAddr};
