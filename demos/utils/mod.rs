//! Helpers shared by the demos: host-side tap configuration and address
//! parsing.

pub mod network;

pub use network::*;
