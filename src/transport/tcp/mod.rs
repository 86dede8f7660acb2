//! TCP (Transmission Control Protocol) implementation
//!
//! This module provides:
//! - Segment header codec with the MSS option
//! - Sequence number arithmetic
//! - The connection state machine
//! - Per-connection control blocks with retransmission, RTT estimation and
//!   congestion control
//! - The store that owns every connection and listener

pub mod buffer;
pub mod congestion;
pub mod fsm;
pub mod header;
pub mod rtt;
pub mod seq;
pub mod store;
pub mod tcb;

pub use fsm::{FsmAction, FsmInput, TcpState};
pub use header::{TcpFlags, TcpHeader, TCP_HEADER_LEN};
pub use seq::SeqNum;
pub use store::{Disposition, SocketId, TcpStore};
pub use tcb::{ConnKey, Received, Tcb, TcpEvent, TcpSegment};
