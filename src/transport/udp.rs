//! UDP (User Datagram Protocol) implementation
//!
//! This module provides UDP header parsing/serialization (RFC 768) and the
//! per-port receive queue the interface delivers datagrams into.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DecodeError, DecodeResult};
use crate::network::{protocol, pseudo_header_checksum};

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// UDP packet header structure
///
/// Length and checksum are derived on encode and validated on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpHeader {
    /// Parse and validate a UDP datagram carried between `src` and `dst`.
    ///
    /// A zero checksum means "not computed" over IPv4 and is rejected over IPv6.
    pub fn decode(data: &[u8], src: IpAddr, dst: IpAddr) -> DecodeResult<(Self, &[u8])> {
        if data.len() < UDP_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: UDP_HEADER_LEN,
                actual: data.len(),
            });
        }

        let length = BigEndian::read_u16(&data[4..6]) as usize;
        if length < UDP_HEADER_LEN {
            return Err(DecodeError::Malformed("UDP length below header length"));
        }
        if length > data.len() {
            return Err(DecodeError::Truncated {
                needed: length,
                actual: data.len(),
            });
        }
        let datagram = &data[..length];

        let checksum = BigEndian::read_u16(&data[6..8]);
        if checksum == 0 {
            if src.is_ipv6() {
                return Err(DecodeError::Checksum);
            }
        } else if pseudo_header_checksum(src, dst, protocol::UDP, datagram) != 0 {
            return Err(DecodeError::Checksum);
        }

        let header = UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
        };
        Ok((header, &datagram[UDP_HEADER_LEN..]))
    }

    /// Serialize header and payload, always computing the checksum
    pub fn encode(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> Vec<u8> {
        let total_len = UDP_HEADER_LEN + payload.len();
        let mut bytes = vec![0u8; UDP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], total_len as u16);
        bytes.extend_from_slice(payload);

        let sum = match pseudo_header_checksum(src, dst, protocol::UDP, &bytes) {
            // All-zero is reserved for "no checksum"; transmit the equivalent all-ones.
            0 => 0xFFFF,
            sum => sum,
        };
        BigEndian::write_u16(&mut bytes[6..8], sum);
        bytes
    }
}

/// Represents a received UDP datagram, waiting in a socket's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub remote: SocketAddr,
    pub payload: Vec<u8>,
}

/// Receive side of a bound UDP port.
#[derive(Debug)]
pub struct UdpSocket {
    pub bind_port: u16,
    rx_queue: VecDeque<UdpDatagram>,
    capacity: usize,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to a specific port.
    pub fn new(port: u16, capacity: usize) -> Self {
        UdpSocket {
            bind_port: port,
            rx_queue: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueues a datagram that has arrived for this socket.
    ///
    /// Returns false when the queue is full and the datagram was dropped.
    pub(crate) fn enqueue(&mut self, datagram: UdpDatagram) -> bool {
        if self.rx_queue.len() >= self.capacity {
            return false;
        }
        self.rx_queue.push_back(datagram);
        true
    }

    /// Dequeues a datagram for the application to process.
    pub fn recv(&mut self) -> Option<UdpDatagram> {
        self.rx_queue.pop_front()
    }

    pub fn has_packet(&self) -> bool {
        !self.rx_queue.is_empty()
    }
}
