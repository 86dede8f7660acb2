//! ICMP (Internet Control Message Protocol) implementation
//!
//! This module provides ICMPv4 message parsing and building (RFC 792).
//! It supports Echo Request/Reply plus the Destination Unreachable and
//! Time Exceeded error messages the stack emits and reacts to.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DecodeError, DecodeResult};
use crate::network::checksum;

/// Minimum ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

/// Destination Unreachable codes
pub const ICMP_CODE_NET_UNREACHABLE: u8 = 0;
pub const ICMP_CODE_HOST_UNREACHABLE: u8 = 1;
pub const ICMP_CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// Time Exceeded code for a datagram that could not be reassembled in time
pub const ICMP_CODE_REASSEMBLY_TIME_EXCEEDED: u8 = 1;

/// Bytes of the offending datagram quoted in error messages past its IP header
const ERROR_QUOTE_LEN: usize = 8;

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,  // ICMP message type
    pub msg_code: u8,  // ICMP message code
    pub rest: [u8; 4], // Type-specific data (e.g., identifier and sequence for echo)
}

impl IcmpHeader {
    pub fn echo_request(identifier: u16, sequence: u16) -> Self {
        let mut header = IcmpHeader {
            msg_type: ICMP_TYPE_ECHO_REQUEST,
            msg_code: 0,
            rest: [0; 4],
        };
        header.set_identifier(identifier);
        header.set_sequence(sequence);
        header
    }

    pub fn error(msg_type: u8, msg_code: u8) -> Self {
        IcmpHeader {
            msg_type,
            msg_code,
            rest: [0; 4],
        }
    }

    /// Parse an ICMP message, verifying the checksum over the whole message
    pub fn decode(data: &[u8]) -> DecodeResult<(Self, &[u8])> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: ICMP_HEADER_LEN,
                actual: data.len(),
            });
        }
        if checksum(data) != 0 {
            return Err(DecodeError::Checksum);
        }

        let header = IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            rest: [data[4], data[5], data[6], data[7]],
        };
        Ok((header, &data[ICMP_HEADER_LEN..]))
    }

    /// Serialize the header and body, computing the checksum
    pub fn encode(&self, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ICMP_HEADER_LEN + body.len());
        bytes.extend_from_slice(&[self.msg_type, self.msg_code, 0, 0]);
        bytes.extend_from_slice(&self.rest);
        bytes.extend_from_slice(body);
        let sum = checksum(&bytes);
        BigEndian::write_u16(&mut bytes[2..4], sum);
        bytes
    }

    /// Check if this is an Echo Request message
    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST
    }

    /// Check if this is an Echo Reply message
    pub fn is_echo_reply(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REPLY
    }

    /// Whether this message reports an error about a datagram we sent
    pub fn is_error(&self) -> bool {
        matches!(
            self.msg_type,
            ICMP_TYPE_DEST_UNREACHABLE | ICMP_TYPE_TIME_EXCEEDED
        )
    }

    /// Get the identifier field for Echo Request/Reply messages
    pub fn identifier(&self) -> u16 {
        BigEndian::read_u16(&self.rest[0..2])
    }

    /// Get the sequence number field for Echo Request/Reply messages
    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.rest[2..4])
    }

    /// Set the identifier field for Echo Request/Reply messages
    pub fn set_identifier(&mut self, id: u16) {
        BigEndian::write_u16(&mut self.rest[0..2], id);
    }

    /// Set the sequence number field for Echo Request/Reply messages
    pub fn set_sequence(&mut self, seq: u16) {
        BigEndian::write_u16(&mut self.rest[2..4], seq);
    }
}

/// Quote the start of an offending IPv4 datagram for an error message body.
///
/// `datagram` must start at the IP header; the quote keeps the header plus the
/// first eight payload bytes.
pub fn error_quote(datagram: &[u8]) -> &[u8] {
    let header_len = datagram
        .first()
        .map(|b| ((b & 0x0F) as usize) * 4)
        .unwrap_or(0);
    let end = (header_len + ERROR_QUOTE_LEN).min(datagram.len());
    &datagram[..end]
}
