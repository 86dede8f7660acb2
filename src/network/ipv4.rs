//! IPv4 protocol implementation
//!
//! This module provides IPv4 header parsing, validation and serialization.
//!
//! Features:
//! - Header decoding with version, length and checksum validation
//! - Header encoding with automatic total length and checksum
//! - Fragment field helpers and datagram fragmentation for transmit

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DecodeError, DecodeResult};
use crate::network::checksum;

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
pub const DEFAULT_TTL: u8 = 64;

/// IPv4 packet header structure
///
/// Represents the RFC 791 header. Total length, IHL and the checksum are not
/// stored: they are derived from the options and payload on encode, and
/// validated on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8, // Type of Service
    pub id: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in bytes (always a multiple of 8 on the wire).
    pub frag_offset: u16,
    pub ttl: u8,      // Time to Live
    pub protocol: u8, // Next Protocol
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    /// Raw option bytes, padded to a multiple of four on encode.
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Create a new IPv4 header with default values
    ///
    /// Only requires the essential parameters; the datagram is not a fragment.
    pub fn new(protocol: u8, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, id: u16) -> Self {
        Ipv4Header {
            tos: 0,
            id,
            dont_fragment: false,
            more_fragments: false,
            frag_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            src_addr,
            dst_addr,
            options: Vec::new(),
        }
    }

    /// Parse and validate an IPv4 header, returning it with its payload.
    ///
    /// The payload is cut at the total length field so link-layer padding
    /// never reaches upper layers.
    pub fn decode(data: &[u8]) -> DecodeResult<(Self, &[u8])> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: IPV4_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = data[0] >> 4;
        if version != IPV4_VERSION {
            return Err(DecodeError::Version(version));
        }

        let header_len = ((data[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_HEADER_LEN {
            return Err(DecodeError::Malformed("IPv4 IHL below 5"));
        }
        if data.len() < header_len {
            return Err(DecodeError::Truncated {
                needed: header_len,
                actual: data.len(),
            });
        }

        let total_len = BigEndian::read_u16(&data[2..4]) as usize;
        if total_len < header_len {
            return Err(DecodeError::Malformed("IPv4 total length below header length"));
        }
        if data.len() < total_len {
            return Err(DecodeError::Truncated {
                needed: total_len,
                actual: data.len(),
            });
        }

        if checksum(&data[..header_len]) != 0 {
            return Err(DecodeError::Checksum);
        }

        let flags_frag_offset = BigEndian::read_u16(&data[6..8]);
        let header = Ipv4Header {
            tos: data[1],
            id: BigEndian::read_u16(&data[4..6]),
            dont_fragment: flags_frag_offset & flags::DONT_FRAGMENT != 0,
            more_fragments: flags_frag_offset & flags::MORE_FRAGMENTS != 0,
            frag_offset: (flags_frag_offset & flags::FRAGMENT_OFFSET_MASK) << 3,
            ttl: data[8],
            protocol: data[9],
            src_addr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst_addr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            options: data[IPV4_HEADER_LEN..header_len].to_vec(),
        };

        Ok((header, &data[header_len..total_len]))
    }

    /// Get the header length in bytes, options padded to 32-bit words
    pub fn header_len(&self) -> usize {
        IPV4_HEADER_LEN + (self.options.len() + 3) / 4 * 4
    }

    /// Whether this header describes one piece of a fragmented datagram
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.frag_offset != 0
    }

    fn flags_frag_offset(&self) -> u16 {
        let mut value = (self.frag_offset >> 3) & flags::FRAGMENT_OFFSET_MASK;
        if self.dont_fragment {
            value |= flags::DONT_FRAGMENT;
        }
        if self.more_fragments {
            value |= flags::MORE_FRAGMENTS;
        }
        value
    }

    /// Serialize the header followed by `payload`.
    ///
    /// The total length and checksum fields are always computed here.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let header_len = self.header_len();
        let mut bytes = vec![0u8; header_len];
        bytes[0] = (IPV4_VERSION << 4) | (header_len / 4) as u8;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], (header_len + payload.len()) as u16);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset());
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        bytes[12..16].copy_from_slice(&self.src_addr.octets());
        bytes[16..20].copy_from_slice(&self.dst_addr.octets());
        bytes[IPV4_HEADER_LEN..IPV4_HEADER_LEN + self.options.len()]
            .copy_from_slice(&self.options);

        let sum = checksum(&bytes);
        BigEndian::write_u16(&mut bytes[10..12], sum);

        bytes.extend_from_slice(payload);
        bytes
    }

    /// Split `payload` into fragments that each fit in `mtu` bytes.
    ///
    /// Returns a single unfragmented packet when it already fits. Callers must
    /// check `dont_fragment` first.
    pub fn fragment(&self, payload: &[u8], mtu: usize) -> Vec<Vec<u8>> {
        let header_len = self.header_len();
        if header_len + payload.len() <= mtu {
            return vec![self.encode(payload)];
        }

        let chunk_len = (mtu.saturating_sub(header_len) / 8 * 8).max(8);
        let chunks: Vec<&[u8]> = payload.chunks(chunk_len).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let mut header = self.clone();
                header.frag_offset = self.frag_offset + (index * chunk_len) as u16;
                header.more_fragments = index != last || self.more_fragments;
                header.encode(chunk)
            })
            .collect()
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const IPV6_FRAGMENT: u8 = 44;
    pub const ICMPV6: u8 = 58;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}
