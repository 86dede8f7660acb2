//! IPv6 protocol implementation
//!
//! Fixed 40-byte header (RFC 8200), the Fragment extension header, and a
//! walker that skips Hop-by-Hop, Routing and Destination Options headers to
//! find the upper-layer protocol.

use std::net::Ipv6Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DecodeError, DecodeResult};
use crate::network::protocol;

pub const IPV6_HEADER_LEN: usize = 40;
pub const IPV6_FRAGMENT_HEADER_LEN: usize = 8;
pub const DEFAULT_HOP_LIMIT: u8 = 64;
const IPV6_VERSION: u8 = 6;

const NEXT_HEADER_HOP_BY_HOP: u8 = 0;
const NEXT_HEADER_ROUTING: u8 = 43;
const NEXT_HEADER_DEST_OPTIONS: u8 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    /// 20-bit flow label.
    pub flow_label: u32,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
}

impl Ipv6Header {
    pub fn new(next_header: u8, src_addr: Ipv6Addr, dst_addr: Ipv6Addr) -> Self {
        Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            next_header,
            hop_limit: DEFAULT_HOP_LIMIT,
            src_addr,
            dst_addr,
        }
    }

    /// Parse the fixed header and return the payload it covers.
    pub fn decode(data: &[u8]) -> DecodeResult<(Self, &[u8])> {
        if data.len() < IPV6_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: IPV6_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = data[0] >> 4;
        if version != IPV6_VERSION {
            return Err(DecodeError::Version(version));
        }

        let payload_len = BigEndian::read_u16(&data[4..6]) as usize;
        if data.len() < IPV6_HEADER_LEN + payload_len {
            return Err(DecodeError::Truncated {
                needed: IPV6_HEADER_LEN + payload_len,
                actual: data.len(),
            });
        }

        let word = BigEndian::read_u32(&data[0..4]);
        let header = Ipv6Header {
            traffic_class: ((word >> 20) & 0xFF) as u8,
            flow_label: word & 0x000F_FFFF,
            next_header: data[6],
            hop_limit: data[7],
            src_addr: ipv6_from_slice(&data[8..24]),
            dst_addr: ipv6_from_slice(&data[24..40]),
        };

        Ok((header, &data[IPV6_HEADER_LEN..IPV6_HEADER_LEN + payload_len]))
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; IPV6_HEADER_LEN];
        let word = ((IPV6_VERSION as u32) << 28)
            | ((self.traffic_class as u32) << 20)
            | (self.flow_label & 0x000F_FFFF);
        BigEndian::write_u32(&mut bytes[0..4], word);
        BigEndian::write_u16(&mut bytes[4..6], payload.len() as u16);
        bytes[6] = self.next_header;
        bytes[7] = self.hop_limit;
        bytes[8..24].copy_from_slice(&self.src_addr.octets());
        bytes[24..40].copy_from_slice(&self.dst_addr.octets());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Split an upper-layer `payload` into Fragment-header datagrams fitting `mtu`.
    ///
    /// `self.next_header` names the upper-layer protocol; the emitted packets
    /// carry next header 44 with the original value inside the fragment header.
    pub fn fragment(&self, payload: &[u8], id: u32, mtu: usize) -> Vec<Vec<u8>> {
        let per_packet = mtu.saturating_sub(IPV6_HEADER_LEN + IPV6_FRAGMENT_HEADER_LEN) / 8 * 8;
        let chunk_len = per_packet.max(8);
        let chunks: Vec<&[u8]> = payload.chunks(chunk_len).collect();
        let last = chunks.len().saturating_sub(1);

        let mut outer = self.clone();
        outer.next_header = protocol::IPV6_FRAGMENT;
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let fragment = Ipv6FragmentHeader {
                    next_header: self.next_header,
                    offset: (index * chunk_len) as u16,
                    more_fragments: index != last,
                    id,
                };
                let mut body = fragment.encode().to_vec();
                body.extend_from_slice(chunk);
                outer.encode(&body)
            })
            .collect()
    }
}

/// Fragment extension header (RFC 8200 section 4.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6FragmentHeader {
    pub next_header: u8,
    /// Offset in bytes, a multiple of 8.
    pub offset: u16,
    pub more_fragments: bool,
    pub id: u32,
}

impl Ipv6FragmentHeader {
    pub fn decode(data: &[u8]) -> DecodeResult<(Self, &[u8])> {
        if data.len() < IPV6_FRAGMENT_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: IPV6_FRAGMENT_HEADER_LEN,
                actual: data.len(),
            });
        }
        let offset_flags = BigEndian::read_u16(&data[2..4]);
        let header = Ipv6FragmentHeader {
            next_header: data[0],
            offset: offset_flags & 0xFFF8,
            more_fragments: offset_flags & 0x0001 != 0,
            id: BigEndian::read_u32(&data[4..8]),
        };
        Ok((header, &data[IPV6_FRAGMENT_HEADER_LEN..]))
    }

    pub fn encode(&self) -> [u8; IPV6_FRAGMENT_HEADER_LEN] {
        let mut bytes = [0u8; IPV6_FRAGMENT_HEADER_LEN];
        bytes[0] = self.next_header;
        let offset_flags = (self.offset & 0xFFF8) | self.more_fragments as u16;
        BigEndian::write_u16(&mut bytes[2..4], offset_flags);
        BigEndian::write_u32(&mut bytes[4..8], self.id);
        bytes
    }
}

/// Skip Hop-by-Hop, Routing and Destination Options headers.
///
/// Returns the first header type the stack handles itself (fragment or an
/// upper-layer protocol) together with the bytes that follow it.
pub fn skip_extension_headers(mut next_header: u8, mut data: &[u8]) -> DecodeResult<(u8, &[u8])> {
    loop {
        match next_header {
            NEXT_HEADER_HOP_BY_HOP | NEXT_HEADER_ROUTING | NEXT_HEADER_DEST_OPTIONS => {
                if data.len() < 8 {
                    return Err(DecodeError::Truncated {
                        needed: 8,
                        actual: data.len(),
                    });
                }
                let len = (data[1] as usize + 1) * 8;
                if data.len() < len {
                    return Err(DecodeError::Truncated {
                        needed: len,
                        actual: data.len(),
                    });
                }
                next_header = data[0];
                data = &data[len..];
            }
            _ => return Ok((next_header, data)),
        }
    }
}

pub(crate) fn ipv6_from_slice(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    Ipv6Addr::from(octets)
}

/// Solicited-node multicast group for `addr` (RFC 4291 section 2.7.1)
pub fn solicited_node(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | o[13] as u16,
        u16::from_be_bytes([o[14], o[15]]),
    )
}
