//! ICMPv6 (RFC 4443) and Neighbor Discovery (RFC 4861) messages

use std::net::{IpAddr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DecodeError, DecodeResult};
use crate::link::MacAddr;
use crate::network::ipv6::ipv6_from_slice;
use crate::network::{protocol, pseudo_header_checksum};

pub const ICMPV6_HEADER_LEN: usize = 8;

pub const ICMPV6_TYPE_DEST_UNREACHABLE: u8 = 1;
pub const ICMPV6_TYPE_TIME_EXCEEDED: u8 = 3;
pub const ICMPV6_TYPE_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_TYPE_ECHO_REPLY: u8 = 129;
pub const ICMPV6_TYPE_NEIGHBOR_SOLICIT: u8 = 135;
pub const ICMPV6_TYPE_NEIGHBOR_ADVERT: u8 = 136;

pub const ICMPV6_CODE_ADDRESS_UNREACHABLE: u8 = 3;
pub const ICMPV6_CODE_PORT_UNREACHABLE: u8 = 4;
pub const ICMPV6_CODE_REASSEMBLY_TIME_EXCEEDED: u8 = 1;

/// Hop limit every Neighbor Discovery message must carry
pub const ND_HOP_LIMIT: u8 = 255;

const ND_OPT_SOURCE_LL_ADDR: u8 = 1;
const ND_OPT_TARGET_LL_ADDR: u8 = 2;

const NA_FLAG_ROUTER: u8 = 0x80;
const NA_FLAG_SOLICITED: u8 = 0x40;
const NA_FLAG_OVERRIDE: u8 = 0x20;

/// Upper bound of an ICMPv6 error message (minimum IPv6 MTU minus the IPv6 header)
const ERROR_MAX_LEN: usize = 1280 - 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Icmpv6Header {
    pub msg_type: u8,
    pub msg_code: u8,
    pub rest: [u8; 4],
}

impl Icmpv6Header {
    pub fn new(msg_type: u8, msg_code: u8) -> Self {
        Icmpv6Header {
            msg_type,
            msg_code,
            rest: [0; 4],
        }
    }

    /// Parse an ICMPv6 message; the checksum covers the IPv6 pseudo-header
    pub fn decode(data: &[u8], src: Ipv6Addr, dst: Ipv6Addr) -> DecodeResult<(Self, &[u8])> {
        if data.len() < ICMPV6_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: ICMPV6_HEADER_LEN,
                actual: data.len(),
            });
        }
        if pseudo_header_checksum(IpAddr::V6(src), IpAddr::V6(dst), protocol::ICMPV6, data) != 0 {
            return Err(DecodeError::Checksum);
        }
        let header = Icmpv6Header {
            msg_type: data[0],
            msg_code: data[1],
            rest: [data[4], data[5], data[6], data[7]],
        };
        Ok((header, &data[ICMPV6_HEADER_LEN..]))
    }

    pub fn encode(&self, src: Ipv6Addr, dst: Ipv6Addr, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ICMPV6_HEADER_LEN + body.len());
        bytes.extend_from_slice(&[self.msg_type, self.msg_code, 0, 0]);
        bytes.extend_from_slice(&self.rest);
        bytes.extend_from_slice(body);
        let sum = pseudo_header_checksum(IpAddr::V6(src), IpAddr::V6(dst), protocol::ICMPV6, &bytes);
        BigEndian::write_u16(&mut bytes[2..4], sum);
        bytes
    }

    pub fn is_error(&self) -> bool {
        self.msg_type < 128
    }
}

/// Quote as much of an offending IPv6 datagram as fits in an error message
pub fn error_quote(datagram: &[u8]) -> &[u8] {
    &datagram[..datagram.len().min(ERROR_MAX_LEN - ICMPV6_HEADER_LEN)]
}

/// Neighbor Discovery messages used for address resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdMessage {
    NeighborSolicit {
        target: Ipv6Addr,
        source_mac: Option<MacAddr>,
    },
    NeighborAdvert {
        router: bool,
        solicited: bool,
        override_entry: bool,
        target: Ipv6Addr,
        target_mac: Option<MacAddr>,
    },
}

impl NdMessage {
    /// Interpret an already checksum-verified ICMPv6 message as ND, if it is one
    pub fn decode(header: &Icmpv6Header, body: &[u8]) -> DecodeResult<Option<Self>> {
        let option_type = match header.msg_type {
            ICMPV6_TYPE_NEIGHBOR_SOLICIT => ND_OPT_SOURCE_LL_ADDR,
            ICMPV6_TYPE_NEIGHBOR_ADVERT => ND_OPT_TARGET_LL_ADDR,
            _ => return Ok(None),
        };
        if header.msg_code != 0 {
            return Err(DecodeError::Malformed("ND message with non-zero code"));
        }
        if body.len() < 16 {
            return Err(DecodeError::Truncated {
                needed: 16,
                actual: body.len(),
            });
        }
        let target = ipv6_from_slice(&body[..16]);
        if target.is_multicast() {
            return Err(DecodeError::Malformed("ND target is multicast"));
        }
        let link_addr = find_link_addr_option(&body[16..], option_type)?;

        Ok(Some(match header.msg_type {
            ICMPV6_TYPE_NEIGHBOR_SOLICIT => NdMessage::NeighborSolicit {
                target,
                source_mac: link_addr,
            },
            _ => NdMessage::NeighborAdvert {
                router: header.rest[0] & NA_FLAG_ROUTER != 0,
                solicited: header.rest[0] & NA_FLAG_SOLICITED != 0,
                override_entry: header.rest[0] & NA_FLAG_OVERRIDE != 0,
                target,
                target_mac: link_addr,
            },
        }))
    }

    /// Build the ICMPv6 header and body for this message
    pub fn to_parts(&self) -> (Icmpv6Header, Vec<u8>) {
        let (mut header, target, option) = match *self {
            NdMessage::NeighborSolicit { target, source_mac } => (
                Icmpv6Header::new(ICMPV6_TYPE_NEIGHBOR_SOLICIT, 0),
                target,
                source_mac.map(|mac| (ND_OPT_SOURCE_LL_ADDR, mac)),
            ),
            NdMessage::NeighborAdvert {
                router,
                solicited,
                override_entry,
                target,
                target_mac,
            } => {
                let mut header = Icmpv6Header::new(ICMPV6_TYPE_NEIGHBOR_ADVERT, 0);
                if router {
                    header.rest[0] |= NA_FLAG_ROUTER;
                }
                if solicited {
                    header.rest[0] |= NA_FLAG_SOLICITED;
                }
                if override_entry {
                    header.rest[0] |= NA_FLAG_OVERRIDE;
                }
                (
                    header,
                    target,
                    target_mac.map(|mac| (ND_OPT_TARGET_LL_ADDR, mac)),
                )
            }
        };
        header.rest[1..].fill(0);

        let mut body = target.octets().to_vec();
        if let Some((kind, mac)) = option {
            body.extend_from_slice(&[kind, 1]);
            body.extend_from_slice(&mac.0);
        }
        (header, body)
    }

    pub fn encode(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        let (header, body) = self.to_parts();
        header.encode(src, dst, &body)
    }
}

fn find_link_addr_option(mut options: &[u8], wanted: u8) -> DecodeResult<Option<MacAddr>> {
    let mut found = None;
    while !options.is_empty() {
        if options.len() < 2 {
            return Err(DecodeError::Malformed("ND option truncated"));
        }
        let len = options[1] as usize * 8;
        if len == 0 || options.len() < len {
            return Err(DecodeError::Malformed("ND option length invalid"));
        }
        if options[0] == wanted && len >= 8 {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&options[2..8]);
            found = Some(MacAddr(mac));
        }
        options = &options[len..];
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (Ipv6Addr, Ipv6Addr) {
        (
            "2603:9000:e307:9f09::1fa1".parse().unwrap(),
            "2603:9000:e307:9f09:0:ff:fe77:7777".parse().unwrap(),
        )
    }

    #[test]
    fn test_echo_roundtrip_with_pseudo_header() {
        let (src, dst) = addrs();
        let mut header = Icmpv6Header::new(ICMPV6_TYPE_ECHO_REQUEST, 0);
        header.rest = [0, 1, 0, 2];
        let bytes = header.encode(src, dst, b"data");
        let (decoded, body) = Icmpv6Header::decode(&bytes, src, dst).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, b"data");

        // Same bytes under a different pseudo-header fail.
        assert_eq!(
            Icmpv6Header::decode(&bytes, dst, src).map(|_| ()),
            Err(DecodeError::Checksum)
        );
    }

    #[test]
    fn test_neighbor_solicit_roundtrip() {
        let (src, dst) = addrs();
        let message = NdMessage::NeighborSolicit {
            target: dst,
            source_mac: Some(MacAddr([0x52, 0x54, 0x00, 0xdf, 0x85, 0x37])),
        };
        let bytes = message.encode(src, dst);
        let (header, body) = Icmpv6Header::decode(&bytes, src, dst).unwrap();
        assert_eq!(NdMessage::decode(&header, body).unwrap(), Some(message));
    }

    #[test]
    fn test_neighbor_advert_roundtrip() {
        let (src, dst) = addrs();
        let message = NdMessage::NeighborAdvert {
            router: false,
            solicited: true,
            override_entry: true,
            target: src,
            target_mac: Some(MacAddr([0x02, 0, 0, 0x77, 0x77, 0x77])),
        };
        let bytes = message.encode(src, dst);
        let (header, body) = Icmpv6Header::decode(&bytes, src, dst).unwrap();
        assert_eq!(NdMessage::decode(&header, body).unwrap(), Some(message));
    }

    #[test]
    fn test_rejects_zero_length_option() {
        let (_, dst) = addrs();
        let header = Icmpv6Header::new(ICMPV6_TYPE_NEIGHBOR_SOLICIT, 0);
        let mut body = dst.octets().to_vec();
        body.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(NdMessage::decode(&header, &body).is_err());
    }
}
