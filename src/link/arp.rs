//! ARP for IPv4 over Ethernet (RFC 826)

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DecodeError, DecodeResult};
use crate::link::{ethertype, MacAddr};

pub const ARP_PACKET_LEN: usize = 28;
const HTYPE_ETHERNET: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

impl ArpOperation {
    fn from_raw(op: u16) -> Option<Self> {
        match op {
            1 => Some(ArpOperation::Request),
            2 => Some(ArpOperation::Reply),
            _ => None,
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpPacket {
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::UNSPECIFIED,
            target_ip,
        }
    }

    /// Build the reply answering `request` on behalf of `our_mac`
    pub fn reply_to(request: &ArpPacket, our_mac: MacAddr) -> Self {
        ArpPacket {
            operation: ArpOperation::Reply,
            sender_mac: our_mac,
            sender_ip: request.target_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        }
    }

    /// Parse an ARP packet, accepting only Ethernet/IPv4 address formats
    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < ARP_PACKET_LEN {
            return Err(DecodeError::Truncated {
                needed: ARP_PACKET_LEN,
                actual: data.len(),
            });
        }
        if BigEndian::read_u16(&data[0..2]) != HTYPE_ETHERNET
            || BigEndian::read_u16(&data[2..4]) != ethertype::IPV4
        {
            return Err(DecodeError::Unsupported("ARP hardware/protocol type"));
        }
        if data[4] != 6 || data[5] != 4 {
            return Err(DecodeError::Malformed("ARP address lengths"));
        }
        let operation = ArpOperation::from_raw(BigEndian::read_u16(&data[6..8]))
            .ok_or(DecodeError::Unsupported("ARP operation"))?;

        let mac = |range: std::ops::Range<usize>| {
            let mut octets = [0u8; 6];
            octets.copy_from_slice(&data[range]);
            MacAddr(octets)
        };
        let ip = |at: usize| Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3]);

        Ok(ArpPacket {
            operation,
            sender_mac: mac(8..14),
            sender_ip: ip(14),
            target_mac: mac(18..24),
            target_ip: ip(24),
        })
    }

    pub fn encode(&self) -> [u8; ARP_PACKET_LEN] {
        let mut bytes = [0u8; ARP_PACKET_LEN];
        BigEndian::write_u16(&mut bytes[0..2], HTYPE_ETHERNET);
        BigEndian::write_u16(&mut bytes[2..4], ethertype::IPV4);
        bytes[4] = 6;
        bytes[5] = 4;
        BigEndian::write_u16(&mut bytes[6..8], self.operation.to_raw());
        bytes[8..14].copy_from_slice(&self.sender_mac.0);
        bytes[14..18].copy_from_slice(&self.sender_ip.octets());
        bytes[18..24].copy_from_slice(&self.target_mac.0);
        bytes[24..28].copy_from_slice(&self.target_ip.octets());
        bytes
    }

    /// Gratuitous announcements carry the same address as sender and target
    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_reply_roundtrip() {
        let request = ArpPacket::request(
            MacAddr([0x52, 0x54, 0x00, 0xdf, 0x85, 0x37]),
            Ipv4Addr::new(192, 168, 9, 102),
            Ipv4Addr::new(192, 168, 9, 7),
        );
        let decoded = ArpPacket::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);

        let reply = ArpPacket::reply_to(&decoded, MacAddr([0x02, 0, 0, 0x77, 0x77, 0x77]));
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.sender_ip, request.target_ip);
        assert_eq!(reply.target_mac, request.sender_mac);
        assert_eq!(ArpPacket::decode(&reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_rejects_unknown_operation_and_formats() {
        let mut bytes = ArpPacket::request(
            MacAddr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::LOCALHOST,
        )
        .encode();
        bytes[7] = 9;
        assert_eq!(
            ArpPacket::decode(&bytes),
            Err(DecodeError::Unsupported("ARP operation"))
        );
        bytes[7] = 1;
        bytes[4] = 8;
        assert!(ArpPacket::decode(&bytes).is_err());
    }
}
