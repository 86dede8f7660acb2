//! Ethernet II framing

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DecodeError, DecodeResult};

pub const ETHERNET_HEADER_LEN: usize = 14;

/// EtherType constants
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const IPV6: u16 = 0x86DD;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const UNSPECIFIED: MacAddr = MacAddr([0; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Link-layer group address for an IPv6 multicast destination (RFC 2464)
    pub fn ipv6_multicast(addr: std::net::Ipv6Addr) -> Self {
        let o = addr.octets();
        MacAddr([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn decode(data: &[u8]) -> DecodeResult<(Self, &[u8])> {
        if data.len() < ETHERNET_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: ETHERNET_HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        src.copy_from_slice(&data[6..12]);
        let ethertype = BigEndian::read_u16(&data[12..14]);
        if ethertype < 0x0600 {
            return Err(DecodeError::Unsupported("802.3 length field frame"));
        }

        Ok((
            EthernetHeader {
                dst: MacAddr(dst),
                src: MacAddr(src),
                ethertype,
            },
            &data[ETHERNET_HEADER_LEN..],
        ))
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ETHERNET_HEADER_LEN + payload.len());
        bytes.extend_from_slice(&self.dst.0);
        bytes.extend_from_slice(&self.src.0);
        bytes.extend_from_slice(&self.ethertype.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let header = EthernetHeader {
            dst: MacAddr::BROADCAST,
            src: MacAddr([0x02, 0, 0, 0x77, 0x77, 0x77]),
            ethertype: ethertype::ARP,
        };
        let bytes = header.encode(&[1, 2, 3]);
        assert_eq!(bytes.len(), 17);
        let (decoded, payload) = EthernetHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_rejects_short_frame() {
        assert!(matches!(
            EthernetHeader::decode(&[0u8; 13]),
            Err(DecodeError::Truncated { needed: 14, actual: 13 })
        ));
    }

    #[test]
    fn test_display_and_multicast() {
        let mac = MacAddr::ipv6_multicast("ff02::1:ff77:7777".parse().unwrap());
        assert_eq!(mac.to_string(), "33:33:ff:77:77:77");
        assert!(mac.is_multicast());
        assert!(!MacAddr([0x02, 0, 0, 0, 0, 1]).is_multicast());
    }
}
