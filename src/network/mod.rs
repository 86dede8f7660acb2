//! Network layer protocols implementation
//!
//! This module contains implementations for network layer protocols:
//! - IPv4: Internet Protocol version 4
//! - IPv6: Internet Protocol version 6 (fixed header and fragment extension)
//! - ICMP / ICMPv6: control messages, including Neighbor Discovery

pub mod icmp;
pub mod icmpv6;
pub mod ipv4;
pub mod ipv6;

use std::net::IpAddr;

// Re-export commonly used items
pub use icmp::IcmpHeader;
pub use icmpv6::{Icmpv6Header, NdMessage};
pub use ipv4::{flags, protocol, Ipv4Header};
pub use ipv6::{Ipv6FragmentHeader, Ipv6Header};

/// Add `data` to a running one's complement sum.
///
/// Odd-length data is padded with a trailing zero byte.
pub(crate) fn sum_words(mut sum: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

/// Fold the carries of a running sum and return its one's complement.
pub(crate) fn fold(mut sum: u64) -> u16 {
    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Calculate Internet checksum
///
/// Algorithm: Sum data in 16-bit chunks, add carry bits to the sum,
/// and return the one's complement of the result.
/// This is used for IPv4 header and ICMPv4 checksums.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// Checksum of an upper-layer message covered by the IPv4 or IPv6 pseudo-header.
///
/// Mixed address families produce a checksum over the payload alone, which
/// never validates; callers only pair addresses taken from the same IP header.
pub fn pseudo_header_checksum(src: IpAddr, dst: IpAddr, protocol: u8, data: &[u8]) -> u16 {
    let mut sum = 0u64;
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum = sum_words(sum, &src.octets());
            sum = sum_words(sum, &dst.octets());
            sum += protocol as u64;
            sum += data.len() as u64 & 0xFFFF;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            sum = sum_words(sum, &src.octets());
            sum = sum_words(sum, &dst.octets());
            let len = data.len() as u32;
            sum += (len >> 16) as u64 + (len & 0xFFFF) as u64;
            sum += protocol as u64;
        }
        _ => {}
    }
    fold(sum_words(sum, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_checksum_rfc1071_example() {
        // RFC 1071 section 3 sample words sum to 0xddf2.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xab]), !0xab00);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut data = vec![0x45, 0x00, 0x00, 0x1c, 0x12, 0x34, 0x00, 0x00, 0x40, 0x11];
        let sum = checksum(&data);
        data.extend_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&data), 0);
    }

    #[test]
    fn test_pseudo_header_includes_addresses() {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let payload = [1, 2, 3, 4];
        assert_ne!(
            pseudo_header_checksum(a, b, 17, &payload),
            pseudo_header_checksum(a, a, 17, &payload)
        );
    }
}
