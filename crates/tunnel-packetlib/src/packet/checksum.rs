//! RFC 1071 one's-complement checksum helpers shared by the IPv4 header and the TCP/UDP
//! pseudo-header checksums.

use core::net::{Ipv4Addr, Ipv6Addr};

/// Adds every big-endian 16-bit word of `data` to `sum`.
///
/// An odd trailing byte is treated as the high byte of a final word.
pub fn add_words(mut sum: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

/// Folds carries back into the low 16 bits until none remain.
pub fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Folds and complements an accumulated sum into the value written to a header.
pub fn finish(sum: u64) -> u16 {
    !fold(sum)
}

/// Internet checksum of `data` as-is (the checksum field must already be zero).
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(add_words(0, data))
}

/// Checksum of an IPv4 header, ignoring whatever is currently stored at bytes 10..12.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let sum = add_words(0, &header[..10]);
    let sum = add_words(sum, &header[12..]);
    finish(sum)
}

/// Address pair prepended (virtually) to a TCP/UDP segment for checksum purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

impl PseudoHeader {
    /// Partial sum of the pseudo-header for a segment of `segment_len` bytes.
    pub fn sum(&self, protocol: u8, segment_len: usize) -> u64 {
        match self {
            Self::V4 { src, dst } => {
                let sum = add_words(0, &src.octets());
                let sum = add_words(sum, &dst.octets());
                sum + protocol as u64 + (segment_len as u64 & 0xffff)
            }
            Self::V6 { src, dst } => {
                let sum = add_words(0, &src.octets());
                let sum = add_words(sum, &dst.octets());
                let len = segment_len as u32;
                sum + (len >> 16) as u64 + (len & 0xffff) as u64 + protocol as u64
            }
        }
    }

    /// Checksum of `segment` (header and payload, checksum field zeroed) under this
    /// pseudo-header.
    pub fn checksum(&self, protocol: u8, segment: &[u8]) -> u16 {
        finish(add_words(self.sum(protocol, segment.len()), segment))
    }
}

pub fn transport_checksum_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    PseudoHeader::V4 { src, dst }.checksum(protocol, segment)
}

pub fn transport_checksum_ipv6(src: Ipv6Addr, dst: Ipv6Addr, protocol: u8, segment: &[u8]) -> u16 {
    PseudoHeader::V6 { src, dst }.checksum(protocol, segment)
}
