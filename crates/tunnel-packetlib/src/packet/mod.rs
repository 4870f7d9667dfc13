pub mod checksum;
pub mod ip;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("output buffer too small")]
    BufferTooSmall,
}

/// Transport carried by an IP datagram, as far as the relay cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    /// Recognized but not parsed (ICMP and friends). Holds the raw protocol number.
    Other(u8),
}

impl TransportProtocol {
    pub fn from_number(protocol: u8) -> Self {
        match protocol {
            IPPROTO_TCP => Self::Tcp,
            IPPROTO_UDP => Self::Udp,
            other => Self::Other(other),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => IPPROTO_TCP,
            Self::Udp => IPPROTO_UDP,
            Self::Other(n) => n,
        }
    }
}

impl core::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Other(n) => write!(f, "proto-{n}"),
        }
    }
}

#[inline]
pub(crate) fn ensure_len(data: &[u8], len: usize) -> Result<(), PacketError> {
    if data.len() < len {
        return Err(PacketError::Truncated);
    }
    Ok(())
}

#[inline]
pub(crate) fn ensure_out_buf_len(out: &[u8], len: usize) -> Result<(), PacketError> {
    if out.len() < len {
        return Err(PacketError::BufferTooSmall);
    }
    Ok(())
}

#[inline]
pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
