use core::net::IpAddr;

use super::checksum::PseudoHeader;
use super::ipv4::Ipv4Header;
use super::ipv6::Ipv6Header;
use super::{ensure_len, PacketError, TransportProtocol};

/// An IPv4 or IPv6 header. The relay only needs the capabilities common to both, which are
/// exposed here so callers never branch on the version themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    /// Parses the header at the start of `data`, dispatching on the version nibble.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, 1)?;
        match data[0] >> 4 {
            4 => Ipv4Header::parse(data).map(Self::V4),
            6 => Ipv6Header::parse(data).map(Self::V6),
            other => Err(PacketError::UnsupportedVersion(other)),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Self::V4(_) => 4,
            Self::V6(_) => 6,
        }
    }

    /// Length of the header as received, including any IPv4 options.
    pub fn header_len(&self) -> usize {
        match self {
            Self::V4(h) => h.header_len(),
            Self::V6(_) => Ipv6Header::HEADER_LEN,
        }
    }

    /// Length of the option-less header written into synthesized responses.
    pub fn response_header_len(&self) -> usize {
        match self {
            Self::V4(_) => Ipv4Header::MIN_HEADER_LEN,
            Self::V6(_) => Ipv6Header::HEADER_LEN,
        }
    }

    pub fn total_len(&self) -> usize {
        match self {
            Self::V4(h) => h.total_len as usize,
            Self::V6(h) => h.total_len(),
        }
    }

    pub fn protocol_number(&self) -> u8 {
        match self {
            Self::V4(h) => h.protocol,
            Self::V6(h) => h.next_header,
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        TransportProtocol::from_number(self.protocol_number())
    }

    pub fn source(&self) -> IpAddr {
        match self {
            Self::V4(h) => IpAddr::V4(h.source),
            Self::V6(h) => IpAddr::V6(h.source),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self {
            Self::V4(h) => IpAddr::V4(h.destination),
            Self::V6(h) => IpAddr::V6(h.destination),
        }
    }

    pub fn swap_addresses(&mut self) {
        match self {
            Self::V4(h) => core::mem::swap(&mut h.source, &mut h.destination),
            Self::V6(h) => core::mem::swap(&mut h.source, &mut h.destination),
        }
    }

    pub fn pseudo_header(&self) -> PseudoHeader {
        match self {
            Self::V4(h) => PseudoHeader::V4 {
                src: h.source,
                dst: h.destination,
            },
            Self::V6(h) => PseudoHeader::V6 {
                src: h.source,
                dst: h.destination,
            },
        }
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        match self {
            Self::V4(h) => h.write(out),
            Self::V6(h) => h.write(out),
        }
    }

    /// Writes the response header for `transport_len` bytes of TCP/UDP following it.
    pub fn write_response(&self, out: &mut [u8], transport_len: usize) -> Result<usize, PacketError> {
        match self {
            Self::V4(h) => h.write_response(out, transport_len),
            Self::V6(h) => h.write_response(out, transport_len),
        }
    }
}

impl core::fmt::Display for IpHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::V4(h) => h.fmt(f),
            Self::V6(h) => h.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;

    #[test]
    fn dispatches_on_version_nibble() {
        let mut v4 = [0u8; 20];
        v4[0] = 0x45;
        v4[3] = 20;
        v4[9] = 1;
        let header = IpHeader::parse(&v4).unwrap();
        assert_eq!(header.version(), 4);
        assert_eq!(header.protocol(), TransportProtocol::Other(1));

        let mut v6 = [0u8; 40];
        v6[0] = 0x60;
        v6[6] = 6;
        let header = IpHeader::parse(&v6).unwrap();
        assert_eq!(header.version(), 6);
        assert_eq!(header.protocol(), TransportProtocol::Tcp);
        assert_eq!(header.header_len(), 40);
    }

    #[test]
    fn unknown_version_is_a_parse_error() {
        assert_eq!(
            IpHeader::parse(&[0x50; 40]),
            Err(PacketError::UnsupportedVersion(5))
        );
        assert_eq!(IpHeader::parse(&[]), Err(PacketError::Truncated));
    }

    #[test]
    fn swap_addresses_exchanges_source_and_destination() {
        let mut header = IpHeader::V4(Ipv4Header {
            type_of_service: 0,
            total_len: 20,
            identification_flags_fragment: 0,
            ttl: 64,
            protocol: 17,
            header_checksum: 0,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(8, 8, 8, 8),
            options: Vec::new(),
        });
        header.swap_addresses();
        assert_eq!(header.source(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(header.destination(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
