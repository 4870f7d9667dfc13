use core::net::Ipv6Addr;

use super::{ensure_len, ensure_out_buf_len, read_u16, PacketError};

/// Fixed IPv6 header. Extension headers are not walked; `next_header` is taken as the
/// transport protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    /// 20-bit flow label.
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
}

impl Ipv6Header {
    pub const HEADER_LEN: usize = 40;

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        let version = data[0] >> 4;
        if version != 6 {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let traffic_class = (data[0] << 4) | (data[1] >> 4);
        let flow_label = ((data[1] as u32 & 0x0f) << 16) | read_u16(data, 2) as u32;
        let payload_len = read_u16(data, 4);
        ensure_len(data, Self::HEADER_LEN + payload_len as usize)?;

        let mut source = [0u8; 16];
        source.copy_from_slice(&data[8..24]);
        let mut destination = [0u8; 16];
        destination.copy_from_slice(&data[24..40]);

        Ok(Self {
            traffic_class,
            flow_label,
            payload_len,
            next_header: data[6],
            hop_limit: data[7],
            source: Ipv6Addr::from(source),
            destination: Ipv6Addr::from(destination),
        })
    }

    pub fn total_len(&self) -> usize {
        Self::HEADER_LEN + self.payload_len as usize
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        self.write_with_payload_len(out, self.payload_len)
    }

    /// Writes the header for a response carrying `transport_len` bytes. IPv6 has no header
    /// checksum, so this only rewrites the payload length.
    pub fn write_response(&self, out: &mut [u8], transport_len: usize) -> Result<usize, PacketError> {
        let payload_len = u16::try_from(transport_len)
            .map_err(|_| PacketError::Malformed("IPv6 payload length > 65535"))?;
        self.write_with_payload_len(out, payload_len)
    }

    fn write_with_payload_len(&self, out: &mut [u8], payload_len: u16) -> Result<usize, PacketError> {
        if self.flow_label > 0x000f_ffff {
            return Err(PacketError::Malformed("IPv6 flow label wider than 20 bits"));
        }
        ensure_out_buf_len(out, Self::HEADER_LEN)?;
        out[0] = (6u8 << 4) | (self.traffic_class >> 4);
        out[1] = (self.traffic_class << 4) | ((self.flow_label >> 16) as u8 & 0x0f);
        out[2..4].copy_from_slice(&(self.flow_label as u16).to_be_bytes());
        out[4..6].copy_from_slice(&payload_len.to_be_bytes());
        out[6] = self.next_header;
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.source.octets());
        out[24..40].copy_from_slice(&self.destination.octets());
        Ok(Self::HEADER_LEN)
    }
}

impl core::fmt::Display for Ipv6Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "IPv6 {} -> {} next={} payload={} hops={}",
            self.source, self.destination, self.next_header, self.payload_len, self.hop_limit
        )
    }
}
