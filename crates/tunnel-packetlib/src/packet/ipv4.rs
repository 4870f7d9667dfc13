use core::net::Ipv4Addr;

use super::{checksum, ensure_len, ensure_out_buf_len, read_u16, read_u32, PacketError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub type_of_service: u8,
    pub total_len: u16,
    /// Identification, flags and fragment offset, kept packed.
    pub identification_flags_fragment: u32,
    pub ttl: u8,
    pub protocol: u8,
    pub header_checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Options and padding, carried verbatim (never decoded).
    pub options: Vec<u8>,
}

impl Ipv4Header {
    pub const MIN_HEADER_LEN: usize = 20;
    pub const MAX_HEADER_LEN: usize = 60;

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let ihl = (data[0] & 0x0f) as usize;
        if ihl < 5 {
            return Err(PacketError::Malformed("IPv4 IHL < 5"));
        }
        let header_len = ihl * 4;
        ensure_len(data, header_len)?;

        let total_len = read_u16(data, 2);
        if (total_len as usize) < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(data, total_len as usize)?;

        Ok(Self {
            type_of_service: data[1],
            total_len,
            identification_flags_fragment: read_u32(data, 4),
            ttl: data[8],
            protocol: data[9],
            header_checksum: read_u16(data, 10),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            options: data[Self::MIN_HEADER_LEN..header_len].to_vec(),
        })
    }

    pub fn ihl(&self) -> u8 {
        (self.header_len() / 4) as u8
    }

    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN + self.options.len()
    }

    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    /// Serializes every field as stored, including the checksum and options.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        if self.options.len() % 4 != 0 {
            return Err(PacketError::Malformed("IPv4 options length not multiple of 4"));
        }
        let header_len = self.header_len();
        if header_len > Self::MAX_HEADER_LEN {
            return Err(PacketError::Malformed("IPv4 header too large"));
        }
        ensure_out_buf_len(out, header_len)?;
        self.write_fixed(out, self.ihl(), self.total_len, self.header_checksum);
        out[Self::MIN_HEADER_LEN..header_len].copy_from_slice(&self.options);
        Ok(header_len)
    }

    /// Writes an option-less header for a response carrying `transport_len` bytes and fills in
    /// its checksum. Returns the header length (always 20).
    pub fn write_response(&self, out: &mut [u8], transport_len: usize) -> Result<usize, PacketError> {
        let total_len = Self::MIN_HEADER_LEN + transport_len;
        if total_len > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }
        ensure_out_buf_len(out, Self::MIN_HEADER_LEN)?;
        self.write_fixed(out, 5, total_len as u16, 0);
        let csum = checksum::ipv4_header_checksum(&out[..Self::MIN_HEADER_LEN]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        Ok(Self::MIN_HEADER_LEN)
    }

    /// Recomputes the header checksum over `header_len` bytes already written to `out`.
    pub fn fill_checksum(out: &mut [u8], header_len: usize) -> Result<u16, PacketError> {
        ensure_out_buf_len(out, header_len)?;
        let csum = checksum::ipv4_header_checksum(&out[..header_len]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        Ok(csum)
    }

    fn write_fixed(&self, out: &mut [u8], ihl: u8, total_len: u16, header_checksum: u16) {
        out[0] = (4u8 << 4) | (ihl & 0x0f);
        out[1] = self.type_of_service;
        out[2..4].copy_from_slice(&total_len.to_be_bytes());
        out[4..8].copy_from_slice(&self.identification_flags_fragment.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&header_checksum.to_be_bytes());
        out[12..16].copy_from_slice(&self.source.octets());
        out[16..20].copy_from_slice(&self.destination.octets());
    }
}

impl core::fmt::Display for Ipv4Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "IPv4 {} -> {} proto={} len={} ttl={}",
            self.source, self.destination, self.protocol, self.total_len, self.ttl
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipv4Header {
        Ipv4Header {
            type_of_service: 0,
            total_len: 40,
            identification_flags_fragment: 0x1c46_4000,
            ttl: 64,
            protocol: 6,
            header_checksum: 0,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(93, 184, 216, 34),
            options: Vec::new(),
        }
    }

    #[test]
    fn rejects_short_and_bad_ihl() {
        assert_eq!(Ipv4Header::parse(&[0x45; 10]), Err(PacketError::Truncated));
        let mut buf = [0u8; 20];
        buf[0] = 0x44;
        assert!(matches!(
            Ipv4Header::parse(&buf),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_other_versions() {
        let mut buf = [0u8; 20];
        buf[0] = 0x65;
        assert_eq!(
            Ipv4Header::parse(&buf),
            Err(PacketError::UnsupportedVersion(6))
        );
    }

    #[test]
    fn total_length_must_fit_in_buffer() {
        let mut header = sample();
        header.total_len = 100;
        let mut buf = [0u8; 40];
        header.write(&mut buf).unwrap();
        assert_eq!(Ipv4Header::parse(&buf), Err(PacketError::Truncated));
    }

    #[test]
    fn options_are_skipped_but_preserved() {
        let mut header = sample();
        header.options = vec![0x01, 0x01, 0x01, 0x00];
        header.total_len = 44;
        let mut buf = [0u8; 44];
        assert_eq!(header.write(&mut buf).unwrap(), 24);
        assert_eq!(buf[0], 0x46);
        let parsed = Ipv4Header::parse(&buf).unwrap();
        assert_eq!(parsed.header_len(), 24);
        assert_eq!(parsed.payload_len(), 20);
        assert_eq!(parsed, header);
    }

    #[test]
    fn response_header_drops_options_and_has_valid_checksum() {
        let mut header = sample();
        header.options = vec![0u8; 8];
        let mut buf = [0u8; 20];
        assert_eq!(header.write_response(&mut buf, 24).unwrap(), 20);
        assert_eq!(buf[0], 0x45);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 44);
        assert_eq!(checksum::fold(checksum::add_words(0, &buf)), 0xffff);
    }
}
