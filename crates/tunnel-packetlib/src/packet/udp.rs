use super::checksum::PseudoHeader;
use super::{ensure_len, ensure_out_buf_len, read_u16, PacketError, IPPROTO_UDP};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub const HEADER_LEN: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        let length = read_u16(data, 4);
        if (length as usize) < Self::HEADER_LEN {
            return Err(PacketError::Malformed("UDP length < header length"));
        }
        ensure_len(data, length as usize)?;
        Ok(Self {
            source_port: read_u16(data, 0),
            destination_port: read_u16(data, 2),
            length,
            checksum: read_u16(data, 6),
        })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - Self::HEADER_LEN
    }

    pub fn swap_ports(&mut self) {
        core::mem::swap(&mut self.source_port, &mut self.destination_port);
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        ensure_out_buf_len(out, Self::HEADER_LEN)?;
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        Ok(Self::HEADER_LEN)
    }
}

impl core::fmt::Display for UdpHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "UDP {} -> {} len={}",
            self.source_port, self.destination_port, self.length
        )
    }
}

/// Builds a UDP header in front of a payload that is already in place.
pub struct UdpDatagramBuilder {
    pub src_port: u16,
    pub dst_port: u16,
    /// When `None`, the checksum field is written as zero ("not computed"), which IPv4
    /// receivers accept. IPv6 requires a real checksum.
    pub pseudo: Option<PseudoHeader>,
}

impl UdpDatagramBuilder {
    pub fn write(&self, out: &mut [u8], payload_len: usize) -> Result<usize, PacketError> {
        let len = UdpHeader::HEADER_LEN + payload_len;
        if len > u16::MAX as usize {
            return Err(PacketError::Malformed("UDP length > 65535"));
        }
        ensure_out_buf_len(out, len)?;
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&(len as u16).to_be_bytes());
        out[6..8].copy_from_slice(&0u16.to_be_bytes());
        if let Some(pseudo) = &self.pseudo {
            let mut csum = pseudo.checksum(IPPROTO_UDP, &out[..len]);
            if csum == 0 {
                csum = 0xffff;
            }
            out[6..8].copy_from_slice(&csum.to_be_bytes());
        }
        Ok(len)
    }
}
