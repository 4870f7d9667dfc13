use super::checksum::PseudoHeader;
use super::{ensure_len, ensure_out_buf_len, read_u16, read_u32, PacketError, IPPROTO_TCP};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    const MASK: u8 = 0x3f;

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl core::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const NAMES: [(TcpFlags, &str); 6] = [
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::URG, "URG"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    /// Raw options, `(data_offset - 5) * 4` bytes.
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub const MIN_HEADER_LEN: usize = 20;
    pub const MAX_HEADER_LEN: usize = 60;

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;
        Ok(Self {
            source_port: read_u16(data, 0),
            destination_port: read_u16(data, 2),
            sequence_number: read_u32(data, 4),
            acknowledgment_number: read_u32(data, 8),
            flags: TcpFlags(data[13] & TcpFlags::MASK),
            window: read_u16(data, 14),
            checksum: read_u16(data, 16),
            urgent_pointer: read_u16(data, 18),
            options: data[Self::MIN_HEADER_LEN..header_len].to_vec(),
        })
    }

    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN + self.options.len()
    }

    pub fn data_offset(&self) -> u8 {
        (self.header_len() / 4) as u8
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn is_psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_urg(&self) -> bool {
        self.flags.contains(TcpFlags::URG)
    }

    pub fn swap_ports(&mut self) {
        core::mem::swap(&mut self.source_port, &mut self.destination_port);
    }

    /// Serializes every field as stored, including the checksum and options.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        if self.options.len() % 4 != 0 {
            return Err(PacketError::Malformed("TCP options length not multiple of 4"));
        }
        let header_len = self.header_len();
        if header_len > Self::MAX_HEADER_LEN {
            return Err(PacketError::Malformed("TCP header too large"));
        }
        ensure_out_buf_len(out, header_len)?;
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.acknowledgment_number.to_be_bytes());
        out[12] = self.data_offset() << 4;
        out[13] = self.flags.0 & TcpFlags::MASK;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        out[Self::MIN_HEADER_LEN..header_len].copy_from_slice(&self.options);
        Ok(header_len)
    }
}

impl core::fmt::Display for TcpHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "TCP {} -> {} seq={} ack={} win={} [{}]",
            self.source_port,
            self.destination_port,
            self.sequence_number,
            self.acknowledgment_number,
            self.window,
            self.flags
        )
    }
}

/// Builds a TCP header in front of a payload that is already in place.
///
/// `write` expects the payload at `out[header_len..header_len + payload_len]` and computes the
/// checksum over header and payload, so callers can receive data straight into the final
/// position in the buffer.
pub struct TcpSegmentBuilder<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub urgent_pointer: u16,
    pub options: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    pub fn header_len(&self) -> Result<usize, PacketError> {
        if self.options.len() % 4 != 0 {
            return Err(PacketError::Malformed("TCP options length not multiple of 4"));
        }
        let header_len = TcpHeader::MIN_HEADER_LEN + self.options.len();
        if header_len > TcpHeader::MAX_HEADER_LEN {
            return Err(PacketError::Malformed("TCP header too large"));
        }
        Ok(header_len)
    }

    pub fn write(
        &self,
        pseudo: &PseudoHeader,
        out: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, PacketError> {
        let header_len = self.header_len()?;
        let len = header_len + payload_len;
        ensure_out_buf_len(out, len)?;

        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        out[12] = ((header_len / 4) as u8) << 4;
        out[13] = self.flags.0 & TcpFlags::MASK;
        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[16..18].copy_from_slice(&0u16.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        out[TcpHeader::MIN_HEADER_LEN..header_len].copy_from_slice(self.options);

        // Unlike UDP, TCP has no "checksum disabled" sentinel value; a computed checksum
        // of 0x0000 is valid and must be written as-is.
        let csum = pseudo.checksum(IPPROTO_TCP, &out[..len]);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(len)
    }
}
