//! Parsed packets and the response builders that turn a device packet into a reply.
//!
//! A [`Packet`] owns its [`PacketBuf`] alongside the headers parsed out of it. Responses are
//! built from a [`PacketHeaders`] template whose addresses and ports have already been swapped,
//! so the template's source is the remote peer and its destination is the device.

use std::ops::Range;

use tunnel_packetlib::{
    IpHeader, Ipv4Header, Ipv6Header, PacketError, TcpFlags, TcpHeader, TcpSegmentBuilder,
    TransportProtocol, UdpDatagramBuilder, UdpHeader,
};

use crate::buffer::{PacketBuf, BUFFER_SIZE};

/// Advertised receive window on every synthesized TCP segment.
pub const TCP_WINDOW: u16 = 65535;

const TCP_OPTION_MSS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    /// Recognized but not decoded; holds the protocol number.
    Other(u8),
}

/// IP header plus the transport header that follows it, and where the payload sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeaders {
    pub ip: IpHeader,
    pub transport: TransportHeader,
    payload: Range<usize>,
}

impl PacketHeaders {
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let ip = IpHeader::parse(data)?;
        let ip_len = ip.header_len();
        let total_len = ip.total_len();
        if total_len < ip_len || total_len > data.len() {
            return Err(PacketError::Malformed("IP total length out of range"));
        }
        let segment = &data[ip_len..total_len];

        let (transport, payload) = match ip.protocol() {
            TransportProtocol::Tcp => {
                let tcp = TcpHeader::parse(segment)?;
                let start = ip_len + tcp.header_len();
                (TransportHeader::Tcp(tcp), start..total_len)
            }
            TransportProtocol::Udp => {
                let udp = UdpHeader::parse(segment)?;
                let start = ip_len + UdpHeader::HEADER_LEN;
                let end = start + udp.payload_len();
                (TransportHeader::Udp(udp), start..end)
            }
            TransportProtocol::Other(n) => (TransportHeader::Other(n), ip_len..total_len),
        };

        Ok(Self {
            ip,
            transport,
            payload,
        })
    }

    pub fn protocol(&self) -> TransportProtocol {
        match &self.transport {
            TransportHeader::Tcp(_) => TransportProtocol::Tcp,
            TransportHeader::Udp(_) => TransportProtocol::Udp,
            TransportHeader::Other(n) => TransportProtocol::Other(*n),
        }
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            TransportHeader::Tcp(h) => Some(h),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            TransportHeader::Udp(h) => Some(h),
            _ => None,
        }
    }

    pub fn payload_range(&self) -> Range<usize> {
        self.payload.clone()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Turns a device packet's headers into a response template.
    pub fn swap_source_and_destination(&mut self) {
        self.ip.swap_addresses();
        match &mut self.transport {
            TransportHeader::Tcp(h) => h.swap_ports(),
            TransportHeader::Udp(h) => h.swap_ports(),
            TransportHeader::Other(_) => {}
        }
    }

    /// Offset at which a TCP response without options carries its payload.
    pub fn tcp_payload_offset(&self) -> usize {
        self.ip.response_header_len() + TcpHeader::MIN_HEADER_LEN
    }

    /// Offset at which a UDP response carries its payload.
    pub fn udp_payload_offset(&self) -> usize {
        self.ip.response_header_len() + UdpHeader::HEADER_LEN
    }

    /// Maximum segment size advertised on SYN responses built from this template.
    ///
    /// Leaves room for the largest IP header of the template's version and a TCP header with a
    /// full 40 bytes of options, so a full-sized device segment always fits one [`PacketBuf`].
    pub fn advertised_mss(&self) -> u16 {
        let max_ip_header = match &self.ip {
            IpHeader::V4(_) => Ipv4Header::MAX_HEADER_LEN,
            IpHeader::V6(_) => Ipv6Header::HEADER_LEN,
        };
        let mss = BUFFER_SIZE.saturating_sub(max_ip_header + TcpHeader::MAX_HEADER_LEN);
        u16::try_from(mss).unwrap_or(u16::MAX)
    }

    /// Writes IP and TCP headers for a response segment in front of `payload_len` bytes that are
    /// already at [`tcp_payload_offset`](Self::tcp_payload_offset). SYN responses carry the MSS
    /// option and must not carry payload.
    pub fn write_tcp_response(
        &self,
        out: &mut [u8],
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        payload_len: usize,
    ) -> Result<usize, PacketError> {
        let tcp = self
            .tcp()
            .ok_or(PacketError::Malformed("template is not TCP"))?;
        let mss = self.advertised_mss().to_be_bytes();
        let mss_option = [TCP_OPTION_MSS, 4, mss[0], mss[1]];
        let options: &[u8] = if flags.contains(TcpFlags::SYN) {
            if payload_len != 0 {
                return Err(PacketError::Malformed("SYN response with payload"));
            }
            &mss_option
        } else {
            &[]
        };

        let ip_len = self.ip.response_header_len();
        if out.len() < ip_len {
            return Err(PacketError::BufferTooSmall);
        }
        let builder = TcpSegmentBuilder {
            src_port: tcp.source_port,
            dst_port: tcp.destination_port,
            seq_number: seq,
            ack_number: ack,
            flags,
            window_size: TCP_WINDOW,
            urgent_pointer: 0,
            options,
        };
        let segment_len = builder.write(&self.ip.pseudo_header(), &mut out[ip_len..], payload_len)?;
        self.ip.write_response(out, segment_len)?;
        Ok(ip_len + segment_len)
    }

    /// Writes IP and UDP headers in front of `payload_len` bytes already at
    /// [`udp_payload_offset`](Self::udp_payload_offset). Over IPv4 the UDP checksum is left as
    /// zero; IPv6 gets a computed one.
    pub fn write_udp_response(&self, out: &mut [u8], payload_len: usize) -> Result<usize, PacketError> {
        let udp = self
            .udp()
            .ok_or(PacketError::Malformed("template is not UDP"))?;
        let ip_len = self.ip.response_header_len();
        if out.len() < ip_len {
            return Err(PacketError::BufferTooSmall);
        }
        let pseudo = match &self.ip {
            IpHeader::V4(_) => None,
            IpHeader::V6(_) => Some(self.ip.pseudo_header()),
        };
        let builder = UdpDatagramBuilder {
            src_port: udp.source_port,
            dst_port: udp.destination_port,
            pseudo,
        };
        let datagram_len = builder.write(&mut out[ip_len..], payload_len)?;
        self.ip.write_response(out, datagram_len)?;
        Ok(ip_len + datagram_len)
    }
}

impl std::fmt::Display for PacketHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.transport {
            TransportHeader::Tcp(h) => write!(f, "{} / {}", self.ip, h),
            TransportHeader::Udp(h) => write!(f, "{} / {}", self.ip, h),
            TransportHeader::Other(n) => write!(f, "{} / proto {}", self.ip, n),
        }
    }
}

/// A parsed packet together with the buffer it was parsed from.
#[derive(Debug)]
pub struct Packet {
    pub headers: PacketHeaders,
    buf: PacketBuf,
}

/// A buffer that failed to parse, handed back so it can be released.
#[derive(Debug)]
pub struct ParseFailure {
    pub error: PacketError,
    pub buf: PacketBuf,
}

impl Packet {
    pub fn parse(buf: PacketBuf) -> Result<Self, ParseFailure> {
        match PacketHeaders::parse(buf.as_slice()) {
            Ok(headers) => Ok(Self { headers, buf }),
            Err(error) => Err(ParseFailure { error, buf }),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_slice()[self.headers.payload_range()]
    }

    pub fn into_parts(self) -> (PacketHeaders, PacketBuf) {
        (self.headers, self.buf)
    }

    pub fn into_buf(self) -> PacketBuf {
        self.buf
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} payload={}", self.headers, self.headers.payload_len())
    }
}

/// Builds a payload-less TCP response into a fresh buffer from the pool.
pub(crate) fn tcp_control_segment(
    pool: &crate::buffer::BufferPool,
    template: &PacketHeaders,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
) -> Result<PacketBuf, PacketError> {
    let mut buf = pool.acquire();
    match template.write_tcp_response(buf.storage_mut(), flags, seq, ack, 0) {
        Ok(len) => {
            buf.set_len(len);
            Ok(buf)
        }
        Err(err) => {
            pool.release(buf);
            Err(err)
        }
    }
}
