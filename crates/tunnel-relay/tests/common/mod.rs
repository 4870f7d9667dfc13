#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tunnel_packetlib::checksum::PseudoHeader;
use tunnel_packetlib::{
    IpHeader, Ipv4Header, Ipv6Header, TcpFlags, TcpHeader, TcpSegmentBuilder, UdpDatagramBuilder, UdpHeader,
};
use tunnel_relay::{PacketHeaders, RelayHandle};

pub const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn ip_header(src: IpAddr, dst: IpAddr, protocol: u8, transport_len: usize) -> IpHeader {
    match (src, dst) {
        (IpAddr::V4(source), IpAddr::V4(destination)) => IpHeader::V4(Ipv4Header {
            type_of_service: 0,
            total_len: (20 + transport_len) as u16,
            identification_flags_fragment: 0x0001_4000,
            ttl: 64,
            protocol,
            header_checksum: 0,
            source,
            destination,
            options: Vec::new(),
        }),
        (IpAddr::V6(source), IpAddr::V6(destination)) => IpHeader::V6(Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_len: transport_len as u16,
            next_header: protocol,
            hop_limit: 64,
            source,
            destination,
        }),
        _ => panic!("mixed address families"),
    }
}

fn pseudo(src: IpAddr, dst: IpAddr) -> PseudoHeader {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => PseudoHeader::V4 { src, dst },
        (IpAddr::V6(src), IpAddr::V6(dst)) => PseudoHeader::V6 { src, dst },
        _ => panic!("mixed address families"),
    }
}

/// Device-side view of a TCP connection to `server`.
#[derive(Debug, Clone, Copy)]
pub struct TcpClient {
    pub addr: IpAddr,
    pub port: u16,
    pub server: SocketAddr,
}

impl TcpClient {
    pub fn new(port: u16, server: SocketAddr) -> Self {
        Self {
            addr: CLIENT,
            port,
            server,
        }
    }

    /// A device at `addr`; must share the server's address family.
    pub fn with_addr(addr: IpAddr, port: u16, server: SocketAddr) -> Self {
        Self { addr, port, server }
    }

    pub fn segment(&self, flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
        let (src, dst) = (self.addr, self.server.ip());
        let ip_len = if src.is_ipv4() { 20 } else { 40 };
        let segment_len = 20 + payload.len();
        let mut out = vec![0u8; ip_len + segment_len];
        out[ip_len + 20..].copy_from_slice(payload);
        TcpSegmentBuilder {
            src_port: self.port,
            dst_port: self.server.port(),
            seq_number: seq,
            ack_number: ack,
            flags,
            window_size: 64240,
            urgent_pointer: 0,
            options: &[],
        }
        .write(&pseudo(src, dst), &mut out[ip_len..], payload.len())
        .unwrap();
        ip_header(src, dst, 6, segment_len)
            .write_response(&mut out, segment_len)
            .unwrap();
        out
    }
}

pub fn udp_datagram(src_port: u16, server: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let (src, dst) = (CLIENT, server.ip());
    let datagram_len = 8 + payload.len();
    let mut out = vec![0u8; 20 + datagram_len];
    out[28..].copy_from_slice(payload);
    UdpDatagramBuilder {
        src_port,
        dst_port: server.port(),
        pseudo: Some(pseudo(src, dst)),
    }
    .write(&mut out[20..], payload.len())
    .unwrap();
    ip_header(src, dst, 17, datagram_len)
        .write_response(&mut out, datagram_len)
        .unwrap();
    out
}

/// A packet the relay queued for the device, copied out of its pooled buffer.
#[derive(Debug)]
pub struct Reply {
    pub bytes: Vec<u8>,
    pub headers: PacketHeaders,
}

impl Reply {
    pub fn tcp(&self) -> &TcpHeader {
        self.headers.tcp().expect("reply is not tcp")
    }

    pub fn udp(&self) -> &UdpHeader {
        self.headers.udp().expect("reply is not udp")
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.headers.payload_range()]
    }

    pub fn source(&self) -> IpAddr {
        self.headers.ip.source()
    }

    pub fn destination(&self) -> IpAddr {
        self.headers.ip.destination()
    }
}

/// Waits for the next device-bound packet and hands its buffer back to the pool.
pub async fn next_reply(relay: &RelayHandle) -> Reply {
    let rx = relay.device_receiver();
    let buf = tokio::task::spawn_blocking(move || rx.recv_timeout(REPLY_TIMEOUT))
        .await
        .unwrap()
        .expect("timed out waiting for a device packet");
    let bytes = buf.as_slice().to_vec();
    relay.pool().release(buf);
    let headers = PacketHeaders::parse(&bytes).expect("relay emitted an unparsable packet");
    Reply { bytes, headers }
}

/// Asserts nothing is queued for the device within a short grace period.
pub async fn assert_no_reply(relay: &RelayHandle) {
    let rx = relay.device_receiver();
    let got = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_millis(200)))
        .await
        .unwrap();
    if let Ok(buf) = got {
        let headers = PacketHeaders::parse(buf.as_slice()).ok();
        panic!("unexpected device packet: {headers:?}");
    }
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(REPLY_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
