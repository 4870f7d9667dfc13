//! Wire codec for the IPv4/IPv6, TCP and UDP headers terminated by the tunnel relay.
//!
//! Headers are parsed into plain value structs and serialized back field-for-field at the same
//! offsets, so a parsed device packet can be reused as the addressing template for synthesized
//! responses. The crate is I/O free; buffers are plain byte slices.
#![forbid(unsafe_code)]

pub mod packet;

pub use packet::checksum;
pub use packet::ip::IpHeader;
pub use packet::ipv4::Ipv4Header;
pub use packet::ipv6::Ipv6Header;
pub use packet::tcp::{TcpFlags, TcpHeader, TcpSegmentBuilder};
pub use packet::udp::{UdpDatagramBuilder, UdpHeader};
pub use packet::{PacketError, TransportProtocol};
