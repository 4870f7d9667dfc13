//! User-space TCP/UDP relay for packets captured from a TUN-style device.
//!
//! The device side submits raw IP packets through [`RelayHandle::submit`] and drains synthesized
//! response packets from [`RelayHandle::device_receiver`]. Each device flow is terminated here
//! and re-established over an ordinary OS socket, so the relay only ever emits the handful of
//! segments needed to keep the device's TCP stack happy (SYN+ACK, ACK, PSH+ACK, FIN+ACK, RST).
#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod flow_table;
pub mod metrics;
pub mod packet;
pub mod protect;
mod relay;
pub mod tcb;
mod tcp;
pub mod udp;

pub use buffer::{BufferPool, PacketBuf, BUFFER_SIZE};
pub use config::{ConfigError, RelayConfig};
pub use flow_table::{FlowEntry, FlowTable};
pub use metrics::{Metrics, MetricsSnapshot};
pub use packet::{Packet, PacketHeaders};
pub use protect::{NoopProtector, SocketProtector};
pub use relay::{start_relay, RelayHandle, SubmitError};
pub use tcb::{FlowKey, Tcb, TcbStatus, TcpFlow};
pub use udp::UdpFlow;
