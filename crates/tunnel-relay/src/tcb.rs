//! Per-flow TCP connection state.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::flow_table::FlowEntry;
use crate::metrics::Metrics;
use crate::packet::PacketHeaders;

/// Identifies one relayed flow: the remote endpoint the device talks to, and the device-side
/// port it talks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub remote: IpAddr,
    pub remote_port: u16,
    pub local_port: u16,
}

impl FlowKey {
    /// Key for a packet as it arrives from the device (destination = remote).
    pub fn from_device(headers: &PacketHeaders) -> Option<Self> {
        let (remote_port, local_port) = if let Some(tcp) = headers.tcp() {
            (tcp.destination_port, tcp.source_port)
        } else if let Some(udp) = headers.udp() {
            (udp.destination_port, udp.source_port)
        } else {
            return None;
        };
        Some(Self {
            remote: headers.ip.destination(),
            remote_port,
            local_port,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote, self.remote_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote_addr(), self.local_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbStatus {
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

impl fmt::Display for TcbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
            Self::Closed => "CLOSED",
        })
    }
}

/// Transmission control block.
///
/// Sequence arithmetic is done on `u32` with wrapping operations, so there is no signedness to
/// widen away.
#[derive(Debug)]
pub struct Tcb {
    /// Next sequence number the relay sends toward the device.
    pub my_seq: u32,
    pub my_seq_initial: u32,
    /// Last sequence number seen from the device.
    pub their_seq: u32,
    pub their_seq_initial: u32,
    /// Acknowledgment the relay sends toward the device.
    pub my_ack: u32,
    /// Last acknowledgment received from the device.
    pub their_ack: u32,
    pub status: TcbStatus,
    pub socket: Option<Arc<TcpStream>>,
    /// Set while a reader task is draining the network socket toward the device.
    pub awaiting_network_data: bool,
    /// Device packet headers with source and destination swapped.
    pub template: PacketHeaders,
    pub created_at: Instant,
    pub evicted: bool,
}

impl Tcb {
    /// State for a flow opened by a device SYN carrying `their_seq` and `their_ack`.
    pub fn new(template: PacketHeaders, my_seq: u32, their_seq: u32, their_ack: u32) -> Self {
        Self {
            my_seq,
            my_seq_initial: my_seq,
            their_seq,
            their_seq_initial: their_seq,
            my_ack: their_seq.wrapping_add(1),
            their_ack,
            status: TcbStatus::Listen,
            socket: None,
            awaiting_network_data: false,
            template,
            created_at: Instant::now(),
            evicted: false,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Display for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seq={} ack={} their_seq={} their_ack={}",
            self.status, self.my_seq, self.my_ack, self.their_seq, self.their_ack
        )
    }
}

/// A TCB as stored in the flow table, plus the token that stops the flow's background tasks.
pub struct TcpFlow {
    key: FlowKey,
    tcb: Mutex<Tcb>,
    cancel: CancellationToken,
    closed: AtomicBool,
    metrics: Metrics,
}

impl TcpFlow {
    pub fn new(key: FlowKey, tcb: Tcb, metrics: Metrics) -> Self {
        Self {
            key,
            tcb: Mutex::new(tcb),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Locks the TCB. Never hold the guard across an `.await` or while calling into a flow table.
    pub fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cancelled once the flow is closed.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TcpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpFlow")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FlowEntry for TcpFlow {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        {
            let mut tcb = self.lock();
            tcb.socket = None;
            tcb.awaiting_network_data = false;
            tcb.status = TcbStatus::Closed;
        }
        self.metrics.tcp_flow_closed();
        tracing::debug!(flow = %self.key, "tcp flow closed");
    }

    fn mark_evicted(&self) {
        self.lock().evicted = true;
        self.metrics.flow_evicted();
    }
}
