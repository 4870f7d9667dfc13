//! Relay lifecycle: spawns the reactors and exposes the device-side ingress and egress.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tunnel_packetlib::{PacketError, TransportProtocol};

use crate::buffer::{BufferPool, PacketBuf};
use crate::config::RelayConfig;
use crate::flow_table::FlowTable;
use crate::metrics::Metrics;
use crate::packet::{Packet, ParseFailure};
use crate::protect::SocketProtector;
use crate::tcb::{FlowKey, TcpFlow};
use crate::udp::UdpFlow;
use crate::{tcp, udp};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("dropping unparsable packet: {0}")]
    Parse(#[from] PacketError),
    #[error("dropping packet with unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("relay is shutting down")]
    ShuttingDown,
}

/// State shared by every reactor task.
pub(crate) struct Shared {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) metrics: Metrics,
    pub(crate) tcp_flows: FlowTable<FlowKey, TcpFlow>,
    pub(crate) udp_flows: FlowTable<FlowKey, UdpFlow>,
    pub(crate) protector: Arc<dyn SocketProtector>,
    pub(crate) shutdown: CancellationToken,
    to_device: crossbeam_channel::Sender<PacketBuf>,
}

impl Shared {
    /// Queues a synthesized packet for the device writer.
    pub(crate) fn send_to_device(&self, buf: PacketBuf) {
        let len = buf.len();
        match self.to_device.send(buf) {
            Ok(()) => self.metrics.packet_to_device(len),
            Err(crossbeam_channel::SendError(buf)) => {
                tracing::trace!("device writer gone, dropping response");
                self.pool.release(buf);
            }
        }
    }
}

/// Running relay. Dropping the handle signals shutdown without waiting for it.
pub struct RelayHandle {
    shared: Arc<Shared>,
    tcp_tx: mpsc::UnboundedSender<Packet>,
    udp_tx: mpsc::UnboundedSender<Packet>,
    to_device_rx: crossbeam_channel::Receiver<PacketBuf>,
    tasks: Vec<JoinHandle<()>>,
}

/// Spawns the TCP and UDP reactors on the current Tokio runtime.
pub async fn start_relay(cfg: RelayConfig) -> RelayHandle {
    let (to_device, to_device_rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(Shared {
        pool: Arc::new(BufferPool::new()),
        metrics: Metrics::new(),
        tcp_flows: FlowTable::new(cfg.max_tcp_flows),
        udp_flows: FlowTable::new(cfg.max_udp_flows),
        protector: cfg.protector,
        shutdown: CancellationToken::new(),
        to_device,
    });

    let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
    let (udp_tx, udp_rx) = mpsc::unbounded_channel();
    let (register_tx, register_rx) = mpsc::unbounded_channel();

    let tasks = vec![
        tokio::spawn(tcp::output::run(Arc::clone(&shared), tcp_rx)),
        tokio::spawn(udp::output::run(Arc::clone(&shared), udp_rx, register_tx)),
        tokio::spawn(udp::input::run(Arc::clone(&shared), register_rx)),
    ];
    tracing::info!(
        max_tcp_flows = cfg.max_tcp_flows.get(),
        max_udp_flows = cfg.max_udp_flows.get(),
        "relay started"
    );

    RelayHandle {
        shared,
        tcp_tx,
        udp_tx,
        to_device_rx,
        tasks,
    }
}

impl RelayHandle {
    /// Hands one device-originated IP packet to the relay.
    ///
    /// The buffer is consumed either way: routed to a reactor on success, returned to the pool on
    /// error.
    pub fn submit(&self, buf: PacketBuf) -> Result<(), SubmitError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            shared.pool.release(buf);
            return Err(SubmitError::ShuttingDown);
        }
        shared.metrics.packet_from_device(buf.len());

        let packet = match Packet::parse(buf) {
            Ok(packet) => packet,
            Err(ParseFailure { error, buf }) => {
                shared.metrics.parse_dropped();
                tracing::debug!(%error, len = buf.len(), "dropping unparsable device packet");
                shared.pool.release(buf);
                return Err(SubmitError::Parse(error));
            }
        };

        let tx = match packet.headers.protocol() {
            TransportProtocol::Tcp => &self.tcp_tx,
            TransportProtocol::Udp => &self.udp_tx,
            TransportProtocol::Other(n) => {
                shared.metrics.unsupported_protocol_dropped();
                tracing::trace!(protocol = n, "dropping device packet");
                shared.pool.release(packet.into_buf());
                return Err(SubmitError::UnsupportedProtocol(n));
            }
        };
        tracing::trace!(%packet, "device packet");
        tx.send(packet).map_err(|mpsc::error::SendError(packet)| {
            shared.pool.release(packet.into_buf());
            SubmitError::ShuttingDown
        })
    }

    /// Copies `bytes` into a pooled buffer and submits it.
    pub fn submit_bytes(&self, bytes: &[u8]) -> Result<(), SubmitError> {
        let mut buf = self.shared.pool.acquire();
        buf.fill_from(bytes);
        self.submit(buf)
    }

    /// Packets destined for the device. Each must be released to [`pool`](Self::pool) once
    /// written.
    pub fn device_receiver(&self) -> crossbeam_channel::Receiver<PacketBuf> {
        self.to_device_rx.clone()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub fn tcp_flows(&self) -> &FlowTable<FlowKey, TcpFlow> {
        &self.shared.tcp_flows
    }

    pub fn udp_flows(&self) -> &FlowTable<FlowKey, UdpFlow> {
        &self.shared.udp_flows
    }

    /// Stops both reactors and waits until every flow has been closed.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(%err, "relay task failed");
            }
        }
        tracing::info!("relay stopped");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
