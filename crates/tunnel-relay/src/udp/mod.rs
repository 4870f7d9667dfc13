//! UDP relaying.
//!
//! [`output`] forwards device datagrams over one connected socket per flow; [`input`] multiplexes
//! every flow socket and turns received datagrams into device-bound packets.

pub(crate) mod input;
pub(crate) mod output;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::flow_table::FlowEntry;
use crate::metrics::Metrics;
use crate::packet::PacketHeaders;
use crate::tcb::FlowKey;

pub struct UdpFlow {
    key: FlowKey,
    template: PacketHeaders,
    /// Taken on close; in-flight operations hold their own clone until they observe the cancel.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    evicted: AtomicBool,
    created_at: Instant,
    metrics: Metrics,
}

impl UdpFlow {
    pub(crate) fn new(key: FlowKey, template: PacketHeaders, socket: UdpSocket, metrics: Metrics) -> Self {
        Self {
            key,
            template,
            socket: Mutex::new(Some(Arc::new(socket))),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            created_at: Instant::now(),
            metrics,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Device datagram headers with source and destination swapped.
    pub fn template(&self) -> &PacketHeaders {
        &self.template
    }

    /// The flow's socket, or `None` once the flow is closed.
    pub(crate) fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn was_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Debug for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpFlow")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FlowEntry for UdpFlow {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.socket.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.metrics.udp_flow_closed();
        tracing::debug!(flow = %self.key, "udp flow closed");
    }

    fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
        self.metrics.flow_evicted();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_support::udp_packet;
    use std::net::{IpAddr, Ipv4Addr};

    async fn flow(metrics: Metrics) -> UdpFlow {
        let bytes = udp_packet(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            5353,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            53,
            b"q",
        );
        let mut template = PacketHeaders::parse(&bytes).unwrap();
        let key = FlowKey::from_device(&template).unwrap();
        template.swap_source_and_destination();
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        UdpFlow::new(key, template, socket, metrics)
    }

    #[tokio::test]
    async fn close_releases_socket_and_is_idempotent() {
        let metrics = Metrics::new();
        let flow = flow(metrics.clone()).await;
        let held = flow.socket().unwrap();
        assert_eq!(Arc::strong_count(&held), 2);

        flow.close();
        flow.close();
        assert!(flow.is_closed());
        assert!(flow.socket().is_none());
        assert!(flow.cancel_token().is_cancelled());
        assert_eq!(Arc::strong_count(&held), 1);
        assert_eq!(metrics.snapshot().udp_flows_closed, 1);
    }

    #[tokio::test]
    async fn eviction_marks_before_close() {
        let metrics = Metrics::new();
        let flow = flow(metrics.clone()).await;
        flow.mark_evicted();
        flow.close();
        assert!(flow.was_evicted());
        assert_eq!(metrics.snapshot().flows_evicted, 1);
    }
}
