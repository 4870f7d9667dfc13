//! Device→network UDP reactor.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::UdpFlow;
use crate::packet::Packet;
use crate::protect::SocketProtector;
use crate::relay::Shared;
use crate::tcb::FlowKey;

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    register: mpsc::UnboundedSender<Arc<UdpFlow>>,
) {
    tracing::info!("udp output reactor started");
    loop {
        let packet = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        forward(&shared, &register, &packet).await;
        shared.pool.release(packet.into_buf());
    }
    let closed = shared.udp_flows.close_all();
    tracing::info!(closed, "udp output reactor stopped");
}

async fn forward(shared: &Shared, register: &mpsc::UnboundedSender<Arc<UdpFlow>>, packet: &Packet) {
    let Some(key) = FlowKey::from_device(&packet.headers) else {
        return;
    };

    let flow = match shared.udp_flows.get(&key) {
        Some(flow) => flow,
        None => {
            let socket = match open_socket(shared.protector.as_ref(), key.remote_addr()) {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::warn!(flow = %key, %err, "failed to open udp socket");
                    shared.metrics.udp_send_failed();
                    return;
                }
            };
            let mut template = packet.headers.clone();
            template.swap_source_and_destination();
            let flow = Arc::new(UdpFlow::new(key, template, socket, shared.metrics.clone()));
            shared.metrics.udp_flow_opened();
            shared.udp_flows.put(key, Arc::clone(&flow));
            if register.send(Arc::clone(&flow)).is_err() {
                shared.udp_flows.remove_entry_and_close(&key, &flow);
                return;
            }
            tracing::debug!(flow = %key, "opened udp flow");
            flow
        }
    };

    let Some(socket) = flow.socket() else {
        return;
    };
    let payload = packet.payload();
    let sent = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        _ = flow.cancel_token().cancelled() => return,
        sent = socket.send(payload) => sent,
    };
    drop(socket);
    match sent {
        Ok(n) if n == payload.len() => {}
        Ok(n) => {
            tracing::debug!(flow = %key, sent = n, len = payload.len(), "short udp send");
        }
        Err(err) => {
            tracing::warn!(flow = %key, %err, "udp send failed");
            shared.metrics.udp_send_failed();
            shared.udp_flows.remove_entry_and_close(&key, &flow);
        }
    }
}

fn open_socket(protector: &dyn SocketProtector, remote: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    protector.protect(&socket)?;
    socket.connect(&SockAddr::from(remote))?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}
