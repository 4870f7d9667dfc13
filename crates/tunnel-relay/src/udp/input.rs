//! Network→device UDP reactor.
//!
//! Every registered flow contributes a stream of received datagrams; the reactor waits on all of
//! them, on new registrations and on shutdown at once, so an idle relay simply sleeps.

use std::io;
use std::sync::Arc;

use futures_util::stream::{self, SelectAll, Stream, StreamExt};
use tokio::sync::mpsc;

use super::UdpFlow;
use crate::buffer::{BufferPool, PacketBuf};
use crate::relay::Shared;

type Received = (Arc<UdpFlow>, io::Result<(PacketBuf, usize)>);

pub(crate) async fn run(shared: Arc<Shared>, mut registrations: mpsc::UnboundedReceiver<Arc<UdpFlow>>) {
    tracing::info!("udp input reactor started");
    let mut flows = SelectAll::new();
    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            flow = registrations.recv() => match flow {
                Some(flow) => flows.push(Box::pin(datagrams(Arc::clone(&shared.pool), flow))),
                None => break,
            },
            Some((flow, received)) = flows.next(), if !flows.is_empty() => {
                deliver(&shared, &flow, received);
            }
        }
    }
    tracing::info!(flows = flows.len(), "udp input reactor stopped");
}

/// Datagrams received on one flow's socket. Ends when the flow is closed or after the first
/// receive error.
fn datagrams(pool: Arc<BufferPool>, flow: Arc<UdpFlow>) -> impl Stream<Item = Received> {
    stream::unfold(Some(flow), move |flow| {
        let pool = Arc::clone(&pool);
        async move {
            let flow = flow?;
            let socket = flow.socket()?;
            let offset = flow.template().udp_payload_offset();
            let mut buf = pool.acquire();
            let received = tokio::select! {
                _ = flow.cancel_token().cancelled() => None,
                received = socket.recv(&mut buf.storage_mut()[offset..]) => Some(received),
            };
            drop(socket);
            match received {
                None => {
                    pool.release(buf);
                    None
                }
                Some(Ok(n)) => Some(((Arc::clone(&flow), Ok((buf, n))), Some(flow))),
                Some(Err(err)) => {
                    pool.release(buf);
                    Some(((flow, Err(err)), None))
                }
            }
        }
    })
}

fn deliver(shared: &Shared, flow: &Arc<UdpFlow>, received: io::Result<(PacketBuf, usize)>) {
    match received {
        Ok((mut buf, n)) => {
            // A datagram that filled the buffer may have lost its tail.
            let room = buf.capacity() - flow.template().udp_payload_offset();
            if n >= room {
                tracing::debug!(flow = %flow.key(), len = n, "udp datagram truncated to buffer");
                shared.metrics.udp_datagram_truncated();
            }
            match flow.template().write_udp_response(buf.storage_mut(), n) {
                Ok(len) => {
                    buf.set_len(len);
                    shared.send_to_device(buf);
                }
                Err(err) => {
                    tracing::warn!(flow = %flow.key(), %err, "failed to build udp response");
                    shared.pool.release(buf);
                }
            }
        }
        Err(err) => {
            tracing::warn!(flow = %flow.key(), %err, "udp receive failed");
            shared.udp_flows.remove_entry_and_close(&flow.key(), flow);
        }
    }
}
