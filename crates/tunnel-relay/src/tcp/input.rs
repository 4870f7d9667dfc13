//! Network→device TCP tasks, one set per flow.

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tunnel_packetlib::TcpFlags;

use super::{control_segment, emit, reset_flow};
use crate::relay::Shared;
use crate::tcb::{TcbStatus, TcpFlow};

/// Waits for a pending connect to resolve, then answers the device's SYN.
pub(crate) async fn complete_connect(shared: Arc<Shared>, flow: Arc<TcpFlow>) {
    let Some(socket) = flow.lock().socket.clone() else {
        return;
    };
    let result = tokio::select! {
        _ = flow.cancel_token().cancelled() => return,
        ready = socket.writable() => ready.and_then(|()| connect_result(&socket)),
    };
    drop(socket);

    match result {
        Ok(()) => {
            let segment = {
                let mut tcb = flow.lock();
                if tcb.status != TcbStatus::SynSent {
                    return;
                }
                tcb.status = TcbStatus::SynReceived;
                let segment = control_segment(
                    &shared,
                    &tcb,
                    TcpFlags::SYN | TcpFlags::ACK,
                    tcb.my_seq,
                    tcb.my_ack,
                );
                tcb.my_seq = tcb.my_seq.wrapping_add(1);
                segment
            };
            tracing::debug!(flow = %flow.key(), "connected");
            emit(&shared, segment);
        }
        Err(err) => {
            tracing::warn!(flow = %flow.key(), %err, "connect failed");
            shared.metrics.tcp_connect_failed();
            reset_flow(&shared, &flow, 0);
        }
    }
}

fn connect_result(socket: &TcpStream) -> io::Result<()> {
    match socket.take_error()? {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Drains the server socket into PSH+ACK segments until EOF, error or flow close.
pub(crate) async fn relay_from_network(shared: Arc<Shared>, flow: Arc<TcpFlow>, socket: Arc<TcpStream>) {
    let offset = flow.lock().template.tcp_payload_offset();
    loop {
        let ready = tokio::select! {
            _ = flow.cancel_token().cancelled() => return,
            ready = socket.readable() => ready,
        };
        if let Err(err) = ready {
            network_read_failed(&shared, &flow, err);
            return;
        }

        let mut buf = shared.pool.acquire();
        match socket.try_read(&mut buf.storage_mut()[offset..]) {
            Ok(0) => {
                shared.pool.release(buf);
                network_eof(&shared, &flow);
                return;
            }
            Ok(n) => {
                let built = {
                    let mut tcb = flow.lock();
                    if tcb.status == TcbStatus::Closed {
                        None
                    } else {
                        let built = tcb.template.write_tcp_response(
                            buf.storage_mut(),
                            TcpFlags::PSH | TcpFlags::ACK,
                            tcb.my_seq,
                            tcb.my_ack,
                            n,
                        );
                        if built.is_ok() {
                            tcb.my_seq = tcb.my_seq.wrapping_add(n as u32);
                        }
                        Some(built)
                    }
                };
                match built {
                    Some(Ok(len)) => {
                        buf.set_len(len);
                        shared.send_to_device(buf);
                    }
                    Some(Err(err)) => {
                        tracing::warn!(flow = %flow.key(), %err, "failed to build data segment");
                        shared.pool.release(buf);
                    }
                    None => {
                        shared.pool.release(buf);
                        return;
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                shared.pool.release(buf);
            }
            Err(err) => {
                shared.pool.release(buf);
                network_read_failed(&shared, &flow, err);
                return;
            }
        }
    }
}

fn network_eof(shared: &Shared, flow: &Arc<TcpFlow>) {
    let segment = {
        let mut tcb = flow.lock();
        tcb.awaiting_network_data = false;
        if tcb.status != TcbStatus::CloseWait {
            None
        } else {
            tcb.status = TcbStatus::LastAck;
            let segment = control_segment(
                shared,
                &tcb,
                TcpFlags::FIN | TcpFlags::ACK,
                tcb.my_seq,
                tcb.my_ack,
            );
            tcb.my_seq = tcb.my_seq.wrapping_add(1);
            segment
        }
    };
    tracing::debug!(flow = %flow.key(), fin_sent = segment.is_some(), "network EOF");
    emit(shared, segment);
}

fn network_read_failed(shared: &Shared, flow: &Arc<TcpFlow>, err: io::Error) {
    tracing::warn!(flow = %flow.key(), %err, "network read failed");
    reset_flow(shared, flow, 0);
}
