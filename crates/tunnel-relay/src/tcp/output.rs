//! Device→network TCP reactor.
//!
//! Consumes device segments one at a time, in submission order, and drives each flow's TCB:
//!
//! | state        | segment      | action                                         | next          |
//! |--------------|--------------|------------------------------------------------|---------------|
//! | (none)       | SYN          | connect; SYN+ACK once connected                | SYN_RECEIVED  |
//! | (none)       | other        | RST                                            | -             |
//! | SYN_SENT     | SYN          | refresh my ack                                 | SYN_SENT      |
//! | other        | SYN          | RST                                            | -             |
//! | any          | RST          | close                                          | -             |
//! | any          | FIN          | half-close; ACK if reader armed, else FIN+ACK  | CLOSE_WAIT / LAST_ACK |
//! | SYN_RECEIVED | ACK          | start reading the server socket                | ESTABLISHED   |
//! | LAST_ACK     | ACK          | close                                          | -             |
//! | other        | ACK+payload  | write to the server socket, ACK                | unchanged     |
//!
//! Segments are assumed to arrive in order; nothing is buffered or reassembled.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tunnel_packetlib::{TcpFlags, TcpHeader};

use super::{close_flow, control_segment, emit, input, reset_flow};
use crate::packet::{Packet, PacketHeaders};
use crate::protect::SocketProtector;
use crate::relay::Shared;
use crate::tcb::{FlowKey, Tcb, TcbStatus, TcpFlow};

/// Initial sequence numbers are drawn from `0..=MAX_ISN`.
const MAX_ISN: u32 = i16::MAX as u32;

pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Packet>) {
    tracing::info!("tcp output reactor started");
    loop {
        let packet = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        process_packet(&shared, &packet).await;
        shared.pool.release(packet.into_buf());
    }
    let closed = shared.tcp_flows.close_all();
    tracing::info!(closed, "tcp output reactor stopped");
}

async fn process_packet(shared: &Arc<Shared>, packet: &Packet) {
    let (Some(tcp), Some(key)) = (packet.headers.tcp(), FlowKey::from_device(&packet.headers)) else {
        return;
    };
    tracing::trace!(flow = %key, flags = %tcp.flags, seq = tcp.sequence_number, "device segment");

    let Some(flow) = shared.tcp_flows.get(&key) else {
        if tcp.is_syn() {
            initialize_connection(shared, key, &packet.headers, tcp);
        } else {
            reject_unknown(shared, key, &packet.headers, tcp);
        }
        return;
    };

    if tcp.is_syn() {
        process_duplicate_syn(shared, &flow, tcp);
    } else if tcp.is_rst() {
        tracing::debug!(flow = %key, "device reset");
        close_flow(shared, &flow);
    } else if tcp.is_fin() {
        process_fin(shared, &flow, tcp);
    } else if tcp.is_ack() {
        process_ack(shared, &flow, tcp, packet.payload()).await;
    }
}

fn initialize_connection(shared: &Arc<Shared>, key: FlowKey, headers: &PacketHeaders, tcp: &TcpHeader) {
    let mut template = headers.clone();
    template.swap_source_and_destination();
    let isn = rand::thread_rng().gen_range(0..=MAX_ISN);
    let tcb = Tcb::new(
        template,
        isn,
        tcp.sequence_number,
        tcp.acknowledgment_number,
    );
    let flow = Arc::new(TcpFlow::new(key, tcb, shared.metrics.clone()));
    shared.metrics.tcp_flow_opened();
    shared.tcp_flows.put(key, Arc::clone(&flow));
    tracing::debug!(flow = %key, isn, "opening tcp flow");

    match connect(shared.protector.as_ref(), key.remote_addr()) {
        Ok((stream, true)) => {
            let segment = {
                let mut tcb = flow.lock();
                tcb.socket = Some(Arc::new(stream));
                tcb.status = TcbStatus::SynReceived;
                let segment = control_segment(
                    shared,
                    &tcb,
                    TcpFlags::SYN | TcpFlags::ACK,
                    tcb.my_seq,
                    tcb.my_ack,
                );
                tcb.my_seq = tcb.my_seq.wrapping_add(1);
                segment
            };
            emit(shared, segment);
        }
        Ok((stream, false)) => {
            {
                let mut tcb = flow.lock();
                tcb.socket = Some(Arc::new(stream));
                tcb.status = TcbStatus::SynSent;
            }
            tokio::spawn(input::complete_connect(Arc::clone(shared), flow));
        }
        Err(err) => {
            tracing::warn!(flow = %key, %err, "connect failed");
            shared.metrics.tcp_connect_failed();
            reset_flow(shared, &flow, 0);
        }
    }
}

/// Opens a non-blocking socket to `remote`. The flag reports whether the connect finished
/// synchronously.
fn connect(protector: &dyn SocketProtector, remote: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    protector.protect(&socket)?;
    let connected = match socket.connect(&SockAddr::from(remote)) {
        Ok(()) => true,
        Err(err) if connect_in_progress(&err) => false,
        Err(err) => return Err(err),
    };
    let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;
    Ok((stream, connected))
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

/// Answers a segment for a flow the relay does not know.
fn reject_unknown(shared: &Shared, key: FlowKey, headers: &PacketHeaders, tcp: &TcpHeader) {
    if tcp.is_rst() {
        return;
    }
    let mut template = headers.clone();
    template.swap_source_and_destination();
    let ack = tcp.sequence_number.wrapping_add(1);
    match crate::packet::tcp_control_segment(&shared.pool, &template, TcpFlags::RST, 0, ack) {
        Ok(buf) => {
            tracing::debug!(flow = %key, flags = %tcp.flags, "segment for unknown flow, sending RST");
            shared.metrics.tcp_rst_sent();
            shared.send_to_device(buf);
        }
        Err(err) => tracing::warn!(flow = %key, %err, "failed to build tcp segment"),
    }
}

fn process_duplicate_syn(shared: &Shared, flow: &Arc<TcpFlow>, tcp: &TcpHeader) {
    {
        let mut tcb = flow.lock();
        if tcb.status == TcbStatus::SynSent {
            tcb.my_ack = tcp.sequence_number.wrapping_add(1);
            return;
        }
    }
    tracing::warn!(flow = %flow.key(), "duplicate SYN, sending RST");
    reset_flow(shared, flow, 1);
}

fn process_fin(shared: &Shared, flow: &Arc<TcpFlow>, tcp: &TcpHeader) {
    let segment = {
        let mut tcb = flow.lock();
        tcb.their_seq = tcp.sequence_number;
        tcb.my_ack = tcp.sequence_number.wrapping_add(1);
        tcb.their_ack = tcp.acknowledgment_number;
        if let Some(socket) = &tcb.socket {
            if let Err(err) = SockRef::from(socket.as_ref()).shutdown(Shutdown::Write) {
                tracing::debug!(flow = %flow.key(), %err, "half-close of network socket failed");
            }
        }
        if tcb.awaiting_network_data {
            tcb.status = TcbStatus::CloseWait;
            control_segment(shared, &tcb, TcpFlags::ACK, tcb.my_seq, tcb.my_ack)
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
    tracing::debug!(flow = %flow.key(), "device FIN");
    emit(shared, segment);
}

async fn process_ack(shared: &Arc<Shared>, flow: &Arc<TcpFlow>, tcp: &TcpHeader, payload: &[u8]) {
    let socket = {
        let mut tcb = flow.lock();
        let status = tcb.status;
        match status {
            TcbStatus::SynReceived => {
                tcb.status = TcbStatus::Established;
                tcb.awaiting_network_data = true;
                if let Some(socket) = tcb.socket.clone() {
                    tokio::spawn(input::relay_from_network(
                        Arc::clone(shared),
                        Arc::clone(flow),
                        socket,
                    ));
                }
            }
            TcbStatus::LastAck => {
                drop(tcb);
                close_flow(shared, flow);
                return;
            }
            _ => {}
        }

        if payload.is_empty() {
            return;
        }

        if !tcb.awaiting_network_data {
            tcb.awaiting_network_data = true;
            if let Some(socket) = tcb.socket.clone() {
                tokio::spawn(input::relay_from_network(
                    Arc::clone(shared),
                    Arc::clone(flow),
                    socket,
                ));
            }
        }

        match tcb.socket.clone() {
            Some(socket) => socket,
            None => return,
        }
    };

    // A server that stops reading must not wedge the reactor past shutdown.
    let written = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        _ = flow.cancel_token().cancelled() => return,
        result = write_all(&socket, payload) => result,
    };
    drop(socket);

    let payload_len = payload.len() as u32;
    match written {
        Ok(()) => {
            let segment = {
                let mut tcb = flow.lock();
                tcb.their_seq = tcp.sequence_number;
                tcb.my_ack = tcp.sequence_number.wrapping_add(payload_len);
                tcb.their_ack = tcp.acknowledgment_number;
                control_segment(shared, &tcb, TcpFlags::ACK, tcb.my_seq, tcb.my_ack)
            };
            emit(shared, segment);
        }
        Err(err) => {
            tracing::warn!(flow = %flow.key(), %err, "network write failed");
            shared.metrics.tcp_write_failed();
            reset_flow(shared, flow, payload_len);
        }
    }
}

async fn write_all(socket: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        socket.writable().await?;
        match socket.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
