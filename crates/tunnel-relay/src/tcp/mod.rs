//! TCP termination.
//!
//! [`output`] runs the device→network state machine over segments submitted by the device.
//! [`input`] holds the per-flow tasks for the network→device direction: finishing a pending
//! connect and draining the server socket into data segments.

pub(crate) mod input;
pub(crate) mod output;

use std::sync::Arc;

use tunnel_packetlib::TcpFlags;

use crate::buffer::PacketBuf;
use crate::packet::tcp_control_segment;
use crate::relay::Shared;
use crate::tcb::{Tcb, TcpFlow};

/// Builds a payload-less segment addressed with the flow's template.
fn control_segment(shared: &Shared, tcb: &Tcb, flags: TcpFlags, seq: u32, ack: u32) -> Option<PacketBuf> {
    match tcp_control_segment(&shared.pool, &tcb.template, flags, seq, ack) {
        Ok(buf) => Some(buf),
        Err(err) => {
            tracing::warn!(%err, %flags, "failed to build tcp segment");
            None
        }
    }
}

fn emit(shared: &Shared, segment: Option<PacketBuf>) {
    if let Some(buf) = segment {
        shared.send_to_device(buf);
    }
}

/// Removes the flow from the table (if still present) and closes its socket.
fn close_flow(shared: &Shared, flow: &Arc<TcpFlow>) {
    shared.tcp_flows.remove_entry_and_close(&flow.key(), flow);
}

/// Sends RST with seq 0 and ack = my ack + `ack_offset`, then tears the flow down.
fn reset_flow(shared: &Shared, flow: &Arc<TcpFlow>, ack_offset: u32) {
    if !flow.is_closed() {
        let segment = {
            let tcb = flow.lock();
            control_segment(shared, &tcb, TcpFlags::RST, 0, tcb.my_ack.wrapping_add(ack_offset))
        };
        if segment.is_some() {
            shared.metrics.tcp_rst_sent();
        }
        emit(shared, segment);
    }
    close_flow(shared, flow);
}
