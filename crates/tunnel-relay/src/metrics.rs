use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Device boundary
    packets_from_device_total: AtomicU64,
    packets_to_device_total: AtomicU64,
    bytes_from_device_total: AtomicU64,
    bytes_to_device_total: AtomicU64,
    parse_drops_total: AtomicU64,
    unsupported_protocol_drops_total: AtomicU64,

    // TCP
    tcp_flows_opened_total: AtomicU64,
    tcp_flows_closed_total: AtomicU64,
    tcp_connect_fail_total: AtomicU64,
    tcp_write_fail_total: AtomicU64,
    tcp_rst_sent_total: AtomicU64,

    // UDP
    udp_flows_opened_total: AtomicU64,
    udp_flows_closed_total: AtomicU64,
    udp_send_fail_total: AtomicU64,
    udp_truncated_total: AtomicU64,

    flows_evicted_total: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_from_device: u64,
    pub packets_to_device: u64,
    pub bytes_from_device: u64,
    pub bytes_to_device: u64,
    pub parse_drops: u64,
    pub unsupported_protocol_drops: u64,
    pub tcp_flows_opened: u64,
    pub tcp_flows_closed: u64,
    pub tcp_connect_failures: u64,
    pub tcp_write_failures: u64,
    pub tcp_rst_sent: u64,
    pub udp_flows_opened: u64,
    pub udp_flows_closed: u64,
    pub udp_send_failures: u64,
    pub udp_truncated: u64,
    pub flows_evicted: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_from_device(&self, bytes: usize) {
        self.inner
            .packets_from_device_total
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_from_device_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_to_device(&self, bytes: usize) {
        self.inner
            .packets_to_device_total
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_to_device_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn parse_dropped(&self) {
        self.inner.parse_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsupported_protocol_dropped(&self) {
        self.inner
            .unsupported_protocol_drops_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_flow_opened(&self) {
        self.inner
            .tcp_flows_opened_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_flow_closed(&self) {
        self.inner
            .tcp_flows_closed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_connect_failed(&self) {
        self.inner
            .tcp_connect_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_write_failed(&self) {
        self.inner
            .tcp_write_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_rst_sent(&self) {
        self.inner.tcp_rst_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_flow_opened(&self) {
        self.inner
            .udp_flows_opened_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_flow_closed(&self) {
        self.inner
            .udp_flows_closed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_send_failed(&self) {
        self.inner
            .udp_send_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_datagram_truncated(&self) {
        self.inner
            .udp_truncated_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_evicted(&self) {
        self.inner
            .flows_evicted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            packets_from_device: i.packets_from_device_total.load(Ordering::Relaxed),
            packets_to_device: i.packets_to_device_total.load(Ordering::Relaxed),
            bytes_from_device: i.bytes_from_device_total.load(Ordering::Relaxed),
            bytes_to_device: i.bytes_to_device_total.load(Ordering::Relaxed),
            parse_drops: i.parse_drops_total.load(Ordering::Relaxed),
            unsupported_protocol_drops: i.unsupported_protocol_drops_total.load(Ordering::Relaxed),
            tcp_flows_opened: i.tcp_flows_opened_total.load(Ordering::Relaxed),
            tcp_flows_closed: i.tcp_flows_closed_total.load(Ordering::Relaxed),
            tcp_connect_failures: i.tcp_connect_fail_total.load(Ordering::Relaxed),
            tcp_write_failures: i.tcp_write_fail_total.load(Ordering::Relaxed),
            tcp_rst_sent: i.tcp_rst_sent_total.load(Ordering::Relaxed),
            udp_flows_opened: i.udp_flows_opened_total.load(Ordering::Relaxed),
            udp_flows_closed: i.udp_flows_closed_total.load(Ordering::Relaxed),
            udp_send_failures: i.udp_send_fail_total.load(Ordering::Relaxed),
            udp_truncated: i.udp_truncated_total.load(Ordering::Relaxed),
            flows_evicted: i.flows_evicted_total.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        push_counter(&mut out, "tunnel_relay_packets_from_device_total", s.packets_from_device);
        push_counter(&mut out, "tunnel_relay_packets_to_device_total", s.packets_to_device);
        push_counter(&mut out, "tunnel_relay_bytes_from_device_total", s.bytes_from_device);
        push_counter(&mut out, "tunnel_relay_bytes_to_device_total", s.bytes_to_device);
        push_counter(&mut out, "tunnel_relay_parse_drops_total", s.parse_drops);
        push_counter(
            &mut out,
            "tunnel_relay_unsupported_protocol_drops_total",
            s.unsupported_protocol_drops,
        );

        push_gauge(
            &mut out,
            "tunnel_relay_tcp_flows_active",
            s.tcp_flows_opened.saturating_sub(s.tcp_flows_closed),
        );
        push_counter(&mut out, "tunnel_relay_tcp_flows_opened_total", s.tcp_flows_opened);
        push_counter(&mut out, "tunnel_relay_tcp_flows_closed_total", s.tcp_flows_closed);
        push_counter(
            &mut out,
            "tunnel_relay_tcp_connect_fail_total",
            s.tcp_connect_failures,
        );
        push_counter(&mut out, "tunnel_relay_tcp_write_fail_total", s.tcp_write_failures);
        push_counter(&mut out, "tunnel_relay_tcp_rst_sent_total", s.tcp_rst_sent);

        push_gauge(
            &mut out,
            "tunnel_relay_udp_flows_active",
            s.udp_flows_opened.saturating_sub(s.udp_flows_closed),
        );
        push_counter(&mut out, "tunnel_relay_udp_flows_opened_total", s.udp_flows_opened);
        push_counter(&mut out, "tunnel_relay_udp_flows_closed_total", s.udp_flows_closed);
        push_counter(&mut out, "tunnel_relay_udp_send_fail_total", s.udp_send_failures);
        push_counter(&mut out, "tunnel_relay_udp_truncated_total", s.udp_truncated);

        push_counter(&mut out, "tunnel_relay_flows_evicted_total", s.flows_evicted);

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "gauge", val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "counter", val);
}

fn push_metric(out: &mut String, name: &str, kind: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(kind);
    out.push('\n');
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}
