#![forbid(unsafe_code)]

//! Runs the relay against a datagram "device": every datagram received on the bind address is
//! one raw IP packet, and synthesized packets are sent back to the most recent sender. Point a
//! TUN-to-UDP shim at it to relay a real interface.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tunnel_relay::{start_relay, RelayConfig, RelayHandle, SubmitError, BUFFER_SIZE};

const ENV_DEVICE_BIND: &str = "TUNNEL_RELAY_DEVICE_BIND";
const ENV_SOCKET_MARK: &str = "TUNNEL_RELAY_SOCKET_MARK";
const DEFAULT_DEVICE_BIND: &str = "127.0.0.1:7700";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid config: {err:#}");
            return Err(err.into());
        }
    };
    let config = apply_socket_mark(config)?;

    let bind: SocketAddr = std::env::var(ENV_DEVICE_BIND)
        .unwrap_or_else(|_| DEFAULT_DEVICE_BIND.into())
        .parse()
        .with_context(|| format!("invalid value for env var {ENV_DEVICE_BIND}"))?;
    let device = Arc::new(
        UdpSocket::bind(bind)
            .await
            .with_context(|| format!("failed to bind device socket on {bind}"))?,
    );
    tracing::info!("tunnel-relay device socket on udp://{}", device.local_addr()?);

    let relay = start_relay(config).await;
    let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let stop = CancellationToken::new();

    // Crossbeam receivers block, so the device writer gets its own thread.
    let writer = {
        let rx = relay.device_receiver();
        let pool = Arc::clone(relay.pool());
        let device = Arc::clone(&device);
        let peer = Arc::clone(&peer);
        let stop = stop.clone();
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || loop {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(buf) => {
                    let target = *peer.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(target) = target {
                        if let Err(err) = runtime.block_on(device.send_to(buf.as_slice(), target)) {
                            tracing::warn!(%err, "device write failed");
                        }
                    }
                    pool.release(buf);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) if stop.is_cancelled() => break,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        })
    };

    // Best-effort graceful shutdown on Ctrl+C / SIGTERM.
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("shutdown signal received"),
        _ = sigterm => tracing::info!("shutdown signal received"),
        _ = read_device(&relay, &device, &peer) => {},
    }

    relay.shutdown().await;
    stop.cancel();
    if let Err(err) = writer.await {
        tracing::warn!(%err, "device writer failed");
    }
    Ok(())
}

/// Submits every datagram received on the device socket until the relay stops accepting.
async fn read_device(relay: &RelayHandle, device: &UdpSocket, peer: &Mutex<Option<SocketAddr>>) {
    let mut scratch = vec![0u8; BUFFER_SIZE];
    loop {
        let (n, from) = match device.recv_from(&mut scratch).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(%err, "device read failed");
                continue;
            }
        };
        *peer.lock().unwrap_or_else(|p| p.into_inner()) = Some(from);
        match relay.submit_bytes(&scratch[..n]) {
            Ok(()) => {}
            Err(SubmitError::ShuttingDown) => return,
            Err(err) => tracing::debug!(%err, "device packet dropped"),
        }
    }
}

#[cfg(target_os = "linux")]
fn apply_socket_mark(config: RelayConfig) -> anyhow::Result<RelayConfig> {
    match std::env::var(ENV_SOCKET_MARK) {
        Ok(raw) => {
            let mark: u32 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for env var {ENV_SOCKET_MARK}"))?;
            Ok(config.with_protector(Arc::new(tunnel_relay::protect::MarkProtector(mark))))
        }
        Err(_) => Ok(config),
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_socket_mark(config: RelayConfig) -> anyhow::Result<RelayConfig> {
    if std::env::var(ENV_SOCKET_MARK).is_ok() {
        tracing::warn!("{ENV_SOCKET_MARK} is only supported on Linux; ignoring");
    }
    Ok(config)
}
