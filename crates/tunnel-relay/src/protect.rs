//! Hook for keeping relay sockets out of the tunnel they serve.
//!
//! On a host where the TUN device captures all traffic, the relay's own outbound sockets must be
//! exempted (bound to the physical interface, marked, or handed to a platform API) or they would
//! loop back into the device. The relay calls [`SocketProtector::protect`] on every outbound
//! socket before connecting it.

use std::io;

pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &socket2::Socket) -> io::Result<()>;
}

/// Leaves sockets untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: &socket2::Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Sets `SO_MARK` so policy routing can send the socket around the tunnel.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct MarkProtector(pub u32);

#[cfg(target_os = "linux")]
impl SocketProtector for MarkProtector {
    fn protect(&self, socket: &socket2::Socket) -> io::Result<()> {
        socket.set_mark(self.0)
    }
}
