//! Best-effort UDP heartbeat.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

pub const DEFAULT_HEARTBEAT_ADDR: &str = "100.64.0.3:5005";
const PAYLOAD: &[u8] = b"ping";

/// Sends a fixed datagram to a monitor. Failures are traced and otherwise ignored, so a
/// missing monitor never affects training.
#[derive(Debug)]
pub struct Heartbeat {
    target: Option<(UdpSocket, SocketAddr)>,
}

impl Heartbeat {
    /// Heartbeat to `addr`, or a silent one if the address or socket cannot be set up.
    pub fn new(addr: &str) -> Self {
        let target = Self::open(addr);
        if target.is_none() {
            tracing::debug!(addr, "heartbeat disabled");
        }
        Self { target }
    }

    pub const fn disabled() -> Self {
        Self { target: None }
    }

    /// Heartbeat for an optional address; `None` disables it.
    pub fn from_config(addr: Option<&str>) -> Self {
        addr.map_or_else(Self::disabled, Self::new)
    }

    fn open(addr: &str) -> Option<(UdpSocket, SocketAddr)> {
        let addr = addr.to_socket_addrs().ok()?.next()?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).ok()?;
        socket.set_nonblocking(true).ok()?;
        Some((socket, addr))
    }

    pub const fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub fn ping(&self) {
        if let Some((socket, addr)) = &self.target {
            if let Err(err) = socket.send_to(PAYLOAD, addr) {
                tracing::trace!(%addr, error = %err, "heartbeat not delivered");
            }
        }
    }

    pub fn burst(&self, count: usize) {
        for _ in 0..count {
            self.ping();
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_ADDR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_ping_payload() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap().to_string();

        let heartbeat = Heartbeat::new(&addr);
        assert!(heartbeat.is_enabled());
        heartbeat.ping();

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
    }

    #[test]
    fn bad_address_is_silent() {
        let heartbeat = Heartbeat::new("not an address");
        assert!(!heartbeat.is_enabled());
        heartbeat.burst(3);
        Heartbeat::from_config(None).ping();
    }

    #[test]
    fn undeliverable_ping_is_not_fatal() {
        // Port zero cannot be a datagram destination.
        let heartbeat = Heartbeat::new("127.0.0.1:0");
        assert!(heartbeat.is_enabled());
        heartbeat.ping();
        heartbeat.burst(2);
    }
}
