//! In-process channel transport
//!
//! The reference [`Connection`] implementation: a pair of bounded channels
//! carrying decoded packets. Used for loopback execution and throughout the
//! test suites as the scripted replica side. Channel capacity is real
//! backpressure, so outbound sends genuinely block when the peer lags.

use crate::connection::Connection;
use crate::packet::{ClientPacket, ServerPacket};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tundra_common::{NodeAddr, Result, TundraError};

/// Granularity at which blocking receives observe a disconnect
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Client half of an in-process duplex
pub struct LocalConnection {
    addr: NodeAddr,
    tx: SyncSender<ClientPacket>,
    rx: Mutex<Receiver<ServerPacket>>,
    open: Arc<AtomicBool>,
}

/// Replica half of an in-process duplex
pub struct ServerEnd {
    addr: NodeAddr,
    tx: SyncSender<ServerPacket>,
    rx: Mutex<Receiver<ClientPacket>>,
    open: Arc<AtomicBool>,
}

/// Create a connected pair with the given per-direction channel capacity.
pub fn local_channel(addr: NodeAddr, capacity: usize) -> (LocalConnection, ServerEnd) {
    let (client_tx, server_rx) = sync_channel(capacity);
    let (server_tx, client_rx) = sync_channel(capacity);
    let open = Arc::new(AtomicBool::new(true));

    let client = LocalConnection {
        addr: addr.clone(),
        tx: client_tx,
        rx: Mutex::new(client_rx),
        open: open.clone(),
    };
    let server = ServerEnd {
        addr,
        tx: server_tx,
        rx: Mutex::new(server_rx),
        open,
    };
    (client, server)
}

impl LocalConnection {
    fn recv_step(&self, wait: Duration) -> Result<Option<ServerPacket>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TundraError::Network(format!(
                "connection to {} is closed",
                self.addr
            )));
        }
        match self.rx.lock().recv_timeout(wait) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.open.store(false, Ordering::Release);
                Err(TundraError::Network(format!(
                    "peer {} closed the connection",
                    self.addr
                )))
            }
        }
    }
}

impl Connection for LocalConnection {
    fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    fn send(&self, packet: ClientPacket) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TundraError::Network(format!(
                "connection to {} is closed",
                self.addr
            )));
        }
        self.tx.send(packet).map_err(|e| {
            self.open.store(false, Ordering::Release);
            TundraError::Network(format!("send to {} failed: {}", self.addr, e))
        })
    }

    fn recv(&self) -> Result<ServerPacket> {
        loop {
            if let Some(packet) = self.recv_step(POLL_INTERVAL)? {
                return Ok(packet);
            }
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<ServerPacket>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if let Some(packet) = self.recv_step(remaining.min(POLL_INTERVAL))? {
                return Ok(Some(packet));
            }
        }
    }

    fn disconnect(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl ServerEnd {
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn send(&self, packet: ServerPacket) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TundraError::Network(format!(
                "client of {} disconnected",
                self.addr
            )));
        }
        self.tx.send(packet).map_err(|e| {
            TundraError::Network(format!("send from {} failed: {}", self.addr, e))
        })
    }

    /// Blocking receive of the next client packet.
    pub fn recv(&self) -> Result<ClientPacket> {
        loop {
            if let Some(packet) = self.recv_timeout(POLL_INTERVAL)? {
                return Ok(packet);
            }
            if !self.open.load(Ordering::Acquire) {
                return Err(TundraError::Network(format!(
                    "client of {} disconnected",
                    self.addr
                )));
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ClientPacket>> {
        match self.rx.lock().recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TundraError::Network(format!(
                "client of {} dropped the connection",
                self.addr
            ))),
        }
    }

    /// Close from the replica side; client receives fail promptly.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NodeAddr {
        NodeAddr::new("replica-1", 9000)
    }

    #[test]
    fn test_roundtrip() {
        let (client, server) = local_channel(addr(), 4);
        client.send(ClientPacket::Cancel).unwrap();
        assert!(matches!(server.recv().unwrap(), ClientPacket::Cancel));

        server.send(ServerPacket::EndOfStream).unwrap();
        assert!(matches!(client.recv().unwrap(), ServerPacket::EndOfStream));
    }

    #[test]
    fn test_disconnect_unblocks_recv() {
        let (client, _server) = local_channel(addr(), 4);
        let client = Arc::new(client);
        let reader = {
            let client = client.clone();
            std::thread::spawn(move || client.recv())
        };
        std::thread::sleep(Duration::from_millis(20));
        client.disconnect();
        assert!(reader.join().unwrap().is_err());
    }

    #[test]
    fn test_recv_timeout_expires() {
        let (client, _server) = local_channel(addr(), 4);
        let got = client.recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_server_send_fails_after_disconnect() {
        let (client, server) = local_channel(addr(), 4);
        client.disconnect();
        assert!(server.send(ServerPacket::EndOfStream).is_err());
    }
}
