//! The duplex transport seam

use crate::packet::{ClientPacket, ServerPacket};
use std::time::Duration;
use tundra_common::{NodeAddr, Result};

/// One duplex conversation with a replica.
///
/// Implementations own the framing and socket plumbing. Every method takes
/// `&self`: a connection must stay sendable (for Cancel) while another
/// thread is blocked inside [`recv`](Connection::recv).
pub trait Connection: Send + Sync {
    fn addr(&self) -> &NodeAddr;

    /// Transmit one packet, blocking until the transport accepts it.
    fn send(&self, packet: ClientPacket) -> Result<()>;

    /// Blocking receive of the next packet.
    fn recv(&self) -> Result<ServerPacket>;

    /// Receive with a deadline; `Ok(None)` when nothing arrived in time.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<ServerPacket>>;

    /// Hard tear-down. Idempotent; pending receives fail promptly.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}
