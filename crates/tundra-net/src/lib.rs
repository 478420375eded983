//! Tundra Net - Replica connections and the packet model

pub mod connection;
pub mod connections;
pub mod external;
pub mod hedged;
pub mod local;
pub mod packet;

pub use connection::Connection;
pub use connections::{build_connection_set, AsyncCallback, ConnectionFactory, ConnectionSet};
pub use external::ExternalTableData;
pub use hedged::HedgedConnections;
pub use local::{local_channel, LocalConnection, ServerEnd};
pub use packet::{
    ClientPacket, ScanRange, ScanRangeRequest, ScanRangeResponse, ScanRangesAnnouncement,
    ServerException, ServerPacket,
};
