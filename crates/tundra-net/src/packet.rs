//! Packet model for the replica protocol
//!
//! The wire framing lives behind the [`Connection`](crate::Connection)
//! trait; these enums are the decoded form the driver works with.

use arrow_array::RecordBatch;
use serde::{Deserialize, Serialize};
use tundra_common::{ClientInfo, ProfileInfo, Progress, QueryId, QueryStage, TundraError};
use uuid::Uuid;

/// An exception raised on a replica and forwarded in-band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerException {
    pub code: i32,
    pub message: String,
}

impl ServerException {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn into_error(self) -> TundraError {
        TundraError::Remote {
            code: self.code,
            message: self.message,
        }
    }
}

/// A contiguous span of data within one storage part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    pub part: String,
    pub begin: u64,
    pub end: u64,
}

/// A replica asking the coordinator for its next slice of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRangeRequest {
    pub replica_number: usize,
    pub min_ranges: usize,
}

/// The coordinator's answer to a [`ScanRangeRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRangeResponse {
    pub replica_number: usize,
    pub ranges: Vec<ScanRange>,
    pub finished: bool,
}

/// A replica announcing every range it could serve, sent once up front
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRangesAnnouncement {
    pub replica_number: usize,
    pub ranges: Vec<ScanRange>,
}

/// One decoded packet received from a replica
#[derive(Debug, Clone)]
pub enum ServerPacket {
    Data(RecordBatch),
    Totals(RecordBatch),
    Extremes(RecordBatch),
    Exception(ServerException),
    Progress(Progress),
    ProfileInfo(ProfileInfo),
    ProfileEvents(RecordBatch),
    Log(RecordBatch),
    EndOfStream,
    PartUuids(Vec<Uuid>),
    ReadTaskRequest,
    RangeTaskRequest(ScanRangeRequest),
    RangesAnnouncement(ScanRangesAnnouncement),
    /// A tag the transport could not decode; always a fatal fault upstream
    Unknown(u8),
}

impl ServerPacket {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerPacket::Data(_) => "Data",
            ServerPacket::Totals(_) => "Totals",
            ServerPacket::Extremes(_) => "Extremes",
            ServerPacket::Exception(_) => "Exception",
            ServerPacket::Progress(_) => "Progress",
            ServerPacket::ProfileInfo(_) => "ProfileInfo",
            ServerPacket::ProfileEvents(_) => "ProfileEvents",
            ServerPacket::Log(_) => "Log",
            ServerPacket::EndOfStream => "EndOfStream",
            ServerPacket::PartUuids(_) => "PartUuids",
            ServerPacket::ReadTaskRequest => "ReadTaskRequest",
            ServerPacket::RangeTaskRequest(_) => "RangeTaskRequest",
            ServerPacket::RangesAnnouncement(_) => "RangesAnnouncement",
            ServerPacket::Unknown(_) => "Unknown",
        }
    }
}

/// One packet sent to a replica
#[derive(Debug, Clone)]
pub enum ClientPacket {
    /// Suppress data parts tagged with these uuids; must precede Query
    IgnoredPartUuids(Vec<Uuid>),
    Query {
        query: String,
        query_id: QueryId,
        stage: QueryStage,
        client_info: ClientInfo,
        /// Scalar or external-table Data packets follow the query
        with_pending_data: bool,
    },
    /// Scalar results and external-table batches, keyed by table name
    Data {
        table_name: String,
        batch: RecordBatch,
    },
    Cancel,
    /// Answer to a ReadTaskRequest; `None` when the task stream is exhausted
    ReadTaskResponse(Option<String>),
    RangeTaskResponse(ScanRangeResponse),
}

impl ClientPacket {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientPacket::IgnoredPartUuids(_) => "IgnoredPartUuids",
            ClientPacket::Query { .. } => "Query",
            ClientPacket::Data { .. } => "Data",
            ClientPacket::Cancel => "Cancel",
            ClientPacket::ReadTaskResponse(_) => "ReadTaskResponse",
            ClientPacket::RangeTaskResponse(_) => "RangeTaskResponse",
        }
    }
}
