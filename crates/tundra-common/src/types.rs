//! Tundra core types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique query identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query_{}", self.0)
    }
}

impl From<Uuid> for QueryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// How far the remote side should process the query before shipping results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    /// Ship raw columns, all processing happens on the initiator
    FetchColumns,
    /// Ship partially-aggregated state suitable for a final merge
    WithMergeableState,
    /// Ship fully-processed results
    #[default]
    Complete,
}

/// Whether this query originates from a client or from another server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    #[default]
    Initial,
    Secondary,
}

/// Slot of this driver within a parallel replica group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub all_replicas_count: usize,
    pub replica_number: usize,
}

/// Identity sent alongside the query packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_name: String,
    pub query_kind: QueryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_info: Option<ReplicaInfo>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            client_name: "tundra".to_string(),
            query_kind: QueryKind::Initial,
            replica_info: None,
        }
    }
}

/// Execution progress reported by a replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub read_rows: u64,
    pub read_bytes: u64,
    pub total_rows_to_read: u64,
}

impl Progress {
    pub fn new(read_rows: u64, read_bytes: u64, total_rows_to_read: u64) -> Self {
        Self {
            read_rows,
            read_bytes,
            total_rows_to_read,
        }
    }

    /// Fold another progress report into this one. Totals are announced
    /// once per replica, so they accumulate as well.
    pub fn add(&mut self, other: &Progress) {
        self.read_rows += other.read_rows;
        self.read_bytes += other.read_bytes;
        self.total_rows_to_read += other.total_rows_to_read;
    }
}

/// Stream-level statistics reported by a replica at completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
}
