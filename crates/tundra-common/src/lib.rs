//! Tundra Common - Shared types, errors, and configuration

pub mod config;
pub mod error;
pub mod metrics;
pub mod part_uuids;
pub mod sinks;
pub mod types;

pub use config::{ConnectionTimeouts, NodeAddr, OverflowMode, Settings};
pub use error::{Result, TundraError};
pub use part_uuids::PartUuidRegistry;
pub use types::{ClientInfo, ProfileInfo, Progress, QueryId, QueryKind, QueryStage, ReplicaInfo};
