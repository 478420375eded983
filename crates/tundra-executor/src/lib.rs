//! Tundra Executor - Client-side driver for distributed queries

pub mod adapt;
pub mod driver;
pub mod header;
#[cfg(unix)]
mod read_context;

pub use adapt::adapt_batch;
pub use driver::{
    Extension, ParallelReadCoordinator, ProfileInfoCallback, ProgressCallback, QueryRequest,
    ReadResult, RemoteQueryDriver, TaskIterator,
};
pub use header::{Header, HeaderColumn};
