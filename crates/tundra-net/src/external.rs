//! Cancellable pipes feeding temporary tables to replicas

use arrow_array::RecordBatch;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tundra_common::{OverflowMode, Result, TundraError};

/// One temporary table queued for one replica connection.
///
/// The feeder drains batches until the pipe is exhausted, cancelled, or its
/// execution deadline passes. Cancellation is observed between batches, so
/// a cancel issued mid-stream stops the feed at the next pull.
pub struct ExternalTableData {
    pub table_name: String,
    batches: Mutex<VecDeque<RecordBatch>>,
    is_cancelled: AtomicBool,
    deadline: Option<Instant>,
    overflow_mode: OverflowMode,
}

impl ExternalTableData {
    pub fn new(
        table_name: impl Into<String>,
        batches: Vec<RecordBatch>,
        max_execution_time: Option<Duration>,
        overflow_mode: OverflowMode,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            batches: Mutex::new(batches.into()),
            is_cancelled: AtomicBool::new(false),
            deadline: max_execution_time.map(|limit| Instant::now() + limit),
            overflow_mode,
        }
    }

    /// Pull the next batch; `Ok(None)` ends the feed.
    pub fn next_batch(&self) -> Result<Option<RecordBatch>> {
        if self.is_cancelled.load(Ordering::Acquire) {
            return Ok(None);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return match self.overflow_mode {
                    OverflowMode::Throw => Err(TundraError::Timeout(format!(
                        "sending external table '{}' exceeded the execution deadline",
                        self.table_name
                    ))),
                    OverflowMode::Break => Ok(None),
                };
            }
        }
        Ok(self.batches.lock().pop_front())
    }

    /// Stop the feed; the next pull returns `None`.
    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }
}
