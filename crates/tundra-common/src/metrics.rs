//! Process-wide driver counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Scan task requests answered on behalf of replicas
pub static READ_TASK_REQUESTS: AtomicU64 = AtomicU64::new(0);

/// Range coordination requests forwarded to the parallel-read coordinator
pub static RANGE_TASK_REQUESTS: AtomicU64 = AtomicU64::new(0);

pub fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn value(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
