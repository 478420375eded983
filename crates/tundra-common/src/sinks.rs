//! Ambient per-thread sinks for remote log and profile-event batches
//!
//! Replicas ship their own server logs and profile counters in-band as
//! columnar batches. The thread driving a query registers bounded queues
//! here; dispatch pushes into whatever the current thread has registered.
//! Log pushes are best-effort, profile-event pushes must not be lost.

use crate::{Result, TundraError};
use arrow_array::RecordBatch;
use std::cell::RefCell;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

thread_local! {
    static TEXT_LOG_SINK: RefCell<Option<SyncSender<RecordBatch>>> = const { RefCell::new(None) };
    static PROFILE_EVENTS_SINK: RefCell<Option<SyncSender<RecordBatch>>> = const { RefCell::new(None) };
}

/// Create a bounded sink queue; the receiver side belongs to the consumer.
pub fn sink_channel(capacity: usize) -> (SyncSender<RecordBatch>, Receiver<RecordBatch>) {
    sync_channel(capacity)
}

/// Register (or clear) the current thread's server-log sink.
pub fn set_text_log_sink(sink: Option<SyncSender<RecordBatch>>) {
    TEXT_LOG_SINK.with(|cell| *cell.borrow_mut() = sink);
}

/// Register (or clear) the current thread's profile-events sink.
pub fn set_profile_events_sink(sink: Option<SyncSender<RecordBatch>>) {
    PROFILE_EVENTS_SINK.with(|cell| *cell.borrow_mut() = sink);
}

/// Push a server-log batch to the ambient sink, dropping it when no sink is
/// registered or the queue is full.
pub fn push_text_log(batch: RecordBatch) {
    TEXT_LOG_SINK.with(|cell| {
        if let Some(sink) = cell.borrow().as_ref() {
            if sink.try_send(batch).is_err() {
                tracing::trace!("Dropping remote server log batch, sink unavailable");
            }
        }
    });
}

/// Push a profile-events batch to the ambient sink. Unlike logs, a
/// registered sink that refuses the batch is an error; an absent sink is not.
pub fn push_profile_events(batch: RecordBatch) -> Result<()> {
    PROFILE_EVENTS_SINK.with(|cell| match cell.borrow().as_ref() {
        None => Ok(()),
        Some(sink) => match sink.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => Err(
                TundraError::System("Could not push into profile events queue".to_string()),
            ),
        },
    })
}
