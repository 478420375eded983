//! The remote query driver
//!
//! Owns one conversation with a set of shard/replica endpoints: ships the
//! query (plus scalars and temporary tables), dispatches every inbound
//! packet, survives a duplicate-part retry, and guarantees the wire is
//! drained or torn down before the driver goes away.

use crate::adapt::adapt_batch;
use crate::header::Header;
#[cfg(unix)]
use crate::read_context::ReadContext;
use arrow_array::RecordBatch;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tundra_common::{
    metrics, sinks, ClientInfo, ConnectionTimeouts, PartUuidRegistry, ProfileInfo, Progress,
    QueryId, QueryKind, QueryStage, ReplicaInfo, Result, Settings, TundraError,
};
use tundra_net::{
    build_connection_set, AsyncCallback, Connection, ConnectionFactory, ConnectionSet,
    ExternalTableData, ScanRangeRequest, ScanRangeResponse, ScanRangesAnnouncement, ServerPacket,
};
use uuid::Uuid;

pub type ProgressCallback = Box<dyn Fn(&Progress) + Send + Sync>;
pub type ProfileInfoCallback = Box<dyn Fn(&ProfileInfo) + Send + Sync>;

/// Yields one opaque task payload per replica request; `None` once the task
/// stream is exhausted.
pub type TaskIterator = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// Hands out range assignments for coordinated parallel scans.
pub trait ParallelReadCoordinator: Send + Sync {
    fn handle_range_request(&self, request: ScanRangeRequest) -> Result<ScanRangeResponse>;
    fn handle_ranges_announcement(&self, announcement: ScanRangesAnnouncement) -> Result<()>;
}

/// Optional collaborators for coordinated distributed reads
#[derive(Default)]
pub struct Extension {
    pub task_iterator: Option<TaskIterator>,
    pub coordinator: Option<Arc<dyn ParallelReadCoordinator>>,
    pub replica_info: Option<ReplicaInfo>,
}

/// Everything the driver needs to know about one query, fixed for its
/// lifetime.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub query_id: QueryId,
    pub header: Header,
    pub stage: QueryStage,
    pub scalars: HashMap<String, RecordBatch>,
    pub external_tables: HashMap<String, Vec<RecordBatch>>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, header: Header) -> Self {
        Self {
            query: query.into(),
            query_id: QueryId::new(),
            header,
            stage: QueryStage::Complete,
            scalars: HashMap::new(),
            external_tables: HashMap::new(),
        }
    }

    pub fn with_stage(mut self, stage: QueryStage) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_query_id(mut self, query_id: QueryId) -> Self {
        self.query_id = query_id;
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, batch: RecordBatch) -> Self {
        self.scalars.insert(name.into(), batch);
        self
    }

    pub fn with_external_table(
        mut self,
        name: impl Into<String>,
        batches: Vec<RecordBatch>,
    ) -> Self {
        self.external_tables.insert(name.into(), batches);
        self
    }
}

/// Outcome of one `read` step
#[derive(Debug)]
pub enum ReadResult {
    /// A data block reshaped to the declared header
    Data(RecordBatch),
    /// A coordination message was processed; not data, not the end
    ReplicaToken,
    /// Async only: nothing ready yet, poll this descriptor
    FileDescriptor(i32),
    /// The conversation is over (end-of-stream or cancelled)
    Finished,
    /// A packet was consumed without producing anything for the caller
    Nothing,
}

pub(crate) struct DriverCore {
    query: QueryRequest,
    settings: Arc<Settings>,
    factory: Mutex<ConnectionFactory>,
    connections: RwLock<Option<Arc<ConnectionSet>>>,

    part_uuids: Mutex<Arc<PartUuidRegistry>>,
    task_iterator: Option<TaskIterator>,
    coordinator: Option<Arc<dyn ParallelReadCoordinator>>,
    replica_info: Option<ReplicaInfo>,
    progress_callback: Mutex<Option<ProgressCallback>>,
    profile_info_callback: Mutex<Option<ProfileInfoCallback>>,

    sent_query: AtomicBool,
    /// Set for the duration of the send window; a destructor seeing it must
    /// assume a half-spoken conversation
    established: AtomicBool,
    finished: AtomicBool,
    was_cancelled: AtomicBool,
    got_exception_from_replica: AtomicBool,
    got_unknown_packet_from_replica: AtomicBool,
    got_duplicated_part_uuids: AtomicBool,
    resent_query: AtomicBool,
    recreate_read_context: AtomicBool,

    duplicated_part_uuids: Mutex<Vec<Uuid>>,
    totals: Mutex<Option<RecordBatch>>,
    extremes: Mutex<Option<RecordBatch>>,
    external_tables_data: Mutex<Vec<Vec<Arc<ExternalTableData>>>>,

    /// Held across the whole send window and the cancel transition, so a
    /// Cancel can never interleave the Query/Data send sequence
    was_cancelled_mutex: Mutex<()>,

    #[cfg(unix)]
    read_context: Mutex<Option<Arc<ReadContext>>>,
}

impl DriverCore {
    fn connections(&self) -> Option<Arc<ConnectionSet>> {
        self.connections.read().clone()
    }

    fn connections_required(&self) -> Result<Arc<ConnectionSet>> {
        self.connections()
            .ok_or_else(|| TundraError::Logical("connections are not established".to_string()))
    }

    fn needs_skip_unavailable(&self) -> bool {
        self.settings.skip_unavailable_shards
            && self
                .connections()
                .is_some_and(|set| set.size() == 0)
    }

    pub(crate) fn is_query_pending(&self) -> bool {
        self.sent_query.load(Ordering::Acquire) && !self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn has_thrown_exception(&self) -> bool {
        self.got_exception_from_replica.load(Ordering::Acquire)
            || self.got_unknown_packet_from_replica.load(Ordering::Acquire)
    }

    /// The whole send window: realize connections, then transmit ignored
    /// uuids, the query, scalars, and external tables, in that order and
    /// under the cancel mutex.
    pub(crate) fn send_query_attempt(
        &self,
        kind: QueryKind,
        async_callback: Option<&AsyncCallback>,
    ) -> Result<()> {
        if self.sent_query.load(Ordering::Acquire) {
            return Ok(());
        }

        let set = {
            let mut factory = self.factory.lock();
            Arc::new((*factory)(async_callback)?)
        };
        if let Some(info) = self.replica_info {
            set.set_replica_info(info);
        }
        *self.connections.write() = Some(set.clone());

        if self.needs_skip_unavailable() {
            return Ok(());
        }

        // A cancel may arrive while connections are being created, issued
        // from under the cancel mutex itself. Checking the flag before
        // taking the mutex keeps that path deadlock-free.
        if self.was_cancelled.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.was_cancelled_mutex.lock();

        self.established.store(true, Ordering::Release);

        let timeouts = ConnectionTimeouts::from_settings(&self.settings);
        let client_info = ClientInfo {
            query_kind: kind,
            ..ClientInfo::default()
        };

        {
            let duplicated = self.duplicated_part_uuids.lock();
            if !duplicated.is_empty() {
                set.send_ignored_part_uuids(duplicated.clone())?;
            }
        }

        set.send_query(
            &timeouts,
            &self.query.query,
            &self.query.query_id,
            self.query.stage,
            client_info,
            true,
        )?;

        self.established.store(false, Ordering::Release);
        self.sent_query.store(true, Ordering::Release);

        if self.settings.enable_scalar_subquery_optimization {
            set.send_scalars_data(&self.query.scalars)?;
        }
        self.send_external_tables(&set)?;
        Ok(())
    }

    fn send_external_tables(&self, set: &ConnectionSet) -> Result<()> {
        let count = set.size();
        let limit = (self.settings.max_execution_time_ms > 0)
            .then(|| Duration::from_millis(self.settings.max_execution_time_ms));

        let data = {
            let mut slot = self.external_tables_data.lock();
            slot.clear();
            for _ in 0..count {
                let mut pipes = Vec::with_capacity(self.query.external_tables.len());
                for (name, batches) in &self.query.external_tables {
                    pipes.push(Arc::new(ExternalTableData::new(
                        name.clone(),
                        batches.clone(),
                        limit,
                        self.settings.timeout_overflow_mode,
                    )));
                }
                slot.push(pipes);
            }
            slot.clone()
        };

        set.send_external_tables_data(&data)
    }

    /// Blocking receive used by the read context thread; intentionally does
    /// not touch the cancel mutex.
    pub(crate) fn receive_for_read_context(&self) -> Result<ServerPacket> {
        self.connections_required()?.receive_packet()
    }

    /// One step of the state machine for one inbound packet.
    fn process_packet(&self, packet: ServerPacket) -> Result<ReadResult> {
        match packet {
            ServerPacket::Data(batch) => {
                // Blocks without rows only repeat the stream schema; more
                // packets follow before EndOfStream.
                if batch.num_rows() > 0 && batch.num_columns() > 0 {
                    Ok(ReadResult::Data(adapt_batch(&batch, &self.query.header)?))
                } else {
                    Ok(ReadResult::Nothing)
                }
            }

            ServerPacket::PartUuids(uuids) => {
                if !self.register_part_uuids(&uuids) {
                    self.got_duplicated_part_uuids.store(true, Ordering::Release);
                }
                Ok(ReadResult::Nothing)
            }

            ServerPacket::ReadTaskRequest => {
                self.process_read_task_request()?;
                Ok(ReadResult::Nothing)
            }

            ServerPacket::RangeTaskRequest(request) => {
                self.process_range_request(request)?;
                Ok(ReadResult::ReplicaToken)
            }

            ServerPacket::RangesAnnouncement(announcement) => {
                self.process_ranges_announcement(announcement)?;
                Ok(ReadResult::ReplicaToken)
            }

            ServerPacket::Progress(progress) => {
                if let Some(callback) = self.progress_callback.lock().as_ref() {
                    callback(&progress);
                }
                Ok(ReadResult::Nothing)
            }

            ServerPacket::ProfileInfo(info) => {
                if let Some(callback) = self.profile_info_callback.lock().as_ref() {
                    callback(&info);
                }
                Ok(ReadResult::Nothing)
            }

            ServerPacket::Totals(batch) => {
                *self.totals.lock() = Some(adapt_batch(&batch, &self.query.header)?);
                Ok(ReadResult::Nothing)
            }

            ServerPacket::Extremes(batch) => {
                *self.extremes.lock() = Some(adapt_batch(&batch, &self.query.header)?);
                Ok(ReadResult::Nothing)
            }

            ServerPacket::Log(batch) => {
                sinks::push_text_log(batch);
                Ok(ReadResult::Nothing)
            }

            ServerPacket::ProfileEvents(batch) => {
                sinks::push_profile_events(batch)?;
                Ok(ReadResult::Nothing)
            }

            ServerPacket::Exception(exception) => {
                self.got_exception_from_replica
                    .store(true, Ordering::Release);
                Err(exception.into_error())
            }

            ServerPacket::EndOfStream => {
                let still_active = self
                    .connections()
                    .map(|set| set.has_active_connections())
                    .unwrap_or(false);
                if !still_active {
                    self.finished.store(true, Ordering::Release);
                    Ok(ReadResult::Finished)
                } else {
                    Ok(ReadResult::Nothing)
                }
            }

            ServerPacket::Unknown(tag) => {
                self.got_unknown_packet_from_replica
                    .store(true, Ordering::Release);
                Err(TundraError::UnknownPacket(format!(
                    "packet tag {} from one of the following replicas: {}",
                    tag,
                    self.dump_addresses()
                )))
            }
        }
    }

    /// Returns false when any of the uuids collided query-wide.
    fn register_part_uuids(&self, uuids: &[Uuid]) -> bool {
        let registry = self.part_uuids.lock().clone();
        let collisions = registry.add(uuids);
        if collisions.is_empty() {
            return true;
        }
        self.duplicated_part_uuids.lock().extend(collisions);
        false
    }

    fn process_read_task_request(&self) -> Result<()> {
        let iterator = self.task_iterator.as_ref().ok_or_else(|| {
            TundraError::Logical("distributed task iterator is not initialized".to_string())
        })?;
        metrics::increment(&metrics::READ_TASK_REQUESTS);
        let response = iterator();
        self.connections_required()?.send_read_task_response(response)
    }

    fn process_range_request(&self, request: ScanRangeRequest) -> Result<()> {
        let coordinator = self.coordinator.as_ref().ok_or_else(|| {
            TundraError::Logical(
                "coordinator for parallel reading from replicas is not initialized".to_string(),
            )
        })?;
        metrics::increment(&metrics::RANGE_TASK_REQUESTS);
        let response = coordinator.handle_range_request(request)?;
        self.connections_required()?.send_range_task_response(response)
    }

    fn process_ranges_announcement(&self, announcement: ScanRangesAnnouncement) -> Result<()> {
        let coordinator = self.coordinator.as_ref().ok_or_else(|| {
            TundraError::Logical(
                "coordinator for parallel reading from replicas is not initialized".to_string(),
            )
        })?;
        coordinator.handle_ranges_announcement(announcement)
    }

    /// Idempotent cancel transition; at most one wire-level Cancel.
    fn try_cancel(&self, reason: &str) -> Result<()> {
        let _guard = self.was_cancelled_mutex.lock();

        if self.was_cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(context) = self.read_context.lock().clone() {
            context.cancel();
        }

        // The cancel may race connection creation; only speak on the wire
        // once the query is actually out there.
        if let Some(set) = self.connections() {
            if self.sent_query.load(Ordering::Acquire) {
                set.send_cancel()?;
                tracing::trace!("({}) {}", set.dump_addresses(), reason);
            }
        }
        Ok(())
    }

    fn dump_addresses(&self) -> String {
        self.connections()
            .map(|set| set.dump_addresses())
            .unwrap_or_default()
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.drain_timeout_ms)
    }
}

/// Client-side executor for one remote query.
///
/// One owning thread drives `send_query`/`read`; one other thread may call
/// `cancel` or `finish` concurrently.
pub struct RemoteQueryDriver {
    core: Arc<DriverCore>,
}

impl RemoteQueryDriver {
    pub fn new(
        factory: ConnectionFactory,
        query: QueryRequest,
        settings: Arc<Settings>,
        extension: Option<Extension>,
    ) -> Self {
        let extension = extension.unwrap_or_default();
        Self {
            core: Arc::new(DriverCore {
                query,
                settings,
                factory: Mutex::new(factory),
                connections: RwLock::new(None),
                part_uuids: Mutex::new(Arc::new(PartUuidRegistry::new())),
                task_iterator: extension.task_iterator,
                coordinator: extension.coordinator,
                replica_info: extension.replica_info,
                progress_callback: Mutex::new(None),
                profile_info_callback: Mutex::new(None),
                sent_query: AtomicBool::new(false),
                established: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                was_cancelled: AtomicBool::new(false),
                got_exception_from_replica: AtomicBool::new(false),
                got_unknown_packet_from_replica: AtomicBool::new(false),
                got_duplicated_part_uuids: AtomicBool::new(false),
                resent_query: AtomicBool::new(false),
                recreate_read_context: AtomicBool::new(false),
                duplicated_part_uuids: Mutex::new(Vec::new()),
                totals: Mutex::new(None),
                extremes: Mutex::new(None),
                external_tables_data: Mutex::new(Vec::new()),
                was_cancelled_mutex: Mutex::new(()),
                #[cfg(unix)]
                read_context: Mutex::new(None),
            }),
        }
    }

    /// Drive the query against a fixed replica set (plus hedging backups).
    pub fn with_replicas(
        replicas: Vec<Arc<dyn Connection>>,
        backups: Vec<Arc<dyn Connection>>,
        query: QueryRequest,
        settings: Arc<Settings>,
        extension: Option<Extension>,
    ) -> Self {
        let factory_settings = settings.clone();
        let factory: ConnectionFactory = Box::new(move |_async_callback| {
            Ok(build_connection_set(
                replicas.clone(),
                backups.clone(),
                &factory_settings,
            ))
        });
        Self::new(factory, query, settings, extension)
    }

    /// Drive the query over a single already-established connection.
    pub fn with_connection(
        connection: Arc<dyn Connection>,
        query: QueryRequest,
        settings: Arc<Settings>,
        extension: Option<Extension>,
    ) -> Self {
        Self::with_replicas(vec![connection], Vec::new(), query, settings, extension)
    }

    /// Share a deduplication registry across the executors of one query.
    pub fn set_part_uuid_registry(&self, registry: Arc<PartUuidRegistry>) {
        *self.core.part_uuids.lock() = registry;
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.core.progress_callback.lock() = Some(callback);
    }

    pub fn set_profile_info_callback(&self, callback: ProfileInfoCallback) {
        *self.core.profile_info_callback.lock() = Some(callback);
    }

    /// Transmit the query if it has not been sent yet. No-op otherwise.
    pub fn send_query(&self) -> Result<()> {
        self.core.send_query_attempt(QueryKind::Initial, None)
    }

    pub fn send_query_as(
        &self,
        kind: QueryKind,
        async_callback: Option<&AsyncCallback>,
    ) -> Result<()> {
        self.core.send_query_attempt(kind, async_callback)
    }

    /// Start the send without blocking: `-1` once the query is out,
    /// otherwise a descriptor to poll before calling again.
    #[cfg(unix)]
    pub fn send_query_async(&self) -> Result<i32> {
        let context = {
            let _guard = self.core.was_cancelled_mutex.lock();
            let mut slot = self.core.read_context.lock();
            if slot.is_none() {
                *slot = Some(Arc::new(ReadContext::new(self.core.clone(), true)?));
            }
            slot.clone().unwrap()
        };

        // The sent_query flag alone is not enough here: scalars and
        // external tables may still be going out.
        if context.is_query_sent() {
            return Ok(-1);
        }

        context.resume();

        if !context.is_query_sent() {
            return Ok(context.file_descriptor());
        }
        Ok(-1)
    }

    /// Synchronous read: blocks until data, a coordination token, or the
    /// end of the conversation.
    pub fn read(&self) -> Result<ReadResult> {
        if !self.core.sent_query.load(Ordering::Acquire) {
            self.send_query()?;

            if self.core.needs_skip_unavailable() {
                return Ok(ReadResult::Finished);
            }
        }

        loop {
            let result = {
                let _guard = self.core.was_cancelled_mutex.lock();
                if self.core.was_cancelled.load(Ordering::Acquire) {
                    return Ok(ReadResult::Finished);
                }
                let packet = self.core.connections_required()?.receive_packet()?;
                self.core.process_packet(packet)?
            };

            match result {
                ReadResult::Data(_) | ReadResult::ReplicaToken | ReadResult::Finished => {
                    return Ok(result)
                }
                _ => {}
            }

            if self.core.got_duplicated_part_uuids.load(Ordering::Acquire) {
                return self.restart_without_duplicated_uuids();
            }
        }
    }

    /// Non-blocking read: either a result, or a descriptor to poll while a
    /// packet is still in flight.
    #[cfg(unix)]
    pub fn read_async(&self) -> Result<ReadResult> {
        let context = {
            let _guard = self.core.was_cancelled_mutex.lock();
            let mut slot = self.core.read_context.lock();
            let recreate = self.core.resent_query.load(Ordering::Acquire)
                && self.core.recreate_read_context.swap(false, Ordering::AcqRel);
            if slot.is_none() || recreate {
                *slot = Some(Arc::new(ReadContext::new(self.core.clone(), false)?));
            }
            slot.clone().unwrap()
        };

        loop {
            context.resume();

            if self.core.needs_skip_unavailable() {
                return Ok(ReadResult::Finished);
            }

            if context.is_cancelled() {
                return Ok(ReadResult::Finished);
            }

            if context.is_in_progress() {
                return Ok(ReadResult::FileDescriptor(context.file_descriptor()));
            }

            // A cancel may have stolen the conversation between resume and
            // here; its packet is gone, do not touch it.
            if self.core.was_cancelled.load(Ordering::Acquire) {
                return Ok(ReadResult::Finished);
            }

            let packet = context.take_packet()?;
            let result = self.core.process_packet(packet)?;
            match result {
                ReadResult::Data(_) | ReadResult::ReplicaToken | ReadResult::Finished => {
                    return Ok(result)
                }
                _ => {}
            }

            if self.core.got_duplicated_part_uuids.load(Ordering::Acquire) {
                return self.restart_without_duplicated_uuids();
            }
        }
    }

    #[cfg(not(unix))]
    pub fn read_async(&self) -> Result<ReadResult> {
        self.read()
    }

    /// Convenience: keep reading until a data block arrives. An empty block
    /// means the stream finished without one.
    pub fn read_block(&self) -> Result<RecordBatch> {
        loop {
            match self.read()? {
                ReadResult::Data(batch) => return Ok(batch),
                ReadResult::Finished => {
                    return Ok(RecordBatch::new_empty(self.core.query.header.schema()))
                }
                _ => {}
            }
        }
    }

    /// One retry with the colliding uuids suppressed; a second collision is
    /// fatal.
    fn restart_without_duplicated_uuids(&self) -> Result<ReadResult> {
        self.core
            .try_cancel("Restarting query without duplicated data parts")?;
        if let Some(set) = self.core.connections() {
            set.disconnect();
        }

        if self.core.resent_query.load(Ordering::Acquire) {
            return Err(TundraError::DuplicatedParts(
                "found duplicated part uuids while processing the query".to_string(),
            ));
        }

        tracing::debug!("Found duplicated part uuids, will retry query without those parts");
        self.core.resent_query.store(true, Ordering::Release);
        self.core
            .recreate_read_context
            .store(true, Ordering::Release);
        self.core.sent_query.store(false, Ordering::Release);
        self.core
            .got_duplicated_part_uuids
            .store(false, Ordering::Release);
        // The teardown above cancelled our own conversation; the caller did
        // not ask for it, so the retry starts clean.
        self.core.was_cancelled.store(false, Ordering::Release);

        // The consecutive read re-sends the query implicitly.
        #[cfg(unix)]
        if self.core.read_context.lock().is_some() {
            return self.read_async();
        }
        self.read()
    }

    /// Stop producing: cancel external-table feeds and ask every replica to
    /// abort. Reads return `Finished` from here on.
    pub fn cancel(&self) -> Result<()> {
        {
            let tables = self.core.external_tables_data.lock();
            for pipes in tables.iter() {
                for pipe in pipes {
                    pipe.cancel();
                }
            }
        }

        if !self.core.is_query_pending() || self.core.has_thrown_exception() {
            return Ok(());
        }
        self.core.try_cancel("Cancelling query")
    }

    /// Graceful drain: cancel, then consume the remaining packets so no
    /// replica is left mid-conversation.
    pub fn finish(&self) -> Result<()> {
        if !self.core.is_query_pending() || self.core.has_thrown_exception() {
            return Ok(());
        }

        self.core
            .try_cancel("Cancelling query because enough data has been read")?;

        let Some(set) = self.core.connections() else {
            return Ok(());
        };
        if !self.core.sent_query.load(Ordering::Acquire) {
            return Ok(());
        }

        loop {
            let packet = set.drain(self.core.drain_timeout())?;
            match packet {
                ServerPacket::EndOfStream => {
                    self.core.finished.store(true, Ordering::Release);
                    return Ok(());
                }
                ServerPacket::Log(batch) => sinks::push_text_log(batch),
                ServerPacket::ProfileEvents(batch) => sinks::push_profile_events(batch)?,
                ServerPacket::Exception(exception) => {
                    self.core
                        .got_exception_from_replica
                        .store(true, Ordering::Release);
                    return Err(exception.into_error());
                }
                other => {
                    self.core
                        .got_unknown_packet_from_replica
                        .store(true, Ordering::Release);
                    return Err(TundraError::UnknownPacket(format!(
                        "packet {} while draining replicas: {}",
                        other.kind(),
                        set.dump_addresses()
                    )));
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.core.finished.load(Ordering::Acquire)
    }

    pub fn was_cancelled(&self) -> bool {
        self.core.was_cancelled.load(Ordering::Acquire)
    }

    pub fn was_query_resent(&self) -> bool {
        self.core.resent_query.load(Ordering::Acquire)
    }

    pub fn has_thrown_exception(&self) -> bool {
        self.core.has_thrown_exception()
    }

    /// Totals block, once the stream delivered one, reshaped to the header.
    pub fn totals(&self) -> Option<RecordBatch> {
        self.core.totals.lock().clone()
    }

    /// Extremes block, once the stream delivered one, reshaped to the header.
    pub fn extremes(&self) -> Option<RecordBatch> {
        self.core.extremes.lock().clone()
    }

    pub fn query_id(&self) -> &QueryId {
        &self.core.query.query_id
    }

    pub fn header(&self) -> &Header {
        &self.core.query.header
    }
}

impl Drop for RemoteQueryDriver {
    fn drop(&mut self) {
        // A half-sent or still-speaking conversation left on the wire would
        // desync the replicas; tear it down instead.
        if self.core.established.load(Ordering::Acquire)
            || (self.core.is_query_pending() && self.core.connections().is_some())
        {
            if let Some(set) = self.core.connections() {
                set.disconnect();
            }
        }

        #[cfg(unix)]
        if let Some(context) = self.core.read_context.lock().take() {
            context.cancel();
        }
    }
}
