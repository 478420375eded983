//! Uniform duplex adapter over one or more replica connections

use crate::connection::Connection;
use crate::external::ExternalTableData;
use crate::hedged::HedgedConnections;
use crate::packet::{ClientPacket, ScanRangeResponse, ServerPacket};
use arrow_array::RecordBatch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tundra_common::{
    ClientInfo, ConnectionTimeouts, QueryId, QueryStage, ReplicaInfo, Result, Settings,
    TundraError,
};
use uuid::Uuid;

/// Callback invoked whenever connection establishment would block, so an
/// async caller can yield to its event loop.
pub type AsyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Lazily realizes the connection set for one query attempt. Called again
/// after a duplicate-uuid retry tears the previous conversation down.
pub type ConnectionFactory =
    Box<dyn FnMut(Option<&AsyncCallback>) -> Result<ConnectionSet> + Send>;

/// How long one replica is polled before the rotation moves on
pub(crate) const ROTATION_POLL: Duration = Duration::from_millis(2);

/// One replica within a set
pub(crate) struct ReplicaSlot {
    pub(crate) conn: Arc<dyn Connection>,
    /// EndOfStream received; the replica is out of the conversation
    pub(crate) done: AtomicBool,
    pub(crate) last_packet_at: Mutex<Instant>,
}

impl ReplicaSlot {
    pub(crate) fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            done: AtomicBool::new(false),
            last_packet_at: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn active(&self) -> bool {
        !self.done.load(Ordering::Acquire) && self.conn.is_connected()
    }
}

/// A fixed group of replicas polled in arrival order
pub struct ReplicaGroup {
    slots: Vec<ReplicaSlot>,
    receive_timeout: Mutex<Duration>,
    replica_info: Mutex<Option<ReplicaInfo>>,
    /// Replica that produced the most recent packet; task responses go here
    current: Mutex<Option<usize>>,
}

impl ReplicaGroup {
    pub fn new(conns: Vec<Arc<dyn Connection>>, settings: &Settings) -> Self {
        Self {
            slots: conns.into_iter().map(ReplicaSlot::new).collect(),
            receive_timeout: Mutex::new(Duration::from_millis(settings.receive_timeout_ms)),
            replica_info: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    fn broadcast(&self, packet: ClientPacket) -> Result<()> {
        for slot in self.slots.iter().filter(|slot| slot.active()) {
            slot.conn.send(packet.clone())?;
        }
        Ok(())
    }

    fn send_to_current(&self, packet: ClientPacket) -> Result<()> {
        let idx = (*self.current.lock()).ok_or_else(|| {
            TundraError::Logical("no replica is awaiting a task response".to_string())
        })?;
        self.slots[idx].conn.send(packet)
    }

    fn receive_packet_by(&self, deadline: Instant) -> Result<ServerPacket> {
        if !self.has_active_connections() {
            return Ok(ServerPacket::EndOfStream);
        }
        loop {
            for (idx, slot) in self.slots.iter().enumerate() {
                if !slot.active() {
                    continue;
                }
                if let Some(packet) = slot.conn.recv_timeout(ROTATION_POLL)? {
                    *slot.last_packet_at.lock() = Instant::now();
                    *self.current.lock() = Some(idx);
                    if matches!(packet, ServerPacket::EndOfStream) {
                        slot.done.store(true, Ordering::Release);
                    }
                    return Ok(packet);
                }
            }
            if Instant::now() > deadline {
                return Err(TundraError::Timeout(format!(
                    "no packet from replicas within the receive timeout: {}",
                    self.dump_addresses()
                )));
            }
        }
    }

    fn has_active_connections(&self) -> bool {
        self.slots.iter().any(|slot| slot.active())
    }

    fn size(&self) -> usize {
        self.slots.len()
    }

    fn disconnect(&self) {
        for slot in &self.slots {
            slot.conn.disconnect();
        }
    }

    fn dump_addresses(&self) -> String {
        self.slots
            .iter()
            .map(|slot| slot.conn.addr().to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// The uniform duplex interface the executor drives.
///
/// Which variant backs a query is a construction-time decision; the
/// executor never inspects it.
pub enum ConnectionSet {
    /// One replica, queried serially
    Single(ReplicaGroup),
    /// N replicas, packets delivered in arrival order
    Multiplexed(ReplicaGroup),
    /// N replicas with backups racing slow primaries
    Hedged(HedgedConnections),
}

/// Pick the variant for this query from settings and available endpoints.
pub fn build_connection_set(
    replicas: Vec<Arc<dyn Connection>>,
    backups: Vec<Arc<dyn Connection>>,
    settings: &Settings,
) -> ConnectionSet {
    if settings.use_hedged_requests {
        return ConnectionSet::Hedged(HedgedConnections::new(replicas, backups, settings));
    }
    if !backups.is_empty() {
        tracing::debug!("Ignoring {} backup replicas, hedged requests are disabled", backups.len());
    }
    if replicas.len() == 1 {
        ConnectionSet::Single(ReplicaGroup::new(replicas, settings))
    } else {
        ConnectionSet::Multiplexed(ReplicaGroup::new(replicas, settings))
    }
}

impl ConnectionSet {
    /// Suppress data parts tagged with these uuids. Must precede the query.
    pub fn send_ignored_part_uuids(&self, uuids: Vec<Uuid>) -> Result<()> {
        self.send_broadcast(ClientPacket::IgnoredPartUuids(uuids))
    }

    pub fn send_query(
        &self,
        timeouts: &ConnectionTimeouts,
        query: &str,
        query_id: &QueryId,
        stage: QueryStage,
        mut client_info: ClientInfo,
        with_pending_data: bool,
    ) -> Result<()> {
        *self.receive_timeout_slot().lock() = timeouts.receive;
        if client_info.replica_info.is_none() {
            client_info.replica_info = *self.replica_info_slot().lock();
        }
        self.send_broadcast(ClientPacket::Query {
            query: query.to_string(),
            query_id: query_id.clone(),
            stage,
            client_info,
            with_pending_data,
        })
    }

    /// Stream scalar subquery results, one named batch per scalar.
    pub fn send_scalars_data(&self, scalars: &HashMap<String, RecordBatch>) -> Result<()> {
        for (name, batch) in scalars {
            self.send_broadcast(ClientPacket::Data {
                table_name: name.clone(),
                batch: batch.clone(),
            })?;
        }
        Ok(())
    }

    /// Feed per-connection temporary table pipes. `tables[i]` belongs to
    /// replica `i`; the outer length must match [`size`](Self::size).
    pub fn send_external_tables_data(
        &self,
        tables: &[Vec<Arc<ExternalTableData>>],
    ) -> Result<()> {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                for (slot, pipes) in group.slots.iter().zip(tables) {
                    if !slot.active() {
                        continue;
                    }
                    for pipe in pipes {
                        while let Some(batch) = pipe.next_batch()? {
                            slot.conn.send(ClientPacket::Data {
                                table_name: pipe.table_name.clone(),
                                batch,
                            })?;
                        }
                    }
                }
                Ok(())
            }
            ConnectionSet::Hedged(hedged) => hedged.send_external_tables_data(tables),
        }
    }

    /// Answer a read-task request on the replica that raised it.
    pub fn send_read_task_response(&self, response: Option<String>) -> Result<()> {
        self.send_current(ClientPacket::ReadTaskResponse(response))
    }

    /// Answer a range coordination request on the replica that raised it.
    pub fn send_range_task_response(&self, response: ScanRangeResponse) -> Result<()> {
        self.send_current(ClientPacket::RangeTaskResponse(response))
    }

    /// Ask every replica still in conversation to abort.
    pub fn send_cancel(&self) -> Result<()> {
        self.send_broadcast(ClientPacket::Cancel)
    }

    /// Blocking receive of one packet, honoring the receive timeout set at
    /// query start.
    pub fn receive_packet(&self) -> Result<ServerPacket> {
        let deadline = Instant::now() + *self.receive_timeout_slot().lock();
        self.receive_packet_by(deadline)
    }

    /// Discard packets until the conversation reaches a terminal or
    /// auxiliary packet the caller must handle.
    pub fn drain(&self, timeout: Duration) -> Result<ServerPacket> {
        let deadline = Instant::now() + timeout;
        loop {
            let packet = self.receive_packet_by(deadline)?;
            match packet {
                ServerPacket::Data(_)
                | ServerPacket::Totals(_)
                | ServerPacket::Extremes(_)
                | ServerPacket::Progress(_)
                | ServerPacket::ProfileInfo(_)
                | ServerPacket::PartUuids(_)
                | ServerPacket::ReadTaskRequest
                | ServerPacket::RangeTaskRequest(_)
                | ServerPacket::RangesAnnouncement(_) => continue,
                ServerPacket::EndOfStream => {
                    if !self.has_active_connections() {
                        return Ok(packet);
                    }
                }
                _ => return Ok(packet),
            }
        }
    }

    pub fn disconnect(&self) {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                group.disconnect()
            }
            ConnectionSet::Hedged(hedged) => hedged.disconnect(),
        }
    }

    /// False once every replica has emitted EndOfStream or dropped.
    pub fn has_active_connections(&self) -> bool {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                group.has_active_connections()
            }
            ConnectionSet::Hedged(hedged) => hedged.has_active_connections(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => group.size(),
            ConnectionSet::Hedged(hedged) => hedged.size(),
        }
    }

    pub fn dump_addresses(&self) -> String {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                group.dump_addresses()
            }
            ConnectionSet::Hedged(hedged) => hedged.dump_addresses(),
        }
    }

    pub fn set_replica_info(&self, info: ReplicaInfo) {
        *self.replica_info_slot().lock() = Some(info);
    }

    fn send_broadcast(&self, packet: ClientPacket) -> Result<()> {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                group.broadcast(packet)
            }
            ConnectionSet::Hedged(hedged) => hedged.broadcast(packet),
        }
    }

    fn send_current(&self, packet: ClientPacket) -> Result<()> {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                group.send_to_current(packet)
            }
            ConnectionSet::Hedged(hedged) => hedged.send_to_current(packet),
        }
    }

    fn receive_packet_by(&self, deadline: Instant) -> Result<ServerPacket> {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                group.receive_packet_by(deadline)
            }
            ConnectionSet::Hedged(hedged) => hedged.receive_packet_by(deadline),
        }
    }

    fn receive_timeout_slot(&self) -> &Mutex<Duration> {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                &group.receive_timeout
            }
            ConnectionSet::Hedged(hedged) => hedged.receive_timeout_slot(),
        }
    }

    fn replica_info_slot(&self) -> &Mutex<Option<ReplicaInfo>> {
        match self {
            ConnectionSet::Single(group) | ConnectionSet::Multiplexed(group) => {
                &group.replica_info
            }
            ConnectionSet::Hedged(hedged) => hedged.replica_info_slot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::local_channel;
    use tundra_common::NodeAddr;

    fn settings() -> Settings {
        Settings {
            receive_timeout_ms: 1_000,
            ..Settings::default()
        }
    }

    #[test]
    fn test_variant_selection() {
        let (c1, _s1) = local_channel(NodeAddr::new("r1", 9000), 4);
        let set =
            build_connection_set(vec![Arc::new(c1) as Arc<dyn Connection>], vec![], &settings());
        assert!(matches!(set, ConnectionSet::Single(_)));
        assert_eq!(set.size(), 1);

        let (c1, _s1) = local_channel(NodeAddr::new("r1", 9000), 4);
        let (c2, _s2) = local_channel(NodeAddr::new("r2", 9000), 4);
        let set = build_connection_set(
            vec![Arc::new(c1) as Arc<dyn Connection>, Arc::new(c2) as _],
            vec![],
            &settings(),
        );
        assert!(matches!(set, ConnectionSet::Multiplexed(_)));
        assert_eq!(set.size(), 2);

        let (c1, _s1) = local_channel(NodeAddr::new("r1", 9000), 4);
        let hedged_settings = Settings {
            use_hedged_requests: true,
            ..settings()
        };
        let set = build_connection_set(
            vec![Arc::new(c1) as Arc<dyn Connection>],
            vec![],
            &hedged_settings,
        );
        assert!(matches!(set, ConnectionSet::Hedged(_)));
    }

    #[test]
    fn test_end_of_stream_retires_replica() {
        let (c1, s1) = local_channel(NodeAddr::new("r1", 9000), 4);
        let (c2, s2) = local_channel(NodeAddr::new("r2", 9000), 4);
        let set = build_connection_set(
            vec![Arc::new(c1) as Arc<dyn Connection>, Arc::new(c2) as _],
            vec![],
            &settings(),
        );

        s1.send(ServerPacket::EndOfStream).unwrap();
        let packet = set.receive_packet().unwrap();
        assert!(matches!(packet, ServerPacket::EndOfStream));
        assert!(set.has_active_connections());

        s2.send(ServerPacket::EndOfStream).unwrap();
        let packet = set.receive_packet().unwrap();
        assert!(matches!(packet, ServerPacket::EndOfStream));
        assert!(!set.has_active_connections());

        // Every replica done: further receives are terminal immediately.
        assert!(matches!(
            set.receive_packet().unwrap(),
            ServerPacket::EndOfStream
        ));
    }

    #[test]
    fn test_drain_discards_data() {
        let (c1, s1) = local_channel(NodeAddr::new("r1", 9000), 8);
        let set =
            build_connection_set(vec![Arc::new(c1) as Arc<dyn Connection>], vec![], &settings());

        s1.send(ServerPacket::Progress(Default::default())).unwrap();
        s1.send(ServerPacket::EndOfStream).unwrap();

        let packet = set.drain(Duration::from_secs(1)).unwrap();
        assert!(matches!(packet, ServerPacket::EndOfStream));
    }

    #[test]
    fn test_dump_addresses() {
        let (c1, _s1) = local_channel(NodeAddr::new("r1", 9000), 4);
        let (c2, _s2) = local_channel(NodeAddr::new("r2", 9001), 4);
        let set = build_connection_set(
            vec![Arc::new(c1) as Arc<dyn Connection>, Arc::new(c2) as _],
            vec![],
            &settings(),
        );
        assert_eq!(set.dump_addresses(), "r1:9000; r2:9001");
    }
}
