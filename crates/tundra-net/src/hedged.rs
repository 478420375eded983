//! Hedged replica connections
//!
//! Same duplex surface as the multiplexed group, with one addition: every
//! outbound packet is journaled, and when a primary goes silent past the
//! failover timeout a backup replica is brought into the conversation by
//! replaying the journal to it. The stalled primary is disconnected.

use crate::connection::Connection;
use crate::connections::{ReplicaSlot, ROTATION_POLL};
use crate::external::ExternalTableData;
use crate::packet::{ClientPacket, ServerPacket};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tundra_common::{ReplicaInfo, Result, Settings, TundraError};

pub struct HedgedConnections {
    slots: Mutex<Vec<ReplicaSlot>>,
    backups: Mutex<Vec<Arc<dyn Connection>>>,
    /// Outbound conversation so far; replayed to a promoted backup
    journal: Mutex<Vec<ClientPacket>>,
    receive_timeout: Mutex<Duration>,
    failover_timeout: Duration,
    replica_info: Mutex<Option<ReplicaInfo>>,
    current: Mutex<Option<usize>>,
}

impl HedgedConnections {
    pub fn new(
        replicas: Vec<Arc<dyn Connection>>,
        backups: Vec<Arc<dyn Connection>>,
        settings: &Settings,
    ) -> Self {
        Self {
            slots: Mutex::new(replicas.into_iter().map(ReplicaSlot::new).collect()),
            backups: Mutex::new(backups),
            journal: Mutex::new(Vec::new()),
            receive_timeout: Mutex::new(Duration::from_millis(settings.receive_timeout_ms)),
            failover_timeout: Duration::from_millis(settings.hedged_failover_timeout_ms),
            replica_info: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub(crate) fn broadcast(&self, packet: ClientPacket) -> Result<()> {
        if !matches!(packet, ClientPacket::Cancel) {
            self.journal.lock().push(packet.clone());
        }
        for slot in self.slots.lock().iter().filter(|slot| slot.active()) {
            slot.conn.send(packet.clone())?;
        }
        Ok(())
    }

    pub(crate) fn send_to_current(&self, packet: ClientPacket) -> Result<()> {
        let idx = (*self.current.lock()).ok_or_else(|| {
            TundraError::Logical("no replica is awaiting a task response".to_string())
        })?;
        let slots = self.slots.lock();
        slots[idx].conn.send(packet)
    }

    pub(crate) fn send_external_tables_data(
        &self,
        tables: &[Vec<Arc<ExternalTableData>>],
    ) -> Result<()> {
        let slots = self.slots.lock();
        for (idx, (slot, pipes)) in slots.iter().zip(tables).enumerate() {
            if !slot.active() {
                continue;
            }
            for pipe in pipes {
                while let Some(batch) = pipe.next_batch()? {
                    let packet = ClientPacket::Data {
                        table_name: pipe.table_name.clone(),
                        batch,
                    };
                    // The first connection's feed is the canonical replay copy.
                    if idx == 0 {
                        self.journal.lock().push(packet.clone());
                    }
                    slot.conn.send(packet)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn receive_packet_by(&self, deadline: Instant) -> Result<ServerPacket> {
        loop {
            if !self.has_active_connections() {
                return Ok(ServerPacket::EndOfStream);
            }
            {
                let slots = self.slots.lock();
                for (idx, slot) in slots.iter().enumerate() {
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
            }
            self.promote_stalled();
            if Instant::now() > deadline {
                return Err(TundraError::Timeout(format!(
                    "no packet from replicas within the receive timeout: {}",
                    self.dump_addresses()
                )));
            }
        }
    }

    /// Swap in a backup for every primary that has gone silent too long.
    fn promote_stalled(&self) {
        let mut slots = self.slots.lock();
        for idx in 0..slots.len() {
            if !slots[idx].active() {
                continue;
            }
            if slots[idx].last_packet_at.lock().elapsed() < self.failover_timeout {
                continue;
            }
            let Some(backup) = self.backups.lock().pop() else {
                return;
            };
            tracing::debug!(
                "Replica {} stalled, promoting backup {}",
                slots[idx].conn.addr(),
                backup.addr()
            );
            if let Err(e) = self.replay_journal(backup.as_ref()) {
                tracing::warn!("Backup {} failed during replay: {}", backup.addr(), e);
                continue;
            }
            let stalled = std::mem::replace(&mut slots[idx], ReplicaSlot::new(backup));
            stalled.conn.disconnect();
        }
    }

    fn replay_journal(&self, conn: &dyn Connection) -> Result<()> {
        for packet in self.journal.lock().iter() {
            conn.send(packet.clone())?;
        }
        Ok(())
    }

    pub(crate) fn disconnect(&self) {
        for slot in self.slots.lock().iter() {
            slot.conn.disconnect();
        }
        for backup in self.backups.lock().iter() {
            backup.disconnect();
        }
    }

    pub(crate) fn has_active_connections(&self) -> bool {
        self.slots.lock().iter().any(|slot| slot.active())
    }

    pub(crate) fn size(&self) -> usize {
        self.slots.lock().len()
    }

    pub(crate) fn dump_addresses(&self) -> String {
        self.slots
            .lock()
            .iter()
            .map(|slot| slot.conn.addr().to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub(crate) fn receive_timeout_slot(&self) -> &Mutex<Duration> {
        &self.receive_timeout
    }

    pub(crate) fn replica_info_slot(&self) -> &Mutex<Option<ReplicaInfo>> {
        &self.replica_info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::local_channel;
    use tundra_common::NodeAddr;

    fn settings() -> Settings {
        Settings {
            use_hedged_requests: true,
            hedged_failover_timeout_ms: 20,
            receive_timeout_ms: 2_000,
            ..Settings::default()
        }
    }

    #[test]
    fn test_stalled_primary_is_replaced_by_backup() {
        let (primary, _primary_server) = local_channel(NodeAddr::new("primary", 9000), 8);
        let (backup, backup_server) = local_channel(NodeAddr::new("backup", 9000), 8);

        let hedged = HedgedConnections::new(
            vec![Arc::new(primary) as Arc<dyn Connection>],
            vec![Arc::new(backup) as Arc<dyn Connection>],
            &settings(),
        );
        hedged
            .broadcast(ClientPacket::IgnoredPartUuids(vec![uuid::Uuid::new_v4()]))
            .unwrap();

        // Script the backup: once the journal arrives, answer and finish.
        let server = std::thread::spawn(move || {
            let replayed = backup_server.recv().unwrap();
            assert!(matches!(replayed, ClientPacket::IgnoredPartUuids(_)));
            backup_server.send(ServerPacket::EndOfStream).unwrap();
        });

        // The primary never speaks, so the backup's packet must surface.
        let deadline = Instant::now() + Duration::from_secs(2);
        let packet = hedged.receive_packet_by(deadline).unwrap();
        assert!(matches!(packet, ServerPacket::EndOfStream));
        assert_eq!(hedged.dump_addresses(), "backup:9000");
        server.join().unwrap();
    }

    #[test]
    fn test_cancel_is_not_journaled() {
        let (primary, _server) = local_channel(NodeAddr::new("primary", 9000), 8);
        let hedged = HedgedConnections::new(
            vec![Arc::new(primary) as Arc<dyn Connection>],
            vec![],
            &settings(),
        );

        hedged.broadcast(ClientPacket::Cancel).unwrap();
        assert!(hedged.journal.lock().is_empty());
    }
}
