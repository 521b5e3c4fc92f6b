//! Entity lifecycle manager.
//!
//! Spawns a vehicle per connected participant and despawns it when the
//! participant leaves. Only the authority mutates the registry; every other
//! node applies the deltas it replicates. All entry points are idempotent, so
//! duplicate or reordered fabric notifications are harmless.
//!
//! Check-then-insert is not atomic across threads by itself: the manager takes
//! `&mut self` and callers serialize through the authority loop (or a lock).

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    config::SpawnConfig,
    error::LifecycleError,
    fabric::Fabric,
    net::{EntityHandle, NetMsg, ParticipantId},
    records::{MergeOutcome, RecordStore, VehicleRecord},
    session::AuthorityGate,
    spawn::{ordinal, spawn_pose},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Spawned(EntityHandle),
    AlreadySpawned(EntityHandle),
    NotAuthority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Despawned(EntityHandle),
    NotFound,
    NotAuthority,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub spawned: Vec<EntityHandle>,
    pub despawned: Vec<EntityHandle>,
}

pub struct LifecycleManager {
    gate: AuthorityGate,
    fabric: Arc<dyn Fabric>,
    spawn: SpawnConfig,
    records: RecordStore,
    /// participant → entity; derived from `records`, safe to drop at any time.
    cache: HashMap<ParticipantId, EntityHandle>,
    next_serial: u32,
}

impl LifecycleManager {
    pub fn new(
        gate: AuthorityGate,
        fabric: Arc<dyn Fabric>,
        spawn: SpawnConfig,
        record_capacity: usize,
    ) -> Self {
        Self {
            gate,
            fabric,
            spawn,
            records: RecordStore::new(record_capacity),
            cache: HashMap::new(),
            next_serial: 1,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn spawn_config(&self) -> &SpawnConfig {
        &self.spawn
    }

    pub fn is_authority(&self) -> bool {
        self.gate.is_authority()
    }

    /// Ensures `participant` has exactly one vehicle.
    pub fn on_participant_joined(
        &mut self,
        participant: ParticipantId,
    ) -> Result<JoinOutcome, LifecycleError> {
        let Some(token) = self.gate.acquire() else {
            debug!(%participant, "Join ignored: not authority");
            return Ok(JoinOutcome::NotAuthority);
        };
        if let Some(existing) = self.records.get(participant) {
            debug!(%participant, entity = %existing.entity, "Join ignored: already spawned");
            return Ok(JoinOutcome::AlreadySpawned(existing.entity));
        }
        let Some(local) = self.fabric.local_participant() else {
            return Ok(JoinOutcome::NotAuthority);
        };

        let active = self.fabric.active_participants();
        let index = ordinal(participant, &active);
        let pose = spawn_pose(&self.spawn, index, active.len());

        let entity = EntityHandle::compose(local, self.next_serial);
        self.next_serial = self.next_serial.wrapping_add(1);
        let record = VehicleRecord {
            participant,
            entity,
            created_tick: self.fabric.tick(),
            pose,
        };

        if !self.records.insert(&token, record)? {
            return Ok(JoinOutcome::AlreadySpawned(entity));
        }
        if let Err(e) = self.fabric.send_reliable(&NetMsg::RecordUpsert(record)) {
            self.records.remove(&token, participant);
            return Err(LifecycleError::Replication(e.to_string()));
        }
        self.cache.insert(participant, entity);

        info!(
            %participant,
            %entity,
            index,
            x = pose.position.x,
            y = pose.position.y,
            z = pose.position.z,
            "Vehicle spawned"
        );
        Ok(JoinOutcome::Spawned(entity))
    }

    /// Despawns `participant`'s vehicle, if it has one.
    pub fn on_participant_left(
        &mut self,
        participant: ParticipantId,
    ) -> Result<LeaveOutcome, LifecycleError> {
        let Some(token) = self.gate.acquire() else {
            debug!(%participant, "Leave ignored: not authority");
            return Ok(LeaveOutcome::NotAuthority);
        };
        let Some(record) = self.records.remove(&token, participant) else {
            debug!(%participant, "Leave ignored: no vehicle");
            return Ok(LeaveOutcome::NotFound);
        };
        self.cache.remove(&participant);

        let msg = NetMsg::RecordRemove {
            participant,
            entity: record.entity,
        };
        if let Err(e) = self.fabric.send_reliable(&msg) {
            // Local removal stands; the caller sees the failure. Replicas keep the record.
            warn!(%participant, entity = %record.entity, error = %e, "Failed to replicate despawn");
            return Err(LifecycleError::Replication(e.to_string()));
        }

        info!(%participant, entity = %record.entity, "Vehicle despawned");
        Ok(LeaveOutcome::Despawned(record.entity))
    }

    /// Brings the registry in line with the fabric's membership. Authority only.
    pub fn reconcile(&mut self) -> Result<Reconciled, LifecycleError> {
        let mut out = Reconciled::default();
        if !self.gate.is_authority() {
            return Ok(out);
        }

        let active = self.fabric.active_participants();
        let gone: Vec<ParticipantId> = self
            .records
            .iter()
            .map(|r| r.participant)
            .filter(|p| !active.contains(p))
            .collect();
        for participant in gone {
            if let LeaveOutcome::Despawned(entity) = self.on_participant_left(participant)? {
                out.despawned.push(entity);
            }
        }
        for participant in active {
            if let JoinOutcome::Spawned(entity) = self.on_participant_joined(participant)? {
                out.spawned.push(entity);
            }
        }

        if !out.spawned.is_empty() || !out.despawned.is_empty() {
            info!(
                spawned = out.spawned.len(),
                despawned = out.despawned.len(),
                "Registry reconciled"
            );
        }
        Ok(out)
    }

    /// Applies a registry delta from the authority. Returns entities that no
    /// longer belong to the registry.
    pub fn apply_replicated(&mut self, msg: &NetMsg) -> Vec<EntityHandle> {
        match msg {
            NetMsg::RecordUpsert(record) => match self.records.merge_upsert(*record) {
                MergeOutcome::Inserted | MergeOutcome::Unchanged => {
                    self.cache.remove(&record.participant);
                    Vec::new()
                }
                MergeOutcome::Replaced { displaced } => {
                    warn!(participant = %record.participant, %displaced, kept = %record.entity, "Conflicting vehicle records merged");
                    self.cache.remove(&record.participant);
                    vec![displaced]
                }
                MergeOutcome::Rejected => {
                    debug!(participant = %record.participant, entity = %record.entity, "Replicated record rejected");
                    Vec::new()
                }
            },
            NetMsg::RecordRemove {
                participant,
                entity,
            } => {
                self.cache.remove(participant);
                self.records
                    .merge_remove(*participant, *entity)
                    .map(|r| vec![r.entity])
                    .unwrap_or_default()
            }
            NetMsg::RecordSnapshot { records } => {
                let before: Vec<EntityHandle> = self.records.iter().map(|r| r.entity).collect();
                self.records.replace_all(records.iter().copied());
                self.cache.clear();
                before
                    .into_iter()
                    .filter(|e| self.records.by_entity(*e).is_none())
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Vehicle controlled by `participant`.
    pub fn vehicle_for(&mut self, participant: ParticipantId) -> Option<EntityHandle> {
        if let Some(entity) = self.cache.get(&participant) {
            return Some(*entity);
        }
        let entity = self.records.get(participant)?.entity;
        self.cache.insert(participant, entity);
        Some(entity)
    }

    pub fn invalidate_cache(&mut self) {
        self.cache.clear();
    }
}
