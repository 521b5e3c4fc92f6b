//! Replicated vehicle registry.
//!
//! `RecordStore` is the participant → vehicle mapping. Every node holds a
//! replica. Direct writes require an `AuthorityToken`, which only the session's
//! authority gate can mint, so a node without authority has no way to call
//! them. Replicas converge by merging the deltas the authority broadcasts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::LifecycleError,
    math::{Quat, Vec3},
    net::{EntityHandle, ParticipantId, Tick},
};

/// Proof that the holder was authority when the token was minted.
///
/// Tokens are minted per mutation and never stored, so a stale authority
/// decision cannot outlive the call that made it.
#[derive(Debug)]
pub struct AuthorityToken {
    _private: (),
}

impl AuthorityToken {
    pub(crate) fn mint() -> Self {
        AuthorityToken { _private: () }
    }
}

/// Where a vehicle is placed when it is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SpawnPose {
    pub position: Vec3,
    pub rotation: Quat,
}

/// Replicated mapping entry binding a participant to its vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    /// Participant holding control authority over the vehicle.
    pub participant: ParticipantId,
    pub entity: EntityHandle,
    pub created_tick: Tick,
    pub pose: SpawnPose,
}

impl VehicleRecord {
    /// Total order used to settle two records claiming the same participant.
    fn precedence(&self) -> (Tick, EntityHandle) {
        (self.created_tick, self.entity)
    }
}

/// Result of merging a replicated upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Same record already present.
    Unchanged,
    /// Incoming record won a conflict; the previous entity must be dropped.
    Replaced { displaced: EntityHandle },
    /// Incoming record lost a conflict or did not fit.
    Rejected,
}

/// Capacity-bounded record set keyed by participant.
#[derive(Debug, Clone)]
pub struct RecordStore {
    records: BTreeMap<ParticipantId, VehicleRecord>,
    capacity: usize,
}

impl RecordStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, participant: ParticipantId) -> Option<&VehicleRecord> {
        self.records.get(&participant)
    }

    pub fn contains(&self, participant: ParticipantId) -> bool {
        self.records.contains_key(&participant)
    }

    /// Finds the record owning an entity.
    pub fn by_entity(&self, entity: EntityHandle) -> Option<&VehicleRecord> {
        self.records.values().find(|r| r.entity == entity)
    }

    /// Records in participant order.
    pub fn iter(&self) -> impl Iterator<Item = &VehicleRecord> {
        self.records.values()
    }

    /// Inserts a record. Returns `Ok(false)` if the participant already has one.
    pub fn insert(
        &mut self,
        _authority: &AuthorityToken,
        record: VehicleRecord,
    ) -> Result<bool, LifecycleError> {
        if self.records.contains_key(&record.participant) {
            return Ok(false);
        }
        if self.records.len() >= self.capacity {
            return Err(LifecycleError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.records.insert(record.participant, record);
        Ok(true)
    }

    pub fn remove(
        &mut self,
        _authority: &AuthorityToken,
        participant: ParticipantId,
    ) -> Option<VehicleRecord> {
        self.records.remove(&participant)
    }

    /// Applies an upsert replicated from the authority.
    pub(crate) fn merge_upsert(&mut self, record: VehicleRecord) -> MergeOutcome {
        match self.records.get(&record.participant) {
            Some(existing) if *existing == record => MergeOutcome::Unchanged,
            Some(existing) if existing.precedence() <= record.precedence() => {
                MergeOutcome::Rejected
            }
            Some(existing) => {
                let displaced = existing.entity;
                self.records.insert(record.participant, record);
                MergeOutcome::Replaced { displaced }
            }
            None if self.records.len() >= self.capacity => MergeOutcome::Rejected,
            None => {
                self.records.insert(record.participant, record);
                MergeOutcome::Inserted
            }
        }
    }

    /// Applies a removal replicated from the authority. A removal naming a
    /// different entity than the one held is stale and ignored.
    pub(crate) fn merge_remove(
        &mut self,
        participant: ParticipantId,
        entity: EntityHandle,
    ) -> Option<VehicleRecord> {
        match self.records.get(&participant) {
            Some(existing) if existing.entity == entity => self.records.remove(&participant),
            _ => None,
        }
    }

    /// Replaces the replica with a full snapshot, keeping the capacity bound.
    pub(crate) fn replace_all(&mut self, records: impl IntoIterator<Item = VehicleRecord>) {
        self.records.clear();
        for record in records {
            self.merge_upsert(record);
        }
    }
}
