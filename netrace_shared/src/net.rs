//! Networking primitives.
//!
//! Two lanes, as on a real transport:
//! - Reliable: membership and registry traffic as length-delimited JSON
//!   `NetMsg` frames. Explicit and versionable.
//! - Unreliable: fixed-size binary input packets (see `input`), one per
//!   vehicle per tick.

use std::fmt;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{config::SessionMode, records::VehicleRecord};

/// Simulation tick number.
pub type Tick = u32;

/// Identifies a connected participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Opaque reference to a spawned vehicle entity.
///
/// The high half holds the participant whose node allocated the handle, the
/// low half a per-node serial, so two nodes never mint the same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle(pub u64);

impl EntityHandle {
    pub fn compose(allocator: ParticipantId, serial: u32) -> Self {
        EntityHandle(((allocator.0 as u64) << 32) | serial as u64)
    }

    pub fn allocator(self) -> ParticipantId {
        ParticipantId((self.0 >> 32) as u32)
    }

    pub fn serial(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Car_{}#{}", self.allocator(), self.serial())
    }
}

/// Reliable-lane message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Membership ───
    ParticipantJoined {
        participant: ParticipantId,
    },
    ParticipantLeft {
        participant: ParticipantId,
    },
    /// The fabric elected a new authority (shared mode) or lost it.
    AuthorityChanged {
        authority: Option<ParticipantId>,
    },

    // ─── Vehicle registry ───
    RecordUpsert(VehicleRecord),
    RecordRemove {
        participant: ParticipantId,
        entity: EntityHandle,
    },
    /// Full registry state, sent to a node when it enters a room.
    RecordSnapshot {
        records: Vec<VehicleRecord>,
    },
}

/// Parameters a node sends when creating a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSpec {
    pub room: String,
    pub mode: SessionMode,
    pub max_participants: usize,
}

pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_handle_packs_allocator_and_serial() {
        let h = EntityHandle::compose(ParticipantId(7), 3);
        assert_eq!(h.allocator(), ParticipantId(7));
        assert_eq!(h.serial(), 3);
        assert_eq!(h.to_string(), "Car_P7#3");
    }

    #[test]
    fn netmsg_survives_reliable_encoding() {
        let msg = NetMsg::RecordRemove {
            participant: ParticipantId(2),
            entity: EntityHandle::compose(ParticipantId(1), 9),
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        assert_eq!(decode_from_bytes(&bytes).unwrap(), msg);
    }
}
