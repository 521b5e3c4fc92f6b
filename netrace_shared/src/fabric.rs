//! Replicated data fabric seam.
//!
//! The fabric is the transport/replication runtime underneath the core: room
//! membership, the simulation tick, authority election, and delivery of
//! reliable registry messages and unreliable input packets. The core only
//! talks to it through [`Fabric`].
//!
//! [`LoopbackHub`] is an in-process fabric. Every node gets its own
//! [`LoopbackFabric`] endpoint; messages are encoded exactly as they would be
//! on a socket and queued per member. It also carries the knobs tests need:
//! reachability, open latency, round-trip times, input loss and forced
//! authority.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    config::SessionMode,
    error::{ConfigError, ConnectReason, SessionError},
    net::{decode_from_bytes, encode_to_bytes, NetMsg, ParticipantId, RoomSpec, Tick},
    records::RecordStore,
};

/// Who the fabric currently names as authority, seen from the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityView {
    Local,
    Remote(ParticipantId),
    /// No authority, election in progress, or the local node is offline.
    Unknown,
}

/// How a node enters a room.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenRequest {
    /// Create the room, or enter it as a peer if it already exists.
    Create(RoomSpec),
    Join { room: String },
}

/// Result of a successful open.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedRoom {
    pub participant: ParticipantId,
    pub spec: RoomSpec,
    /// True if this open created the room.
    pub created: bool,
}

#[async_trait]
pub trait Fabric: Send + Sync {
    /// Enters a room. The only operation allowed to wait on the network.
    async fn open(&self, request: OpenRequest) -> Result<OpenedRoom, SessionError>;
    /// Leaves the current room. No-op when not in one.
    fn leave(&self);

    fn local_participant(&self) -> Option<ParticipantId>;
    fn authority(&self) -> AuthorityView;
    fn active_participants(&self) -> Vec<ParticipantId>;
    fn tick(&self) -> Tick;
    fn round_trip(&self, participant: ParticipantId) -> Option<Duration>;

    /// Broadcasts a registry/membership message to the other members.
    fn send_reliable(&self, msg: &NetMsg) -> anyhow::Result<()>;
    /// Broadcasts an input packet to the other members. May be dropped.
    fn send_unreliable(&self, payload: Bytes);
    fn recv_reliable(&self) -> Vec<NetMsg>;
    /// Received input packets, stamped with the sending participant.
    fn recv_unreliable(&self) -> Vec<(ParticipantId, Bytes)>;
}

#[derive(Default)]
struct Member {
    reliable: VecDeque<Bytes>,
    unreliable: VecDeque<(ParticipantId, Bytes)>,
    rtt: Duration,
}

struct Room {
    spec: RoomSpec,
    host: ParticipantId,
    members: BTreeMap<ParticipantId, Member>,
    /// Canonical registry, handed to members as they enter.
    records: RecordStore,
    authority: Option<ParticipantId>,
}

impl Room {
    fn elect(&self) -> Option<ParticipantId> {
        match self.spec.mode {
            SessionMode::Authoritative => {
                self.members.contains_key(&self.host).then_some(self.host)
            }
            SessionMode::SharedAuthority => self.members.keys().next().copied(),
        }
    }

    fn push_reliable(&mut self, msg: &NetMsg, except: Option<ParticipantId>) {
        let bytes = match encode_to_bytes(msg) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable message");
                return;
            }
        };
        for (id, member) in self.members.iter_mut() {
            if Some(*id) != except {
                member.reliable.push_back(bytes.clone());
            }
        }
    }

    fn reelect(&mut self) {
        let elected = self.elect();
        if elected != self.authority {
            info!(room = %self.spec.room, from = ?self.authority, to = ?elected, "Authority changed");
            self.authority = elected;
            self.push_reliable(&NetMsg::AuthorityChanged { authority: elected }, None);
        }
    }
}

struct HubState {
    reachable: bool,
    open_delay: Duration,
    drop_unreliable: bool,
    next_participant: u32,
    tick: Tick,
    rooms: HashMap<String, Room>,
    forced_authority: Vec<ParticipantId>,
}

/// In-process fabric shared by a set of nodes.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
    record_capacity: usize,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(10)
    }
}

impl LoopbackHub {
    /// `record_capacity` bounds the canonical registry of every room.
    pub fn new(record_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                reachable: true,
                open_delay: Duration::ZERO,
                drop_unreliable: false,
                next_participant: 1,
                tick: 0,
                rooms: HashMap::new(),
                forced_authority: Vec::new(),
            })),
            record_capacity,
        }
    }

    /// Creates an endpoint for one node.
    pub fn endpoint(&self) -> LoopbackFabric {
        LoopbackFabric {
            hub: self.clone(),
            local: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tick(&self) -> Tick {
        self.lock().tick
    }

    /// Advances the shared simulation tick and returns the new value.
    pub fn advance_tick(&self) -> Tick {
        let mut st = self.lock();
        st.tick = st.tick.wrapping_add(1);
        st.tick
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    /// Drops every unreliable packet while set, modelling a replication stall.
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.lock().drop_unreliable = drop;
    }

    pub fn set_round_trip(&self, participant: ParticipantId, rtt: Duration) {
        let mut st = self.lock();
        for room in st.rooms.values_mut() {
            if let Some(member) = room.members.get_mut(&participant) {
                member.rtt = rtt;
            }
        }
    }

    /// Fault injection: every listed participant sees itself as authority.
    pub fn force_authority(&self, participants: &[ParticipantId]) {
        self.lock().forced_authority = participants.to_vec();
    }

    /// Members of a room, in id order.
    pub fn members(&self, room: &str) -> Vec<ParticipantId> {
        self.lock()
            .rooms
            .get(room)
            .map(|r| r.members.keys().copied().collect())
            .unwrap_or_default()
    }

    fn open_blocking(&self, request: OpenRequest) -> Result<OpenedRoom, SessionError> {
        let capacity = self.record_capacity;
        let mut st = self.lock();
        if !st.reachable {
            return Err(SessionError::connectivity(ConnectReason::Unreachable));
        }

        let (room_name, created) = match &request {
            OpenRequest::Create(spec) => {
                let exists = st.rooms.contains_key(&spec.room);
                if exists {
                    let room_mode = st.rooms[&spec.room].spec.mode;
                    if room_mode != spec.mode {
                        return Err(ConfigError::AuthorityModeMismatch {
                            room: room_mode,
                            configured: spec.mode,
                        }
                        .into());
                    }
                }
                (spec.room.clone(), !exists)
            }
            OpenRequest::Join { room } => {
                if !st.rooms.contains_key(room) {
                    return Err(SessionError::connectivity(ConnectReason::RoomNotFound));
                }
                (room.clone(), false)
            }
        };

        let participant = ParticipantId(st.next_participant);
        st.next_participant += 1;

        if created {
            if let OpenRequest::Create(spec) = &request {
                st.rooms.insert(
                    spec.room.clone(),
                    Room {
                        spec: spec.clone(),
                        host: participant,
                        members: BTreeMap::new(),
                        records: RecordStore::new(capacity),
                        authority: None,
                    },
                );
            }
        }

        let room = st
            .rooms
            .get_mut(&room_name)
            .ok_or(SessionError::connectivity(ConnectReason::RoomNotFound))?;
        if room.members.len() >= room.spec.max_participants {
            return Err(SessionError::CapacityExceeded {
                max: room.spec.max_participants,
            });
        }

        room.members.insert(participant, Member::default());
        let snapshot = NetMsg::RecordSnapshot {
            records: room.records.iter().copied().collect(),
        };
        if let Ok(bytes) = encode_to_bytes(&snapshot) {
            if let Some(member) = room.members.get_mut(&participant) {
                member.reliable.push_back(bytes);
            }
        }
        room.push_reliable(&NetMsg::ParticipantJoined { participant }, None);
        room.reelect();

        info!(room = %room_name, %participant, created, "Participant entered room");
        Ok(OpenedRoom {
            participant,
            spec: room.spec.clone(),
            created,
        })
    }

    fn leave_room(&self, room_name: &str, participant: ParticipantId) {
        let mut st = self.lock();
        st.forced_authority.retain(|p| *p != participant);
        let Some(room) = st.rooms.get_mut(room_name) else {
            return;
        };
        if room.members.remove(&participant).is_none() {
            return;
        }
        room.push_reliable(&NetMsg::ParticipantLeft { participant }, None);
        room.reelect();
        info!(room = %room_name, %participant, "Participant left room");
        if room.members.is_empty() {
            st.rooms.remove(room_name);
            debug!(room = %room_name, "Room closed");
        }
    }
}

/// One node's connection to a [`LoopbackHub`].
pub struct LoopbackFabric {
    hub: LoopbackHub,
    local: Mutex<Option<(String, ParticipantId)>>,
}

impl LoopbackFabric {
    fn local(&self) -> Option<(String, ParticipantId)> {
        self.local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn with_room<T>(&self, f: impl FnOnce(&mut Room, ParticipantId) -> T) -> Option<T> {
        let (room_name, me) = self.local()?;
        let mut st = self.hub.lock();
        let room = st.rooms.get_mut(&room_name)?;
        if !room.members.contains_key(&me) {
            return None;
        }
        Some(f(room, me))
    }
}

#[async_trait]
impl Fabric for LoopbackFabric {
    async fn open(&self, request: OpenRequest) -> Result<OpenedRoom, SessionError> {
        let delay = self.hub.lock().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let opened = self.hub.open_blocking(request)?;
        *self
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some((opened.spec.room.clone(), opened.participant));
        Ok(opened)
    }

    fn leave(&self) {
        let taken = self
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((room, me)) = taken {
            self.hub.leave_room(&room, me);
        }
    }

    fn local_participant(&self) -> Option<ParticipantId> {
        self.with_room(|_, me| me)
    }

    fn authority(&self) -> AuthorityView {
        let Some((room_name, me)) = self.local() else {
            return AuthorityView::Unknown;
        };
        let st = self.hub.lock();
        let Some(room) = st.rooms.get(&room_name) else {
            return AuthorityView::Unknown;
        };
        if !room.members.contains_key(&me) {
            return AuthorityView::Unknown;
        }
        if st.forced_authority.contains(&me) {
            return AuthorityView::Local;
        }
        match room.authority {
            Some(a) if a == me => AuthorityView::Local,
            Some(a) => AuthorityView::Remote(a),
            None => AuthorityView::Unknown,
        }
    }

    fn active_participants(&self) -> Vec<ParticipantId> {
        self.with_room(|room, _| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    fn tick(&self) -> Tick {
        self.hub.tick()
    }

    fn round_trip(&self, participant: ParticipantId) -> Option<Duration> {
        self.with_room(|room, _| room.members.get(&participant).map(|m| m.rtt))
            .flatten()
    }

    fn send_reliable(&self, msg: &NetMsg) -> anyhow::Result<()> {
        self.with_room(|room, me| {
            match msg {
                NetMsg::RecordUpsert(record) => {
                    room.records.merge_upsert(*record);
                }
                NetMsg::RecordRemove {
                    participant,
                    entity,
                } => {
                    room.records.merge_remove(*participant, *entity);
                }
                _ => {}
            }
            room.push_reliable(msg, Some(me));
        })
        .ok_or_else(|| anyhow::anyhow!("not connected to a room"))
    }

    fn send_unreliable(&self, payload: Bytes) {
        if self.hub.lock().drop_unreliable {
            return;
        }
        self.with_room(|room, me| {
            for (id, member) in room.members.iter_mut() {
                if *id != me {
                    member.unreliable.push_back((me, payload.clone()));
                }
            }
        });
    }

    fn recv_reliable(&self) -> Vec<NetMsg> {
        let frames: Vec<Bytes> = self
            .with_room(|room, me| {
                room.members
                    .get_mut(&me)
                    .map(|m| m.reliable.drain(..).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        frames
            .iter()
            .filter_map(|frame| match decode_from_bytes(frame) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable reliable frame");
                    None
                }
            })
            .collect()
    }

    fn recv_unreliable(&self) -> Vec<(ParticipantId, Bytes)> {
        self.with_room(|room, me| {
            room.members
                .get_mut(&me)
                .map(|m| m.unreliable.drain(..).collect())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mode: SessionMode, max: usize) -> RoomSpec {
        RoomSpec {
            room: "GameRoom".into(),
            mode,
            max_participants: max,
        }
    }

    #[tokio::test]
    async fn shared_authority_migrates_to_lowest_member() -> anyhow::Result<()> {
        let hub = LoopbackHub::default();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let pa = a.open(OpenRequest::Create(spec(SessionMode::SharedAuthority, 4))).await?.participant;
        let pb = b.open(OpenRequest::Join { room: "GameRoom".into() }).await?.participant;

        assert_eq!(a.authority(), AuthorityView::Local);
        assert_eq!(b.authority(), AuthorityView::Remote(pa));

        a.leave();
        assert_eq!(b.authority(), AuthorityView::Local);
        assert_eq!(a.authority(), AuthorityView::Unknown);

        let msgs = b.recv_reliable();
        assert!(msgs.contains(&NetMsg::ParticipantLeft { participant: pa }));
        assert!(msgs.contains(&NetMsg::AuthorityChanged { authority: Some(pb) }));
        Ok(())
    }

    #[tokio::test]
    async fn authoritative_room_has_no_authority_after_host_leaves() -> anyhow::Result<()> {
        let hub = LoopbackHub::default();
        let host = hub.endpoint();
        let peer = hub.endpoint();
        host.open(OpenRequest::Create(spec(SessionMode::Authoritative, 4))).await?;
        peer.open(OpenRequest::Join { room: "GameRoom".into() }).await?;

        host.leave();
        assert_eq!(peer.authority(), AuthorityView::Unknown);
        Ok(())
    }

    #[tokio::test]
    async fn full_room_rejects_join() -> anyhow::Result<()> {
        let hub = LoopbackHub::default();
        let a = hub.endpoint();
        a.open(OpenRequest::Create(spec(SessionMode::SharedAuthority, 1))).await?;
        let err = hub
            .endpoint()
            .open(OpenRequest::Join { room: "GameRoom".into() })
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::CapacityExceeded { max: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn unreliable_packets_are_stamped_with_sender() -> anyhow::Result<()> {
        let hub = LoopbackHub::default();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let pa = a.open(OpenRequest::Create(spec(SessionMode::SharedAuthority, 4))).await?.participant;
        b.open(OpenRequest::Join { room: "GameRoom".into() }).await?;

        a.send_unreliable(Bytes::from_static(b"abc"));
        assert_eq!(b.recv_unreliable(), vec![(pa, Bytes::from_static(b"abc"))]);
        assert!(a.recv_unreliable().is_empty());

        hub.set_drop_unreliable(true);
        a.send_unreliable(Bytes::from_static(b"lost"));
        assert!(b.recv_unreliable().is_empty());
        Ok(())
    }
}
