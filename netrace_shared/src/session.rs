//! Session & authority orchestrator.
//!
//! Owns the node's connection to the fabric, answers "am I the authority
//! right now", and wires the lifecycle manager and input channel once a
//! session is up. Between ticks, [`SessionOrchestrator::pump`] routes the
//! fabric's reliable traffic to the lifecycle manager.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    config::{EngineConfig, SessionMode},
    error::{ConfigError, ConnectReason, SessionError},
    fabric::{AuthorityView, Fabric, OpenRequest, OpenedRoom},
    input::InputChannel,
    lifecycle::{LeaveOutcome, LifecycleManager},
    net::{EntityHandle, NetMsg, ParticipantId, RoomSpec, Tick},
    records::AuthorityToken,
};

/// Sole source of [`AuthorityToken`]s.
///
/// Asks the fabric on every call. Anything but a definite "local" answer,
/// including a dropped connection, counts as not authority.
#[derive(Clone)]
pub struct AuthorityGate {
    fabric: Arc<dyn Fabric>,
}

impl AuthorityGate {
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self { fabric }
    }

    pub fn is_authority(&self) -> bool {
        self.fabric.local_participant().is_some()
            && self.fabric.authority() == AuthorityView::Local
    }

    pub fn acquire(&self) -> Option<AuthorityToken> {
        self.is_authority().then(AuthorityToken::mint)
    }
}

/// Read-only network stats.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDiagnostics {
    pub tick: Tick,
    pub room: Option<String>,
    pub mode: SessionMode,
    pub local: Option<ParticipantId>,
    pub is_authority: bool,
    pub active_participants: usize,
    pub round_trips: Vec<(ParticipantId, Option<Duration>)>,
    pub records: usize,
}

/// What a [`SessionOrchestrator::pump`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Entities that left the registry; their local instances must go.
    pub removed: Vec<EntityHandle>,
    pub authority_gained: bool,
    pub authority_lost: bool,
}

struct ActiveSession {
    spec: RoomSpec,
    local: ParticipantId,
    lifecycle: LifecycleManager,
    input: InputChannel,
    was_authority: bool,
}

pub struct SessionOrchestrator {
    cfg: EngineConfig,
    fabric: Arc<dyn Fabric>,
    active: Option<ActiveSession>,
}

impl SessionOrchestrator {
    pub fn new(cfg: EngineConfig, fabric: Arc<dyn Fabric>) -> Self {
        Self {
            cfg,
            fabric,
            active: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Creates `session_id` (or enters it as a peer in shared mode if it exists).
    pub async fn start_as_authority(
        &mut self,
        session_id: &str,
        max_participants: usize,
    ) -> Result<(), SessionError> {
        self.preflight()?;
        if max_participants == 0 {
            return Err(ConfigError::Invalid {
                field: "max_participants",
                reason: "must be > 0".into(),
            }
            .into());
        }
        let capacity = self.cfg.session.max_records;
        if max_participants > capacity {
            warn!(max_participants, capacity, "Session larger than record capacity");
            return Err(ConfigError::RecordCapacityExceeded {
                requested: max_participants,
                capacity,
            }
            .into());
        }

        let spec = RoomSpec {
            room: session_id.to_string(),
            mode: self.cfg.session.mode,
            max_participants,
        };
        let opened = self.open(OpenRequest::Create(spec)).await?;
        self.activate(opened);
        Ok(())
    }

    /// Enters an existing session as a peer.
    pub async fn join(&mut self, session_id: &str) -> Result<(), SessionError> {
        self.preflight()?;
        let opened = self
            .open(OpenRequest::Join {
                room: session_id.to_string(),
            })
            .await?;

        let configured = self.cfg.session.mode;
        if opened.spec.mode != configured {
            self.fabric.leave();
            return Err(ConfigError::AuthorityModeMismatch {
                room: opened.spec.mode,
                configured,
            }
            .into());
        }
        self.activate(opened);
        Ok(())
    }

    /// Leaves the room and drops the lifecycle manager and input channel.
    pub fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            self.fabric.leave();
            info!(room = %active.spec.room, participant = %active.local, "Session shut down");
        }
    }

    pub fn is_authority(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.lifecycle.is_authority())
            .unwrap_or(false)
    }

    pub fn local_participant(&self) -> Option<ParticipantId> {
        self.active.as_ref().map(|a| a.local)
    }

    pub fn lifecycle(&self) -> Option<&LifecycleManager> {
        self.active.as_ref().map(|a| &a.lifecycle)
    }

    pub fn lifecycle_mut(&mut self) -> Option<&mut LifecycleManager> {
        self.active.as_mut().map(|a| &mut a.lifecycle)
    }

    pub fn input_mut(&mut self) -> Option<&mut InputChannel> {
        self.active.as_mut().map(|a| &mut a.input)
    }

    /// Both halves at once, for work that reads records while buffering input.
    pub fn split_mut(&mut self) -> Option<(&mut LifecycleManager, &mut InputChannel)> {
        self.active
            .as_mut()
            .map(|a| (&mut a.lifecycle, &mut a.input))
    }

    /// Applies pending reliable traffic. Call between ticks only.
    pub fn pump(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        let Some(active) = self.active.as_mut() else {
            return report;
        };

        for msg in self.fabric.recv_reliable() {
            match msg {
                NetMsg::ParticipantJoined { participant } => {
                    if let Err(e) = active.lifecycle.on_participant_joined(participant) {
                        warn!(%participant, error = %e, "Spawn failed");
                    }
                }
                NetMsg::ParticipantLeft { participant } => {
                    match active.lifecycle.on_participant_left(participant) {
                        Ok(LeaveOutcome::Despawned(entity)) => report.removed.push(entity),
                        Ok(_) => {}
                        Err(e) => warn!(%participant, error = %e, "Despawn failed"),
                    }
                }
                NetMsg::AuthorityChanged { authority } => {
                    debug!(?authority, "Authority change notified");
                }
                other => report.removed.extend(active.lifecycle.apply_replicated(&other)),
            }
        }

        let now = active.lifecycle.is_authority();
        if now && !active.was_authority {
            info!(participant = %active.local, "Authority gained");
            report.authority_gained = true;
            match active.lifecycle.reconcile() {
                Ok(done) => report.removed.extend(done.despawned),
                Err(e) => warn!(error = %e, "Reconciliation failed"),
            }
        } else if !now && active.was_authority {
            info!(participant = %active.local, "Authority lost");
            report.authority_lost = true;
        }
        active.was_authority = now;
        report
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        let participants = self.fabric.active_participants();
        SessionDiagnostics {
            tick: self.fabric.tick(),
            room: self.active.as_ref().map(|a| a.spec.room.clone()),
            mode: self.cfg.session.mode,
            local: self.local_participant(),
            is_authority: self.is_authority(),
            active_participants: participants.len(),
            round_trips: participants
                .iter()
                .map(|p| (*p, self.fabric.round_trip(*p)))
                .collect(),
            records: self.lifecycle().map(|l| l.records().len()).unwrap_or(0),
        }
    }

    fn preflight(&self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        self.cfg.validate()?;
        Ok(())
    }

    async fn open(&self, request: OpenRequest) -> Result<OpenedRoom, SessionError> {
        let timeout = Duration::from_millis(self.cfg.session.connect_timeout_ms);
        match tokio::time::timeout(timeout, self.fabric.open(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.cfg.session.connect_timeout_ms, "Session open timed out");
                Err(SessionError::connectivity(ConnectReason::TimedOut))
            }
        }
    }

    fn activate(&mut self, opened: OpenedRoom) {
        let gate = AuthorityGate::new(self.fabric.clone());
        let lifecycle = LifecycleManager::new(
            gate,
            self.fabric.clone(),
            self.cfg.spawn.clone(),
            self.cfg.session.max_records,
        );
        let input = InputChannel::new(opened.participant, &self.cfg.input);
        info!(
            room = %opened.spec.room,
            participant = %opened.participant,
            mode = ?opened.spec.mode,
            created = opened.created,
            "Session started"
        );
        self.active = Some(ActiveSession {
            spec: opened.spec,
            local: opened.participant,
            lifecycle,
            input,
            was_authority: false,
        });
        // Snapshot first, then reconcile if this node holds authority.
        self.pump();
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LoopbackHub;

    fn config(mode: SessionMode) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.session.mode = mode;
        cfg
    }

    fn orchestrator(hub: &LoopbackHub, mode: SessionMode) -> SessionOrchestrator {
        SessionOrchestrator::new(config(mode), Arc::new(hub.endpoint()))
    }

    #[tokio::test]
    async fn authority_spawns_itself_on_start() {
        let hub = LoopbackHub::default();
        let mut host = orchestrator(&hub, SessionMode::Authoritative);
        host.start_as_authority("GameRoom", 4).await.unwrap();

        assert!(host.is_authority());
        let me = host.local_participant().unwrap();
        assert!(host.lifecycle_mut().unwrap().vehicle_for(me).is_some());
    }

    #[tokio::test]
    async fn second_start_is_already_active() {
        let hub = LoopbackHub::default();
        let mut host = orchestrator(&hub, SessionMode::Authoritative);
        host.start_as_authority("GameRoom", 4).await.unwrap();

        assert_eq!(
            host.start_as_authority("GameRoom", 4).await,
            Err(SessionError::AlreadyActive)
        );
        assert_eq!(host.join("GameRoom").await, Err(SessionError::AlreadyActive));
    }

    #[tokio::test]
    async fn unreachable_fabric_is_connectivity_failure() {
        let hub = LoopbackHub::default();
        hub.set_reachable(false);
        let mut host = orchestrator(&hub, SessionMode::Authoritative);

        assert_eq!(
            host.start_as_authority("GameRoom", 4).await,
            Err(SessionError::connectivity(ConnectReason::Unreachable))
        );
        assert!(!host.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_open_times_out() {
        let hub = LoopbackHub::default();
        hub.set_open_delay(Duration::from_secs(30));
        let mut host = orchestrator(&hub, SessionMode::Authoritative);

        assert_eq!(
            host.start_as_authority("GameRoom", 4).await,
            Err(SessionError::connectivity(ConnectReason::TimedOut))
        );
        assert!(hub.members("GameRoom").is_empty());
    }

    #[tokio::test]
    async fn participants_beyond_record_capacity_rejected() {
        let hub = LoopbackHub::default();
        let mut host = orchestrator(&hub, SessionMode::Authoritative);

        assert_eq!(
            host.start_as_authority("GameRoom", 11).await,
            Err(SessionError::Config(ConfigError::RecordCapacityExceeded {
                requested: 11,
                capacity: 10
            }))
        );
        assert!(hub.members("GameRoom").is_empty());
    }

    #[tokio::test]
    async fn join_errors_are_reported() {
        let hub = LoopbackHub::default();
        let mut peer = orchestrator(&hub, SessionMode::Authoritative);
        assert_eq!(
            peer.join("Nowhere").await,
            Err(SessionError::connectivity(ConnectReason::RoomNotFound))
        );

        let mut host = orchestrator(&hub, SessionMode::Authoritative);
        host.start_as_authority("GameRoom", 1).await.unwrap();
        assert_eq!(
            peer.join("GameRoom").await,
            Err(SessionError::CapacityExceeded { max: 1 })
        );

        let mut shared = orchestrator(&hub, SessionMode::SharedAuthority);
        assert!(matches!(
            shared.join("GameRoom").await,
            Err(SessionError::Config(ConfigError::AuthorityModeMismatch { .. }))
        ));
        assert_eq!(hub.members("GameRoom").len(), 1);
    }

    #[tokio::test]
    async fn authoritative_peer_never_becomes_authority() {
        let hub = LoopbackHub::default();
        let mut host = orchestrator(&hub, SessionMode::Authoritative);
        let mut peer = orchestrator(&hub, SessionMode::Authoritative);
        host.start_as_authority("GameRoom", 4).await.unwrap();
        peer.join("GameRoom").await.unwrap();
        assert!(!peer.is_authority());

        host.shutdown();
        let report = peer.pump();
        assert!(!report.authority_gained);
        assert!(!peer.is_authority());
    }

    #[tokio::test]
    async fn shared_peer_takes_over_and_reconciles() {
        let hub = LoopbackHub::default();
        let mut host = orchestrator(&hub, SessionMode::SharedAuthority);
        let mut peer = orchestrator(&hub, SessionMode::SharedAuthority);
        host.start_as_authority("GameRoom", 4).await.unwrap();
        peer.join("GameRoom").await.unwrap();
        host.pump();
        peer.pump();
        assert_eq!(peer.lifecycle().unwrap().records().len(), 2);

        let host_id = host.local_participant().unwrap();
        let host_car = host.lifecycle_mut().unwrap().vehicle_for(host_id).unwrap();
        host.shutdown();
        host.shutdown();

        let report = peer.pump();
        assert!(report.authority_gained);
        assert!(peer.is_authority());
        assert_eq!(report.removed, vec![host_car]);
        assert_eq!(peer.lifecycle().unwrap().records().len(), 1);
    }

    #[tokio::test]
    async fn diagnostics_report_room_state() {
        let hub = LoopbackHub::default();
        let mut host = orchestrator(&hub, SessionMode::Authoritative);
        let idle = host.diagnostics();
        assert_eq!(idle.room, None);
        assert!(!idle.is_authority);

        host.start_as_authority("GameRoom", 4).await.unwrap();
        let me = host.local_participant().unwrap();
        hub.set_round_trip(me, Duration::from_millis(12));
        hub.advance_tick();

        let diag = host.diagnostics();
        assert_eq!(diag.tick, 1);
        assert_eq!(diag.room.as_deref(), Some("GameRoom"));
        assert_eq!(diag.active_participants, 1);
        assert_eq!(diag.round_trips, vec![(me, Some(Duration::from_millis(12)))]);
        assert_eq!(diag.records, 1);
        assert!(diag.is_authority);
    }
}
