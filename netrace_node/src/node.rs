//! Race node.
//!
//! Drives one participant through fixed ticks. A tick has two halves:
//! - `begin_tick`: cvar changes, registry traffic, instance sync, publish local input
//! - `simulate_tick`: buffer remote input, step every vehicle, step physics
//!
//! Registry changes land only in `begin_tick`, so a vehicle never appears or
//! disappears in the middle of a simulation step.
//!
//! Determinism notes:
//! - Vehicles are stepped in participant order.
//! - A missing input frame is neutral input, never a repeat of the last one.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::bail;
use netrace_shared::{
    config::EngineConfig,
    console::{Console, CvarFlags, CvarValue},
    error::{ConfigError, SessionError},
    fabric::Fabric,
    input::InputSource,
    math::Vec3,
    net::{EntityHandle, Tick},
    physics::PhysicsBackend,
    records::VehicleRecord,
    session::{SessionDiagnostics, SessionOrchestrator},
    vehicle::{VehicleController, VehicleSimState},
};
use tracing::{debug, info, warn};

pub struct RaceNode {
    pub console: Console,
    session: SessionOrchestrator,
    physics: Box<dyn PhysicsBackend>,
    controller: VehicleController,
    source: Box<dyn InputSource>,
    /// Local instances, keyed by entity. Mirrors the registry after `begin_tick`.
    instances: BTreeMap<EntityHandle, VehicleSimState>,
    quit: bool,
}

impl RaceNode {
    pub fn new(
        cfg: EngineConfig,
        fabric: Arc<dyn Fabric>,
        physics: Box<dyn PhysicsBackend>,
        source: Box<dyn InputSource>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        if !physics.has_template(&cfg.spawn.vehicle_template) {
            return Err(ConfigError::MissingVehicleTemplate(
                cfg.spawn.vehicle_template.clone(),
            ));
        }

        let mut console = Console::new();
        Self::register_cvars(&mut console, &cfg);

        Ok(Self {
            console,
            controller: VehicleController::new(cfg.vehicle),
            session: SessionOrchestrator::new(cfg, fabric),
            physics,
            source,
            instances: BTreeMap::new(),
            quit: false,
        })
    }

    fn register_cvars(console: &mut Console, cfg: &EngineConfig) {
        let v = &cfg.vehicle;
        console.register_cvar(
            "veh_max_torque",
            CvarValue::Float(v.max_motor_torque as f64),
            "Drive torque per rear wheel at full throttle",
            CvarFlags::TUNING,
        );
        console.register_cvar(
            "veh_max_steer",
            CvarValue::Float(v.max_steer_angle as f64),
            "Front wheel steer angle at full lock (degrees)",
            CvarFlags::TUNING,
        );
        console.register_cvar(
            "veh_max_brake",
            CvarValue::Float(v.max_brake_torque as f64),
            "Brake torque per wheel",
            CvarFlags::TUNING,
        );
        console.register_cvar(
            "veh_anti_roll",
            CvarValue::Float(v.anti_roll as f64),
            "Anti-roll stiffness per axle",
            CvarFlags::TUNING,
        );
        console.register_cvar(
            "in_smoothing",
            CvarValue::Float(cfg.input.smoothing as f64),
            "Low-pass factor on local steering/throttle, 0 = off",
            CvarFlags::LOCAL,
        );
        console.register_cvar(
            "sv_tickrate",
            CvarValue::Int(cfg.session.tick_hz as i64),
            "Simulation tick rate",
            CvarFlags::READ_ONLY,
        );
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    pub async fn start_as_authority(&mut self, max_participants: usize) -> Result<(), SessionError> {
        let room = self.session.config().session.room.clone();
        self.session.start_as_authority(&room, max_participants).await?;
        self.sync_instances();
        Ok(())
    }

    pub async fn join(&mut self) -> Result<(), SessionError> {
        let room = self.session.config().session.room.clone();
        self.session.join(&room).await?;
        self.sync_instances();
        Ok(())
    }

    /// Leaves the session and drops every local instance. Idempotent.
    pub fn shutdown(&mut self) {
        self.session.shutdown();
        for entity in std::mem::take(&mut self.instances).into_keys() {
            self.physics.destroy_body(entity);
        }
    }

    pub fn session(&self) -> &SessionOrchestrator {
        &self.session
    }

    pub fn is_authority(&self) -> bool {
        self.session.is_authority()
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        self.session.diagnostics()
    }

    /// Registry replica, in participant order.
    pub fn vehicles(&self) -> Vec<VehicleRecord> {
        self.session
            .lifecycle()
            .map(|l| l.records().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn vehicle_position(&self, entity: EntityHandle) -> Option<Vec3> {
        self.physics.body(entity).map(|b| b.position())
    }

    pub fn sim_state(&self, entity: EntityHandle) -> Option<&VehicleSimState> {
        self.instances.get(&entity)
    }

    /// Runs both halves of a tick.
    pub fn step(&mut self, dt_sec: f32) -> Tick {
        self.begin_tick();
        self.simulate_tick(dt_sec)
    }

    /// First half of a tick.
    pub fn begin_tick(&mut self) -> Tick {
        self.apply_cvars();

        let report = self.session.pump();
        if let Some(input) = self.session.input_mut() {
            for entity in &report.removed {
                input.forget(*entity);
            }
        }
        self.sync_instances();

        let fabric = self.session.fabric().clone();
        let tick = fabric.tick();
        if let Some((lifecycle, input)) = self.session.split_mut() {
            let local = input.local();
            if let Some(record) = lifecycle.records().get(local).copied() {
                if let Some(packet) = input.sample(tick, &record, self.source.as_mut()) {
                    fabric.send_unreliable(packet.to_bytes());
                }
            }
        }
        tick
    }

    /// Second half of a tick. Never waits on the network.
    pub fn simulate_tick(&mut self, dt_sec: f32) -> Tick {
        let fabric = self.session.fabric().clone();
        let tick = fabric.tick();
        let Some((lifecycle, input)) = self.session.split_mut() else {
            return tick;
        };

        for (sender, payload) in fabric.recv_unreliable() {
            if let Err(reject) = input.receive(sender, &payload, lifecycle.records()) {
                debug!(%sender, tick, ?reject, "Input packet dropped");
            }
        }

        let entities: Vec<EntityHandle> = lifecycle.records().iter().map(|r| r.entity).collect();
        for entity in entities {
            let frame = input.frame_for(entity, tick);
            let (Some(body), Some(state)) =
                (self.physics.body_mut(entity), self.instances.get_mut(&entity))
            else {
                continue;
            };
            self.controller.step(tick, &frame, body, state);
        }

        self.physics.step(dt_sec);
        tick
    }

    /// Creates and destroys physics instances until they match the registry.
    fn sync_instances(&mut self) {
        let Some(lifecycle) = self.session.lifecycle() else {
            return;
        };
        let template = lifecycle.spawn_config().vehicle_template.clone();
        let records = lifecycle.records().clone();

        let stale: Vec<EntityHandle> = self
            .instances
            .keys()
            .filter(|e| records.by_entity(**e).is_none())
            .copied()
            .collect();
        for entity in stale {
            self.instances.remove(&entity);
            self.physics.destroy_body(entity);
            if let Some(input) = self.session.input_mut() {
                input.forget(entity);
            }
            info!(%entity, "Vehicle instance destroyed");
        }

        for record in records.iter() {
            if self.instances.contains_key(&record.entity) {
                continue;
            }
            match self.physics.create_body(record.entity, &template, record.pose) {
                Ok(()) => {
                    self.instances.insert(record.entity, VehicleSimState::default());
                    info!(entity = %record.entity, participant = %record.participant, "Vehicle instance created");
                }
                Err(e) => warn!(entity = %record.entity, error = %e, "Vehicle instance not created"),
            }
        }
    }

    /// Pushes changed tuning cvars into the controller and input channel.
    fn apply_cvars(&mut self) {
        for name in self.console.take_changed() {
            let Some(value) = self.console.get_float(&name) else {
                continue;
            };
            let value = value as f32;
            let cfg = self.controller.config_mut();
            match name.as_str() {
                "veh_max_torque" => cfg.max_motor_torque = value.max(0.0),
                "veh_max_steer" => cfg.max_steer_angle = value.clamp(0.0, 90.0),
                "veh_max_brake" => cfg.max_brake_torque = value.max(0.0),
                "veh_anti_roll" => cfg.anti_roll = value.max(0.0),
                "in_smoothing" => {
                    if let Some(input) = self.session.input_mut() {
                        input.smoother_mut().set_factor(value.clamp(0.0, 0.99));
                    }
                }
                _ => continue,
            }
            info!(cvar = %name, value, "Tuning applied");
        }
    }

    /// Executes a console line.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let cmd = line.split_whitespace().next().unwrap_or("");
        match cmd {
            "status" => Ok(self.status_lines()),
            "cars" => Ok(self.car_lines()),
            "help" => {
                let mut names = self.console.command_names();
                names.extend(["status", "cars", "quit"]);
                names.sort_unstable();
                Ok(vec![format!("Commands: {}", names.join(", "))])
            }
            "quit" | "exit" => {
                info!("Node shutting down");
                self.quit = true;
                Ok(Vec::new())
            }
            "" => Ok(Vec::new()),
            _ => {
                let out = self.console.exec(line)?;
                self.apply_cvars();
                Ok(out)
            }
        }
    }

    fn status_lines(&self) -> Vec<String> {
        let d = self.diagnostics();
        let mut out = vec![
            format!("Tick: {}", d.tick),
            format!("Room: {} ({:?})", d.room.as_deref().unwrap_or("-"), d.mode),
            format!(
                "Local: {} authority={}",
                d.local.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                d.is_authority
            ),
            format!("Participants: {}  Vehicles: {}", d.active_participants, d.records),
        ];
        for (p, rtt) in &d.round_trips {
            match rtt {
                Some(rtt) => out.push(format!("  {}: rtt={}ms", p, rtt.as_millis())),
                None => out.push(format!("  {}: rtt=?", p)),
            }
        }
        out
    }

    fn car_lines(&self) -> Vec<String> {
        let vehicles = self.vehicles();
        if vehicles.is_empty() {
            return vec!["No vehicles".to_string()];
        }
        vehicles
            .iter()
            .map(|r| {
                let pos = self.vehicle_position(r.entity).unwrap_or(r.pose.position);
                let state = self.instances.get(&r.entity);
                format!(
                    "  {} driver={} pos=({:.1}, {:.1}, {:.1}) speed={:.1} mode={:?}",
                    r.entity,
                    r.participant,
                    pos.x,
                    pos.y,
                    pos.z,
                    state.map(|s| s.speed()).unwrap_or(0.0),
                    state.and_then(|s| s.drive_mode),
                )
            })
            .collect()
    }
}

/// Loads a node config from a JSON file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<EngineConfig> {
    use anyhow::Context;

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg = EngineConfig::from_json_str(&text).context("parse config")?;
    if let Err(e) = cfg.validate() {
        bail!("invalid config {}: {}", path.display(), e);
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use netrace_shared::{fabric::LoopbackHub, physics::KinematicPhysics};

    use super::*;
    use crate::input::NeutralInput;

    fn node(hub: &LoopbackHub) -> RaceNode {
        RaceNode::new(
            EngineConfig::default(),
            Arc::new(hub.endpoint()),
            Box::new(KinematicPhysics::default()),
            Box::new(NeutralInput),
        )
        .unwrap()
    }

    #[test]
    fn unknown_template_is_rejected() {
        let hub = LoopbackHub::default();
        let mut cfg = EngineConfig::default();
        cfg.spawn.vehicle_template = "truck".into();
        let err = RaceNode::new(
            cfg,
            Arc::new(hub.endpoint()),
            Box::new(KinematicPhysics::default()),
            Box::new(NeutralInput),
        )
        .err();
        assert_eq!(err, Some(ConfigError::MissingVehicleTemplate("truck".into())));
    }

    #[tokio::test]
    async fn console_tuning_reaches_controller() {
        let hub = LoopbackHub::default();
        let mut node = node(&hub);
        node.start_as_authority(4).await.unwrap();

        node.exec_console("veh_max_torque 900").unwrap();
        assert_eq!(node.controller.config().max_motor_torque, 900.0);
        assert!(node.exec_console("sv_tickrate 10").is_err());
    }

    #[tokio::test]
    async fn status_and_cars_describe_session() {
        let hub = LoopbackHub::default();
        let mut node = node(&hub);
        node.start_as_authority(4).await.unwrap();
        hub.advance_tick();
        node.step(1.0 / 60.0);

        let status = node.exec_console("status").unwrap();
        assert_eq!(status[0], "Tick: 1");
        assert!(status.iter().any(|l| l.contains("authority=true")));

        let cars = node.exec_console("cars").unwrap();
        assert_eq!(cars.len(), 1);
        assert!(cars[0].contains("driver=P1"));
    }

    #[tokio::test]
    async fn shutdown_drops_instances() {
        let hub = LoopbackHub::default();
        let mut node = node(&hub);
        node.start_as_authority(4).await.unwrap();
        let entity = node.vehicles()[0].entity;
        assert!(node.vehicle_position(entity).is_some());

        node.shutdown();
        node.shutdown();
        assert!(node.vehicle_position(entity).is_none());
        assert!(hub.members("GameRoom").is_empty());
    }
}
