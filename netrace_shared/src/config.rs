//! Configuration system.
//!
//! Loads node configuration from JSON strings (file IO left to the app).
//! Every field has a default so partial documents are valid.

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, math::Vec3};

/// How authority over the vehicle registry is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionMode {
    /// One fixed authority node: whoever started the session.
    Authoritative,
    /// Authority is elected among peers and migrates when the holder leaves.
    #[default]
    SharedAuthority,
}

/// Spawn placement pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SpawnPattern {
    #[default]
    Line,
    Circle,
    Grid,
}

/// Session-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub mode: SessionMode,
    /// Room joined when no explicit session id is given.
    #[serde(default = "default_room")]
    pub room: String,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Upper bound on session start/join latency.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Maximum entries in the replicated vehicle record set.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

/// Where and how vehicles are placed when spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfig {
    #[serde(default)]
    pub pattern: SpawnPattern,
    #[serde(default = "default_spacing")]
    pub spacing: f32,
    /// Circle pattern radius.
    #[serde(default = "default_spacing")]
    pub radius: f32,
    #[serde(default = "default_spawn_height")]
    pub height: f32,
    #[serde(default)]
    pub center: Vec3,
    /// Physics template instantiated for every vehicle.
    #[serde(default = "default_vehicle_template")]
    pub vehicle_template: String,
}

/// Vehicle dynamics tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleConfig {
    #[serde(default = "default_motor_torque")]
    pub max_motor_torque: f32,
    /// Degrees.
    #[serde(default = "default_steer_angle")]
    pub max_steer_angle: f32,
    #[serde(default = "default_brake_torque")]
    pub max_brake_torque: f32,
    #[serde(default = "default_idle_brake")]
    pub idle_brake_torque: f32,
    #[serde(default = "default_deadzone")]
    pub deadzone: f32,
    /// Rear wheel rpm beyond which the vehicle counts as moving.
    #[serde(default = "default_reverse_rpm")]
    pub reverse_rpm_threshold: f32,
    #[serde(default = "default_anti_roll")]
    pub anti_roll: f32,
}

/// Input sampling settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Low-pass factor in [0, 1); 0 disables smoothing.
    #[serde(default)]
    pub smoothing: f32,
    /// Future ticks buffered per vehicle before frames are dropped.
    #[serde(default = "default_max_buffered_ticks")]
    pub max_buffered_ticks: u32,
}

/// Root configuration of a race node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub input: InputConfig,
}

fn default_room() -> String {
    "GameRoom".to_string()
}

fn default_max_participants() -> usize {
    4
}

fn default_tick_hz() -> u32 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_records() -> usize {
    10
}

fn default_spacing() -> f32 {
    10.0
}

fn default_spawn_height() -> f32 {
    2.0
}

fn default_vehicle_template() -> String {
    "car".to_string()
}

fn default_motor_torque() -> f32 {
    1500.0
}

fn default_steer_angle() -> f32 {
    30.0
}

fn default_brake_torque() -> f32 {
    5000.0
}

fn default_idle_brake() -> f32 {
    100.0
}

fn default_deadzone() -> f32 {
    0.1
}

fn default_reverse_rpm() -> f32 {
    1.0
}

fn default_anti_roll() -> f32 {
    5000.0
}

fn default_max_buffered_ticks() -> u32 {
    8
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::default(),
            room: default_room(),
            max_participants: default_max_participants(),
            tick_hz: default_tick_hz(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_records: default_max_records(),
        }
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            pattern: SpawnPattern::default(),
            spacing: default_spacing(),
            radius: default_spacing(),
            height: default_spawn_height(),
            center: Vec3::ZERO,
            vehicle_template: default_vehicle_template(),
        }
    }
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            max_motor_torque: default_motor_torque(),
            max_steer_angle: default_steer_angle(),
            max_brake_torque: default_brake_torque(),
            idle_brake_torque: default_idle_brake(),
            deadzone: default_deadzone(),
            reverse_rpm_threshold: default_reverse_rpm(),
            anti_roll: default_anti_roll(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.0,
            max_buffered_ticks: default_max_buffered_ticks(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Checks values that would otherwise fail deep inside a tick.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        if s.tick_hz == 0 {
            return Err(invalid("session.tick_hz", "must be positive"));
        }
        if s.max_participants == 0 {
            return Err(invalid("session.max_participants", "must be positive"));
        }
        if s.max_participants > s.max_records {
            return Err(ConfigError::RecordCapacityExceeded {
                requested: s.max_participants,
                capacity: s.max_records,
            });
        }
        if self.spawn.vehicle_template.is_empty() {
            return Err(ConfigError::MissingVehicleTemplate(String::new()));
        }
        let v = &self.vehicle;
        if !(0.0..1.0).contains(&v.deadzone) {
            return Err(invalid("vehicle.deadzone", "must be in [0, 1)"));
        }
        if v.max_motor_torque < 0.0 || v.max_brake_torque < 0.0 || v.idle_brake_torque < 0.0 {
            return Err(invalid("vehicle", "torques must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.input.smoothing) {
            return Err(invalid("input.smoothing", "must be in [0, 1)"));
        }
        Ok(())
    }

    /// Tick length in seconds.
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.session.tick_hz.max(1) as f32
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
