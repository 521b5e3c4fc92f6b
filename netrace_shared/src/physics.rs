//! Physics abstraction.
//!
//! The rigid-body engine is a collaborator. The dynamics controller only needs
//! the four-wheel view in [`VehicleBody`]; a node owns one [`PhysicsBackend`]
//! that creates, steps and destroys bodies.
//!
//! [`KinematicPhysics`] is a small deterministic backend: bicycle-model
//! steering, torque-driven longitudinal speed and a one-degree-of-freedom body
//! roll that drives suspension compression. Enough to run and test the core,
//! not a general physics engine.

use std::{collections::BTreeMap, f32::consts::PI};

use crate::{
    error::ConfigError,
    math::{Quat, Vec3},
    net::EntityHandle,
    records::SpawnPose,
};

const GRAVITY: f32 = 9.81;

/// Wheel position on the chassis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wheel {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
}

impl Wheel {
    pub const ALL: [Wheel; 4] = [
        Wheel::FrontLeft,
        Wheel::FrontRight,
        Wheel::RearLeft,
        Wheel::RearRight,
    ];

    pub fn index(self) -> usize {
        match self {
            Wheel::FrontLeft => 0,
            Wheel::FrontRight => 1,
            Wheel::RearLeft => 2,
            Wheel::RearRight => 3,
        }
    }

    pub fn is_front(self) -> bool {
        matches!(self, Wheel::FrontLeft | Wheel::FrontRight)
    }

    pub fn is_left(self) -> bool {
        matches!(self, Wheel::FrontLeft | Wheel::RearLeft)
    }
}

/// Ground contact of one wheel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundHit {
    /// 0 = fully extended, 1 = fully compressed.
    pub compression: f32,
    pub point: Vec3,
}

/// Four-wheel body as seen by the dynamics controller.
pub trait VehicleBody {
    fn wheel_rpm(&self, wheel: Wheel) -> f32;
    /// `None` when the wheel is airborne.
    fn ground_hit(&self, wheel: Wheel) -> Option<GroundHit>;
    /// Up axis of the wheel's suspension, world space.
    fn wheel_up(&self, wheel: Wheel) -> Vec3;
    fn position(&self) -> Vec3;
    fn velocity(&self) -> Vec3;

    fn set_steer_angle(&mut self, wheel: Wheel, degrees: f32);
    fn set_motor_torque(&mut self, wheel: Wheel, torque: f32);
    fn set_brake_torque(&mut self, wheel: Wheel, torque: f32);
    fn add_force_at_position(&mut self, force: Vec3, position: Vec3);
}

/// Physics engine owned by one node.
pub trait PhysicsBackend: Send {
    fn has_template(&self, template: &str) -> bool;
    fn create_body(
        &mut self,
        entity: EntityHandle,
        template: &str,
        pose: SpawnPose,
    ) -> Result<(), ConfigError>;
    /// Returns false if no such body existed.
    fn destroy_body(&mut self, entity: EntityHandle) -> bool;
    fn body(&self, entity: EntityHandle) -> Option<&dyn VehicleBody>;
    fn body_mut(&mut self, entity: EntityHandle) -> Option<&mut dyn VehicleBody>;
    fn step(&mut self, dt_sec: f32);
}

/// Chassis parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyTemplate {
    pub mass: f32,
    pub wheel_radius: f32,
    pub half_track: f32,
    pub half_wheelbase: f32,
    /// Compression of a level car at rest.
    pub rest_compression: f32,
    /// Body roll (compression delta) per m/s² of lateral acceleration.
    pub roll_per_accel: f32,
}

impl Default for BodyTemplate {
    fn default() -> Self {
        Self {
            mass: 1500.0,
            wheel_radius: 0.35,
            half_track: 0.8,
            half_wheelbase: 1.3,
            rest_compression: 0.5,
            roll_per_accel: 0.03,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WheelInputs {
    steer_deg: f32,
    motor: f32,
    brake: f32,
}

/// Body simulated by [`KinematicPhysics`].
#[derive(Debug, Clone)]
pub struct KinematicBody {
    template: BodyTemplate,
    position: Vec3,
    yaw: f32,
    /// Signed speed along the heading.
    speed: f32,
    /// Positive rolls onto the left side.
    roll: f32,
    wheels: [WheelInputs; 4],
    /// Roll moment from forces added since the last step.
    pending_roll_moment: f32,
}

impl KinematicBody {
    fn new(template: BodyTemplate, pose: SpawnPose) -> Self {
        Self {
            template,
            position: pose.position,
            yaw: pose.rotation.yaw(),
            speed: 0.0,
            roll: 0.0,
            wheels: [WheelInputs::default(); 4],
            pending_roll_moment: 0.0,
        }
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    fn forward(&self) -> Vec3 {
        Quat::from_yaw(self.yaw).rotate(Vec3::FORWARD)
    }

    fn wheel_offset(&self, wheel: Wheel) -> Vec3 {
        let t = &self.template;
        let x = if wheel.is_left() { -t.half_track } else { t.half_track };
        let z = if wheel.is_front() { t.half_wheelbase } else { -t.half_wheelbase };
        Quat::from_yaw(self.yaw).rotate(Vec3::new(x, 0.0, z))
    }

    fn compression(&self, wheel: Wheel) -> f32 {
        let side = if wheel.is_left() { 1.0 } else { -1.0 };
        (self.template.rest_compression + side * self.roll).clamp(0.0, 1.0)
    }

    fn step(&mut self, dt: f32) {
        let t = self.template;
        let drive: f32 = self.wheels.iter().map(|w| w.motor).sum::<f32>() / t.wheel_radius;
        let brake: f32 = self.wheels.iter().map(|w| w.brake).sum::<f32>() / t.wheel_radius;

        self.speed += drive / t.mass * dt;
        // Brakes oppose motion and never reverse it.
        let brake_dv = brake / t.mass * dt;
        if self.speed.abs() <= brake_dv {
            self.speed = 0.0;
        } else {
            self.speed -= brake_dv * self.speed.signum();
        }

        let steer = (self.wheels[Wheel::FrontLeft.index()].steer_deg
            + self.wheels[Wheel::FrontRight.index()].steer_deg)
            * 0.5;
        let yaw_rate = self.speed * steer.to_radians().tan() / (2.0 * t.half_wheelbase);
        self.yaw += yaw_rate * dt;
        self.position += self.forward() * (self.speed * dt);

        // Roll follows lateral acceleration; anti-roll moment pulls it back.
        let target = self.speed * yaw_rate * t.roll_per_accel;
        let restoring = self.pending_roll_moment / (t.mass * GRAVITY * t.half_track);
        self.roll += (target - self.roll) * (dt * 8.0).min(1.0) - restoring * dt;
        self.roll = self.roll.clamp(-t.rest_compression, 1.0 - t.rest_compression);
        self.pending_roll_moment = 0.0;
    }
}

impl VehicleBody for KinematicBody {
    fn wheel_rpm(&self, _wheel: Wheel) -> f32 {
        self.speed / (2.0 * PI * self.template.wheel_radius) * 60.0
    }

    fn ground_hit(&self, wheel: Wheel) -> Option<GroundHit> {
        let point = self.position + self.wheel_offset(wheel)
            - Vec3::UP * self.template.wheel_radius;
        Some(GroundHit {
            compression: self.compression(wheel),
            point,
        })
    }

    fn wheel_up(&self, _wheel: Wheel) -> Vec3 {
        Vec3::UP
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn velocity(&self) -> Vec3 {
        self.forward() * self.speed
    }

    fn set_steer_angle(&mut self, wheel: Wheel, degrees: f32) {
        self.wheels[wheel.index()].steer_deg = degrees;
    }

    fn set_motor_torque(&mut self, wheel: Wheel, torque: f32) {
        self.wheels[wheel.index()].motor = torque;
    }

    fn set_brake_torque(&mut self, wheel: Wheel, torque: f32) {
        self.wheels[wheel.index()].brake = torque.max(0.0);
    }

    fn add_force_at_position(&mut self, force: Vec3, position: Vec3) {
        // Lever arm across the body: positive on the left side.
        let right = Quat::from_yaw(self.yaw).rotate(Vec3::new(1.0, 0.0, 0.0));
        let lever = -(position - self.position).dot(right);
        self.pending_roll_moment += force.y * lever;
    }
}

/// Deterministic in-process backend.
pub struct KinematicPhysics {
    templates: BTreeMap<String, BodyTemplate>,
    bodies: BTreeMap<EntityHandle, KinematicBody>,
}

impl Default for KinematicPhysics {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert("car".to_string(), BodyTemplate::default());
        Self {
            templates,
            bodies: BTreeMap::new(),
        }
    }
}

impl KinematicPhysics {
    pub fn kinematic_body(&self, entity: EntityHandle) -> Option<&KinematicBody> {
        self.bodies.get(&entity)
    }

    pub fn kinematic_body_mut(&mut self, entity: EntityHandle) -> Option<&mut KinematicBody> {
        self.bodies.get_mut(&entity)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl PhysicsBackend for KinematicPhysics {
    fn has_template(&self, template: &str) -> bool {
        self.templates.contains_key(template)
    }

    fn create_body(
        &mut self,
        entity: EntityHandle,
        template: &str,
        pose: SpawnPose,
    ) -> Result<(), ConfigError> {
        let params = self
            .templates
            .get(template)
            .copied()
            .ok_or_else(|| ConfigError::MissingVehicleTemplate(template.to_string()))?;
        self.bodies.insert(entity, KinematicBody::new(params, pose));
        Ok(())
    }

    fn destroy_body(&mut self, entity: EntityHandle) -> bool {
        self.bodies.remove(&entity).is_some()
    }

    fn body(&self, entity: EntityHandle) -> Option<&dyn VehicleBody> {
        self.bodies.get(&entity).map(|b| b as &dyn VehicleBody)
    }

    fn body_mut(&mut self, entity: EntityHandle) -> Option<&mut dyn VehicleBody> {
        self.bodies
            .get_mut(&entity)
            .map(|b| b as &mut dyn VehicleBody)
    }

    fn step(&mut self, dt_sec: f32) {
        for body in self.bodies.values_mut() {
            body.step(dt_sec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 60.0;

    fn spawn() -> (KinematicPhysics, EntityHandle) {
        let mut physics = KinematicPhysics::default();
        let e = EntityHandle(1);
        physics.create_body(e, "car", SpawnPose::default()).unwrap();
        (physics, e)
    }

    #[test]
    fn unknown_template_is_config_error() {
        let mut physics = KinematicPhysics::default();
        assert_eq!(
            physics.create_body(EntityHandle(1), "truck", SpawnPose::default()),
            Err(ConfigError::MissingVehicleTemplate("truck".into()))
        );
    }

    #[test]
    fn motor_torque_accelerates_and_spins_wheels() {
        let (mut physics, e) = spawn();
        let body = physics.body_mut(e).unwrap();
        body.set_motor_torque(Wheel::RearLeft, 1500.0);
        body.set_motor_torque(Wheel::RearRight, 1500.0);
        for _ in 0..60 {
            physics.step(DT);
        }
        let body = physics.body(e).unwrap();
        assert!(body.velocity().z > 1.0);
        assert!(body.wheel_rpm(Wheel::RearLeft) > 10.0);
        assert!(body.position().z > 0.0);
    }

    #[test]
    fn brakes_stop_without_reversing() {
        let (mut physics, e) = spawn();
        physics.kinematic_body_mut(e).unwrap().speed = 3.0;
        let body = physics.body_mut(e).unwrap();
        for w in Wheel::ALL {
            body.set_brake_torque(w, 5000.0);
        }
        for _ in 0..120 {
            physics.step(DT);
        }
        assert_eq!(physics.kinematic_body(e).unwrap().speed(), 0.0);
    }

    #[test]
    fn cornering_rolls_the_body() {
        let (mut physics, e) = spawn();
        physics.kinematic_body_mut(e).unwrap().speed = 15.0;
        let body = physics.body_mut(e).unwrap();
        body.set_steer_angle(Wheel::FrontLeft, 20.0);
        body.set_steer_angle(Wheel::FrontRight, 20.0);
        for _ in 0..30 {
            physics.step(DT);
        }
        let body = physics.body(e).unwrap();
        let left = body.ground_hit(Wheel::FrontLeft).unwrap().compression;
        let right = body.ground_hit(Wheel::FrontRight).unwrap().compression;
        assert!(left > right);
        assert!(physics.kinematic_body(e).unwrap().yaw() > 0.0);
    }
}
