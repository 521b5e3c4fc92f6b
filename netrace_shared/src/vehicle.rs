//! Vehicle dynamics controller.
//!
//! Turns one tick of input into wheel commands and stabilisation forces:
//! 1. front steer angle proportional to the steering axis;
//! 2. drive/brake decision from rear wheel rpm and the throttle axis;
//! 3. anti-roll forces per axle from suspension compression.
//!
//! The controller never advances the body; the physics step does. Every node
//! runs it for every vehicle it holds, from the same replicated input.

use crate::{
    config::VehicleConfig,
    input::InputFrame,
    math::Vec3,
    net::Tick,
    physics::{VehicleBody, Wheel},
};

/// Outcome of the drive/brake decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Explicit brake flag.
    Brake,
    /// Throttle against the direction of travel: stop before reversing.
    Stopping,
    Drive,
    /// Axis inside the deadzone.
    Idle,
}

/// Torques for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveCommand {
    pub mode: DriveMode,
    /// Applied to each rear wheel.
    pub drive_torque: f32,
    /// Applied to every wheel.
    pub brake_torque: f32,
}

/// Anti-roll result for one axle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxleRoll {
    /// Signed magnitude; positive pushes the left wheel up and the right down.
    pub force: f32,
    pub left_grounded: bool,
    pub right_grounded: bool,
}

/// Per-wheel state produced by the last tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelState {
    pub steer_angle: f32,
    pub drive_torque: f32,
    pub brake_torque: f32,
    pub compression: f32,
    pub grounded: bool,
}

/// Locally owned dynamic state of one vehicle. Never replicated.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleSimState {
    pub tick: Tick,
    pub wheels: [WheelState; 4],
    pub body_velocity: Vec3,
    pub drive_mode: Option<DriveMode>,
    pub front_roll: AxleRoll,
    pub rear_roll: AxleRoll,
}

impl VehicleSimState {
    pub fn wheel(&self, wheel: Wheel) -> &WheelState {
        &self.wheels[wheel.index()]
    }

    pub fn speed(&self) -> f32 {
        self.body_velocity.len()
    }
}

/// Stateless controller; all mutable state lives in `VehicleSimState` and the body.
#[derive(Debug, Clone, Copy)]
pub struct VehicleController {
    cfg: VehicleConfig,
}

impl VehicleController {
    pub fn new(cfg: VehicleConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &VehicleConfig {
        &self.cfg
    }

    pub fn config_mut(&mut self) -> &mut VehicleConfig {
        &mut self.cfg
    }

    /// Front-wheel steer angle in degrees. Linear, speed independent.
    pub fn steer_angle(&self, steering: f32) -> f32 {
        self.cfg.max_steer_angle * steering.clamp(-1.0, 1.0)
    }

    /// Drive/brake decision from the rear wheel's rpm.
    pub fn drive(&self, rpm: f32, frame: &InputFrame) -> DriveCommand {
        let cfg = &self.cfg;
        if frame.brake {
            return DriveCommand {
                mode: DriveMode::Brake,
                drive_torque: 0.0,
                brake_torque: cfg.max_brake_torque,
            };
        }

        let axis = frame.throttle_brake.clamp(-1.0, 1.0);
        if axis.abs() <= cfg.deadzone {
            return DriveCommand {
                mode: DriveMode::Idle,
                drive_torque: 0.0,
                brake_torque: cfg.idle_brake_torque,
            };
        }

        let reversing_while_forward = axis < 0.0 && rpm > cfg.reverse_rpm_threshold;
        let forward_while_reversing = axis > 0.0 && rpm < -cfg.reverse_rpm_threshold;
        if reversing_while_forward || forward_while_reversing {
            DriveCommand {
                mode: DriveMode::Stopping,
                drive_torque: 0.0,
                brake_torque: cfg.max_brake_torque,
            }
        } else {
            DriveCommand {
                mode: DriveMode::Drive,
                drive_torque: cfg.max_motor_torque * axis,
                brake_torque: 0.0,
            }
        }
    }

    /// Anti-roll for one axle. Airborne wheels count as fully extended and
    /// receive no force.
    pub fn anti_roll(&self, left: Option<f32>, right: Option<f32>) -> AxleRoll {
        let comp_left = left.unwrap_or(0.0);
        let comp_right = right.unwrap_or(0.0);
        AxleRoll {
            force: (comp_left - comp_right) * self.cfg.anti_roll,
            left_grounded: left.is_some(),
            right_grounded: right.is_some(),
        }
    }

    /// Runs one tick against `body` and records the result in `state`.
    pub fn step(
        &self,
        tick: Tick,
        frame: &InputFrame,
        body: &mut dyn VehicleBody,
        state: &mut VehicleSimState,
    ) {
        let steer = self.steer_angle(frame.steering);
        body.set_steer_angle(Wheel::FrontLeft, steer);
        body.set_steer_angle(Wheel::FrontRight, steer);

        let cmd = self.drive(body.wheel_rpm(Wheel::RearLeft), frame);
        for wheel in Wheel::ALL {
            let drive = if wheel.is_front() { 0.0 } else { cmd.drive_torque };
            body.set_motor_torque(wheel, drive);
            body.set_brake_torque(wheel, cmd.brake_torque);

            let ws = &mut state.wheels[wheel.index()];
            ws.steer_angle = if wheel.is_front() { steer } else { 0.0 };
            ws.drive_torque = drive;
            ws.brake_torque = cmd.brake_torque;
        }

        state.front_roll = self.apply_anti_roll(body, Wheel::FrontLeft, Wheel::FrontRight, state);
        state.rear_roll = self.apply_anti_roll(body, Wheel::RearLeft, Wheel::RearRight, state);
        state.drive_mode = Some(cmd.mode);
        state.body_velocity = body.velocity();
        state.tick = tick;
    }

    fn apply_anti_roll(
        &self,
        body: &mut dyn VehicleBody,
        left: Wheel,
        right: Wheel,
        state: &mut VehicleSimState,
    ) -> AxleRoll {
        let hit_left = body.ground_hit(left);
        let hit_right = body.ground_hit(right);
        let roll = self.anti_roll(
            hit_left.map(|h| h.compression),
            hit_right.map(|h| h.compression),
        );

        for (wheel, hit, sign) in [(left, hit_left, 1.0), (right, hit_right, -1.0)] {
            let ws = &mut state.wheels[wheel.index()];
            ws.grounded = hit.is_some();
            ws.compression = hit.map(|h| h.compression).unwrap_or(0.0);
            if let Some(hit) = hit {
                let force = body.wheel_up(wheel) * (sign * roll.force);
                body.add_force_at_position(force, hit.point);
            }
        }
        roll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::GroundHit;

    fn controller() -> VehicleController {
        VehicleController::new(VehicleConfig::default())
    }

    fn frame(axis: f32, brake: bool) -> InputFrame {
        InputFrame::new(0.0, axis, brake)
    }

    /// Scripted body that records what the controller did.
    #[derive(Default)]
    struct ProbeBody {
        rpm: f32,
        compression: [Option<f32>; 4],
        steer: [f32; 4],
        motor: [f32; 4],
        brake: [f32; 4],
        forces: Vec<(Vec3, Vec3)>,
    }

    impl VehicleBody for ProbeBody {
        fn wheel_rpm(&self, _wheel: Wheel) -> f32 {
            self.rpm
        }
        fn ground_hit(&self, wheel: Wheel) -> Option<GroundHit> {
            self.compression[wheel.index()].map(|compression| GroundHit {
                compression,
                point: Vec3::new(wheel.index() as f32, 0.0, 0.0),
            })
        }
        fn wheel_up(&self, _wheel: Wheel) -> Vec3 {
            Vec3::UP
        }
        fn position(&self) -> Vec3 {
            Vec3::ZERO
        }
        fn velocity(&self) -> Vec3 {
            Vec3::ZERO
        }
        fn set_steer_angle(&mut self, wheel: Wheel, degrees: f32) {
            self.steer[wheel.index()] = degrees;
        }
        fn set_motor_torque(&mut self, wheel: Wheel, torque: f32) {
            self.motor[wheel.index()] = torque;
        }
        fn set_brake_torque(&mut self, wheel: Wheel, torque: f32) {
            self.brake[wheel.index()] = torque;
        }
        fn add_force_at_position(&mut self, force: Vec3, position: Vec3) {
            self.forces.push((force, position));
        }
    }

    #[test]
    fn reverse_throttle_while_rolling_forward_brakes() {
        let cmd = controller().drive(10.0, &frame(-1.0, false));
        assert_eq!(cmd.mode, DriveMode::Stopping);
        assert_eq!(cmd.drive_torque, 0.0);
        assert_eq!(cmd.brake_torque, 5000.0);
    }

    #[test]
    fn forward_throttle_while_rolling_backward_brakes() {
        let cmd = controller().drive(-10.0, &frame(1.0, false));
        assert_eq!(cmd.mode, DriveMode::Stopping);
        assert_eq!(cmd.drive_torque, 0.0);
        assert_eq!(cmd.brake_torque, 5000.0);
    }

    #[test]
    fn half_throttle_from_rest_drives() {
        let cmd = controller().drive(0.0, &frame(0.5, false));
        assert_eq!(cmd.mode, DriveMode::Drive);
        assert_eq!(cmd.drive_torque, 750.0);
        assert_eq!(cmd.brake_torque, 0.0);
    }

    #[test]
    fn reverse_from_rest_drives_backwards() {
        let cmd = controller().drive(0.5, &frame(-1.0, false));
        assert_eq!(cmd.mode, DriveMode::Drive);
        assert_eq!(cmd.drive_torque, -1500.0);
    }

    #[test]
    fn released_axis_applies_idle_brake() {
        for axis in [0.0, 0.05, -0.1] {
            let cmd = controller().drive(30.0, &frame(axis, false));
            assert_eq!(cmd.mode, DriveMode::Idle);
            assert_eq!(cmd.drive_torque, 0.0);
            assert_eq!(cmd.brake_torque, 100.0);
        }
    }

    #[test]
    fn brake_flag_overrides_axis() {
        for (rpm, axis) in [(0.0, 1.0), (50.0, -1.0), (-5.0, 0.0)] {
            let cmd = controller().drive(rpm, &frame(axis, true));
            assert_eq!(cmd.mode, DriveMode::Brake);
            assert_eq!(cmd.drive_torque, 0.0);
            assert_eq!(cmd.brake_torque, 5000.0);
        }
    }

    #[test]
    fn anti_roll_pushes_extended_side_down() {
        let roll = controller().anti_roll(Some(0.8), Some(0.2));
        assert!((roll.force - 0.6 * 5000.0).abs() < 1e-2);

        let mut body = ProbeBody {
            compression: [Some(0.8), Some(0.2), None, None],
            ..ProbeBody::default()
        };
        let mut state = VehicleSimState::default();
        controller().step(1, &InputFrame::NEUTRAL, &mut body, &mut state);

        assert_eq!(body.forces.len(), 2);
        let (left_force, _) = body.forces[0];
        let (right_force, _) = body.forces[1];
        assert!(left_force.y > 0.0);
        assert!(right_force.y < 0.0);
        assert!((right_force.y + 3000.0).abs() < 1e-2);
        assert!(!state.wheel(Wheel::RearLeft).grounded);
    }

    #[test]
    fn airborne_wheel_gets_no_force_but_counts_as_extended() {
        let roll = controller().anti_roll(Some(0.5), None);
        assert!((roll.force - 2500.0).abs() < 1e-2);
        assert!(roll.left_grounded && !roll.right_grounded);
    }

    #[test]
    fn step_steers_front_and_drives_rear_only() {
        let mut body = ProbeBody::default();
        let mut state = VehicleSimState::default();
        let input = InputFrame::new(-0.5, 1.0, false);
        controller().step(3, &input, &mut body, &mut state);

        assert_eq!(body.steer, [-15.0, -15.0, 0.0, 0.0]);
        assert_eq!(body.motor, [0.0, 0.0, 1500.0, 1500.0]);
        assert_eq!(body.brake, [0.0; 4]);
        assert_eq!(state.tick, 3);
        assert_eq!(state.drive_mode, Some(DriveMode::Drive));
        assert_eq!(state.wheel(Wheel::FrontLeft).steer_angle, -15.0);
    }
}
