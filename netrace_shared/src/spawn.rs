//! Spawn placement patterns.
//!
//! Line and Grid poses depend only on a participant's ordinal. Circle poses
//! also depend on how many participants are active when the spawn runs, so a
//! participant's slot can move if others join or leave first.

use crate::{
    config::{SpawnConfig, SpawnPattern},
    math::{Quat, Vec3},
    net::ParticipantId,
    records::SpawnPose,
};

/// Ordinal of `participant` among the active participants sorted by id.
///
/// A participant missing from the list (its join raced the membership view)
/// takes the slot after the last active one.
pub fn ordinal(participant: ParticipantId, active: &[ParticipantId]) -> usize {
    let mut sorted = active.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    match sorted.binary_search(&participant) {
        Ok(i) => i,
        Err(_) => sorted.len(),
    }
}

/// Computes the pose for the participant at `index` of `active_count`.
pub fn spawn_pose(cfg: &SpawnConfig, index: usize, active_count: usize) -> SpawnPose {
    match cfg.pattern {
        SpawnPattern::Line => SpawnPose {
            position: cfg.center + Vec3::new(index as f32 * cfg.spacing, cfg.height, 0.0),
            rotation: Quat::IDENTITY,
        },
        SpawnPattern::Circle => {
            let slots = active_count.max(2) as f32;
            let radians = (360.0 / slots * index as f32).to_radians();
            let position = cfg.center
                + Vec3::new(
                    radians.cos() * cfg.radius,
                    cfg.height,
                    radians.sin() * cfg.radius,
                );
            SpawnPose {
                position,
                rotation: Quat::look_rotation_flat(cfg.center - position),
            }
        }
        SpawnPattern::Grid => {
            let side = (active_count.max(1) as f32).sqrt().ceil() as usize;
            let row = index / side;
            let col = index % side;
            SpawnPose {
                position: cfg.center
                    + Vec3::new(col as f32 * cfg.spacing, cfg.height, row as f32 * cfg.spacing),
                rotation: Quat::IDENTITY,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pattern: SpawnPattern) -> SpawnConfig {
        SpawnConfig {
            pattern,
            ..SpawnConfig::default()
        }
    }

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).len() < 1e-3
    }

    #[test]
    fn ordinal_sorts_and_appends_unknown() {
        let active = [ParticipantId(9), ParticipantId(2), ParticipantId(5)];
        assert_eq!(ordinal(ParticipantId(2), &active), 0);
        assert_eq!(ordinal(ParticipantId(9), &active), 2);
        assert_eq!(ordinal(ParticipantId(7), &active), 3);
    }

    #[test]
    fn line_spaces_along_x() {
        let c = cfg(SpawnPattern::Line);
        assert_eq!(spawn_pose(&c, 0, 2).position, Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(spawn_pose(&c, 1, 2).position, Vec3::new(10.0, 2.0, 0.0));
        assert_eq!(spawn_pose(&c, 1, 2).rotation, Quat::IDENTITY);
    }

    #[test]
    fn grid_wraps_rows_at_square_side() {
        let c = cfg(SpawnPattern::Grid);
        // 5 active -> side 3.
        assert_eq!(spawn_pose(&c, 2, 5).position, Vec3::new(20.0, 2.0, 0.0));
        assert_eq!(spawn_pose(&c, 3, 5).position, Vec3::new(0.0, 2.0, 10.0));
    }

    #[test]
    fn circle_faces_center() {
        let c = cfg(SpawnPattern::Circle);
        let pose = spawn_pose(&c, 1, 2);
        assert!(close(pose.position, Vec3::new(-10.0, 2.0, 0.0)));
        let facing = pose.rotation.rotate(Vec3::FORWARD);
        assert!(close(facing, Vec3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn circle_pose_shifts_with_active_count() {
        let c = cfg(SpawnPattern::Circle);
        let with_two = spawn_pose(&c, 1, 2).position;
        let with_four = spawn_pose(&c, 1, 4).position;
        assert!(!close(with_two, with_four));
    }
}
