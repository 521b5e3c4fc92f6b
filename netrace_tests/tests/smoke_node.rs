use std::sync::Arc;

use netrace_node::{input::ScriptedInput, RaceNode};
use netrace_shared::{config::EngineConfig, fabric::LoopbackHub, physics::KinematicPhysics};

/// Smoke test: a lone node runs a scripted lap without panicking.
#[tokio::test]
async fn node_runs_demo_lap() -> anyhow::Result<()> {
    let cfg = EngineConfig::default();
    let hub = LoopbackHub::new(cfg.session.max_records);
    let mut node = RaceNode::new(
        cfg.clone(),
        Arc::new(hub.endpoint()),
        Box::new(KinematicPhysics::default()),
        Box::new(ScriptedInput::demo_lap(cfg.session.tick_hz)),
    )?;
    node.start_as_authority(cfg.session.max_participants).await?;

    for _ in 0..(cfg.session.tick_hz * 8) {
        hub.advance_tick();
        node.step(cfg.tick_dt());
    }

    let car = node.vehicles()[0].entity;
    assert!(node.sim_state(car).is_some());
    assert_eq!(node.exec_console("cars")?.len(), 1);
    node.shutdown();
    Ok(())
}
