//! Authority faults: two nodes that both believe they are authority, and a
//! room with no authority at all.

use std::sync::Arc;

use netrace_node::{input::NeutralInput, RaceNode};
use netrace_shared::{
    config::{EngineConfig, SessionMode},
    fabric::LoopbackHub,
    physics::KinematicPhysics,
};

fn node(hub: &LoopbackHub, mode: SessionMode) -> anyhow::Result<RaceNode> {
    let mut cfg = EngineConfig::default();
    cfg.session.mode = mode;
    Ok(RaceNode::new(
        cfg,
        Arc::new(hub.endpoint()),
        Box::new(KinematicPhysics::default()),
        Box::new(NeutralInput),
    )?)
}

fn run_ticks(hub: &LoopbackHub, nodes: &mut [&mut RaceNode], ticks: u32) {
    for _ in 0..ticks {
        hub.advance_tick();
        for node in nodes.iter_mut() {
            node.begin_tick();
        }
        for node in nodes.iter_mut() {
            node.simulate_tick(1.0 / 60.0);
        }
    }
}

#[tokio::test]
async fn dual_authority_converges_on_one_record() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();

    let hub = LoopbackHub::default();
    let mut a = node(&hub, SessionMode::SharedAuthority)?;
    let mut b = node(&hub, SessionMode::SharedAuthority)?;
    let mut c = node(&hub, SessionMode::SharedAuthority)?;

    a.start_as_authority(4).await?;
    b.join().await?;
    run_ticks(&hub, &mut [&mut a, &mut b], 1);

    let pa = a.session().local_participant().unwrap();
    let pb = b.session().local_participant().unwrap();
    hub.force_authority(&[pa, pb]);
    assert!(a.is_authority() && b.is_authority());

    c.join().await?;
    let pc = c.session().local_participant().unwrap();
    run_ticks(&hub, &mut [&mut a, &mut b, &mut c], 2);

    let mut chosen = None;
    for n in [&a, &b, &c] {
        let for_c: Vec<_> = n
            .vehicles()
            .into_iter()
            .filter(|r| r.participant == pc)
            .collect();
        assert_eq!(for_c.len(), 1, "exactly one record for the joiner");
        let entity = for_c[0].entity;
        assert_eq!(*chosen.get_or_insert(entity), entity, "replicas disagree");
        assert_eq!(n.vehicles().len(), 3);
    }

    // Lower (created tick, handle) wins: the record allocated by `a`.
    assert_eq!(chosen.map(|e| e.allocator()), Some(pa));
    Ok(())
}

#[tokio::test]
async fn no_authority_means_no_registry_writes() -> anyhow::Result<()> {
    let hub = LoopbackHub::default();
    let mut host = node(&hub, SessionMode::Authoritative)?;
    let mut peer = node(&hub, SessionMode::Authoritative)?;
    let mut late = node(&hub, SessionMode::Authoritative)?;

    host.start_as_authority(4).await?;
    peer.join().await?;
    run_ticks(&hub, &mut [&mut host, &mut peer], 1);
    let before = peer.vehicles();
    assert_eq!(before.len(), 2);

    host.shutdown();
    late.join().await?;
    run_ticks(&hub, &mut [&mut peer, &mut late], 2);

    // The host is gone and nobody else may take over: the stale host record
    // stays and the late joiner gets no vehicle.
    assert!(!peer.is_authority());
    assert!(!late.is_authority());
    assert_eq!(peer.vehicles(), before);
    assert_eq!(late.vehicles(), before);
    assert!(!late
        .vehicles()
        .iter()
        .any(|r| Some(r.participant) == late.session().local_participant()));
    Ok(())
}
